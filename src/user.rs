//! Registration, membership and bans.
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::authorize,
    checksum,
    error::{ConflictReason, Entity, Error, ForbiddenReason, Result},
    models::{User, VoteRecord},
    state::AppState,
    storage::{Store, StoreTx},
};

/// The user, if registered in `lecture_id` and not banned.
pub(crate) async fn require_member<T: StoreTx>(
    tx: &mut T,
    user_id: i64,
    lecture_id: Uuid,
) -> Result<User> {
    let Some(user) = tx.get_user_in_lecture(user_id, lecture_id).await? else {
        return Err(match tx.get_user(user_id).await? {
            Some(_) => Error::Forbidden(ForbiddenReason::NotMember),
            None => Error::NotFound(Entity::User),
        });
    };
    if user.is_banned_from(lecture_id) {
        return Err(Error::Forbidden(ForbiddenReason::Banned));
    }
    Ok(user)
}

impl<S: Store> AppState<S> {
    /// Binds `user_id` to the lecture. Ids are minted by clients, so the
    /// fingerprint decides whether a known id is the same device rejoining or
    /// a collision.
    pub async fn register_user(
        &self,
        lecture_id: Uuid,
        user_id: i64,
        name: &str,
        fingerprint: &str,
    ) -> Result<User> {
        if !checksum::is_valid(user_id) {
            return Err(Error::InvalidInput(format!(
                "user id {user_id} fails its check digit"
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("name must not be empty".into()));
        }
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty() {
            return Err(Error::InvalidInput("fingerprint must not be empty".into()));
        }

        let mut tx = self.store.begin().await?;
        if tx.get_lecture(lecture_id).await?.is_none() {
            return Err(Error::NotFound(Entity::Lecture));
        }

        let user = match tx.get_user(user_id).await? {
            Some(existing) if existing.fingerprint != fingerprint => {
                return Err(Error::Conflict(ConflictReason::DuplicateUser));
            }
            Some(existing) => User {
                name: name.to_string(),
                lecture_id,
                ..existing
            },
            None => {
                let registered = tx.count_users_by_fingerprint(fingerprint).await?;
                if registered >= self.config.max_users_per_ip {
                    return Err(Error::Conflict(ConflictReason::IpLimitReached));
                }
                User {
                    id: user_id,
                    name: name.to_string(),
                    fingerprint: fingerprint.to_string(),
                    lecture_id,
                    banned: false,
                    banned_by: None,
                }
            }
        };

        tx.save_user(&user).await?;
        tx.commit().await?;

        debug!(user_id, %lecture_id, "user joined lecture");
        Ok(user)
    }

    pub async fn ban_user(&self, lecture_id: Uuid, key: &str, user_id: i64) -> Result<User> {
        self.set_banned(lecture_id, key, user_id, true).await
    }

    pub async fn unban_user(&self, lecture_id: Uuid, key: &str, user_id: i64) -> Result<User> {
        self.set_banned(lecture_id, key, user_id, false).await
    }

    async fn set_banned(
        &self,
        lecture_id: Uuid,
        key: &str,
        user_id: i64,
        banned: bool,
    ) -> Result<User> {
        let mut tx = self.store.begin().await?;
        authorize(&mut tx, lecture_id, key).await?;

        let mut user = match tx.get_user_in_lecture(user_id, lecture_id).await? {
            Some(user) => user,
            None if tx.get_user(user_id).await?.is_some() => {
                return Err(Error::Forbidden(ForbiddenReason::NotMember));
            }
            None => return Err(Error::NotFound(Entity::User)),
        };
        if !banned && user.banned && user.banned_by != Some(lecture_id) {
            // Another lecture's ban is not ours to lift.
            debug!(
                user_id,
                %lecture_id,
                banned_by = ?user.banned_by,
                "unban left another lecture's ban in place"
            );
            return Ok(user);
        }
        if banned && user.banned && user.banned_by != Some(lecture_id) {
            warn!(
                user_id,
                %lecture_id,
                banned_by = ?user.banned_by,
                "ban replaces one from another lecture"
            );
        }
        user.banned = banned;
        user.banned_by = banned.then_some(lecture_id);

        tx.save_user(&user).await?;
        tx.commit().await?;

        info!(user_id, %lecture_id, banned, "moderator changed ban");
        Ok(user)
    }

    /// Active votes of the user, oldest first.
    pub async fn list_user_votes(&self, user_id: i64) -> Result<Vec<VoteRecord>> {
        let mut tx = self.store.begin().await?;
        if tx.get_user(user_id).await?.is_none() {
            return Err(Error::NotFound(Entity::User));
        }
        Ok(tx.find_vote_records_by_user(user_id).await?)
    }
}
