//! Lecture lifecycle and pace voting.
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::authorize,
    error::{ConflictReason, Entity, Error, Result},
    ledger::{with_retry, SpeedLedger, VoteOutcome},
    models::{Lecture, SpeedChoice, VoteGroup},
    state::AppState,
    storage::{Store, StoreTx},
    user::require_member,
};

pub const MAX_FREQUENCY: i32 = 300;
pub const DEFAULT_FREQUENCY: i32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeedVote {
    pub outcome: VoteOutcome,
    pub faster_count: i64,
    pub slower_count: i64,
}

fn check_frequency(seconds: i32) -> Result<i32> {
    if (0..=MAX_FREQUENCY).contains(&seconds) {
        Ok(seconds)
    } else {
        Err(Error::InvalidInput(format!(
            "question frequency must be between 0 and {MAX_FREQUENCY} seconds, got {seconds}"
        )))
    }
}

impl<S: Store> AppState<S> {
    /// Opens a lecture. The returned lecture carries the moderator key; this
    /// is the only place it is ever handed out.
    pub async fn create_lecture(
        &self,
        name: &str,
        creator_name: &str,
        start_time: Option<DateTime<Utc>>,
        frequency: Option<i32>,
    ) -> Result<Lecture> {
        let name = name.trim();
        let creator_name = creator_name.trim();
        if name.is_empty() || creator_name.is_empty() {
            return Err(Error::InvalidInput(
                "lecture and creator names must not be empty".into(),
            ));
        }
        let frequency = check_frequency(frequency.unwrap_or(DEFAULT_FREQUENCY))?;

        let lecture = Lecture {
            id: Uuid::new_v4(),
            mod_key: Uuid::new_v4(),
            name: name.to_string(),
            creator_name: creator_name.to_string(),
            open: true,
            faster_count: 0,
            slower_count: 0,
            frequency,
            start_time: start_time.unwrap_or_else(Utc::now),
        };

        let mut tx = self.store.begin().await?;
        tx.save_lecture(&lecture).await?;
        tx.commit().await?;

        info!(lecture_id = %lecture.id, name = %lecture.name, "lecture created");
        Ok(lecture)
    }

    pub async fn get_lecture(&self, lecture_id: Uuid) -> Result<Lecture> {
        let mut tx = self.store.begin().await?;
        tx.get_lecture(lecture_id)
            .await?
            .ok_or(Error::NotFound(Entity::Lecture))
    }

    /// Lets a client validate a key before showing moderator controls.
    pub async fn check_moderator(&self, lecture_id: Uuid, key: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        authorize(&mut tx, lecture_id, key).await?;
        Ok(())
    }

    pub async fn close_lecture(&self, lecture_id: Uuid, key: &str) -> Result<Lecture> {
        self.update_lecture(lecture_id, key, |lecture| {
            lecture.open = false;
            Ok(())
        })
        .await
    }

    /// Flips the open flag; a paused lecture accepts no questions or votes.
    pub async fn toggle_lecture_pause(&self, lecture_id: Uuid, key: &str) -> Result<Lecture> {
        self.update_lecture(lecture_id, key, |lecture| {
            lecture.open = !lecture.open;
            Ok(())
        })
        .await
    }

    pub async fn set_frequency(&self, lecture_id: Uuid, key: &str, seconds: i32) -> Result<Lecture> {
        self.update_lecture(lecture_id, key, |lecture| {
            lecture.frequency = check_frequency(seconds)?;
            Ok(())
        })
        .await
    }

    pub async fn delete_lecture(&self, lecture_id: Uuid, key: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        authorize(&mut tx, lecture_id, key).await?;
        tx.delete_lecture(lecture_id).await?;
        tx.commit().await?;

        info!(%lecture_id, "lecture deleted");
        Ok(())
    }

    async fn update_lecture<F>(&self, lecture_id: Uuid, key: &str, change: F) -> Result<Lecture>
    where
        F: FnOnce(&mut Lecture) -> Result<()>,
    {
        let mut tx = self.store.begin().await?;
        let mut lecture = authorize(&mut tx, lecture_id, key).await?;
        change(&mut lecture)?;
        tx.save_lecture(&lecture).await?;
        tx.commit().await?;

        info!(%lecture_id, open = lecture.open, frequency = lecture.frequency, "lecture updated");
        Ok(lecture)
    }

    /// "faster" or "slower". Voting the same way twice retracts the vote,
    /// voting the other way moves it.
    pub async fn cast_lecture_speed_vote(
        &self,
        user_id: i64,
        lecture_id: Uuid,
        choice: &str,
    ) -> Result<SpeedVote> {
        let choice = choice
            .parse::<SpeedChoice>()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        with_retry(move || self.try_speed_vote(user_id, lecture_id, choice)).await
    }

    async fn try_speed_vote(
        &self,
        user_id: i64,
        lecture_id: Uuid,
        choice: SpeedChoice,
    ) -> Result<SpeedVote> {
        let mut tx = self.store.begin().await?;
        let mut lecture = tx
            .get_lecture(lecture_id)
            .await?
            .ok_or(Error::NotFound(Entity::Lecture))?;
        if !lecture.open {
            return Err(Error::Conflict(ConflictReason::LectureClosed));
        }
        require_member(&mut tx, user_id, lecture_id).await?;

        let group = VoteGroup::Lecture(lecture_id);
        let existing = tx.get_vote_record(user_id, &group).await?;
        let transition = SpeedLedger::decide(existing.as_ref(), choice)?;
        SpeedLedger::record(&mut tx, user_id, group, transition).await?;

        for (choice, delta) in transition.deltas() {
            match choice {
                SpeedChoice::Faster => lecture.faster_count += delta,
                SpeedChoice::Slower => lecture.slower_count += delta,
            }
        }
        tx.save_lecture(&lecture).await?;
        tx.commit().await?;

        debug!(user_id, %lecture_id, %choice, outcome = ?transition.outcome(), "speed vote");
        Ok(SpeedVote {
            outcome: transition.outcome(),
            faster_count: lecture.faster_count,
            slower_count: lecture.slower_count,
        })
    }

    /// Drops every pace vote of the lecture and zeroes both counters.
    pub async fn reset_speed_votes(&self, lecture_id: Uuid, key: &str) -> Result<Lecture> {
        let mut tx = self.store.begin().await?;
        let mut lecture = authorize(&mut tx, lecture_id, key).await?;

        let dropped = SpeedLedger::reset(&mut tx, VoteGroup::Lecture(lecture_id)).await?;
        lecture.faster_count = 0;
        lecture.slower_count = 0;
        tx.save_lecture(&lecture).await?;
        tx.commit().await?;

        info!(%lecture_id, dropped, "speed votes reset");
        Ok(lecture)
    }
}

#[cfg(test)]
impl<S: Store> AppState<S> {
    /// An open lecture that started already and has no question rate limit.
    pub(crate) async fn test_lecture(&self) -> (Uuid, String) {
        let lecture = self
            .create_lecture("Test lecture", "Tester", None, Some(0))
            .await
            .unwrap();
        (lecture.id, lecture.mod_key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        checksum::append_check_digit,
        config::Config,
        error::{AuthError, ForbiddenReason},
        memory::MemoryStore,
    };

    fn state() -> AppState<MemoryStore> {
        AppState::new(MemoryStore::new(), Config::default())
    }

    fn id(payload: u64) -> i64 {
        append_check_digit(payload).unwrap()
    }

    async fn joined(state: &AppState<MemoryStore>, payload: u64) -> (Uuid, String, i64) {
        let (lecture, key) = state.test_lecture().await;
        state
            .register_user(lecture, id(payload), "Student", &format!("device-{payload}"))
            .await
            .unwrap();
        (lecture, key, id(payload))
    }

    #[tokio::test]
    async fn test_create_lecture_validates() {
        let state = state();

        let lecture = state.create_lecture("OS", "Linus", None, None).await.unwrap();
        assert!(lecture.open);
        assert_eq!(lecture.frequency, DEFAULT_FREQUENCY);
        assert_ne!(lecture.id, lecture.mod_key);

        let err = state.create_lecture("", "Linus", None, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = state
            .create_lecture("OS", "Linus", None, Some(301))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_speed_vote_toggles() {
        let state = state();
        let (lecture, _, user) = joined(&state, 1).await;

        let vote = state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();
        assert_eq!(vote.outcome, VoteOutcome::Cast);
        assert_eq!((vote.faster_count, vote.slower_count), (1, 0));

        let vote = state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();
        assert_eq!(vote.outcome, VoteOutcome::Retracted);
        assert_eq!((vote.faster_count, vote.slower_count), (0, 0));
        assert!(state.list_user_votes(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_speed_vote_switches() {
        let state = state();
        let (lecture, _, user) = joined(&state, 2).await;
        let other = id(3);
        state
            .register_user(lecture, other, "Other", "device-3")
            .await
            .unwrap();
        state
            .cast_lecture_speed_vote(other, lecture, "faster")
            .await
            .unwrap();

        state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();
        let vote = state
            .cast_lecture_speed_vote(user, lecture, "slower")
            .await
            .unwrap();

        assert_eq!(vote.outcome, VoteOutcome::Switched);
        assert_eq!((vote.faster_count, vote.slower_count), (1, 1));
        let votes = state.list_user_votes(user).await.unwrap();
        assert_eq!(votes.len(), 1);
    }

    #[tokio::test]
    async fn test_speed_vote_preconditions() {
        let state = state();
        let (lecture, key, user) = joined(&state, 4).await;

        let err = state
            .cast_lecture_speed_vote(user, lecture, "Faster")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = state
            .cast_lecture_speed_vote(user, Uuid::new_v4(), "faster")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(Entity::Lecture)));

        let err = state
            .cast_lecture_speed_vote(id(5), lecture, "faster")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(Entity::User)));

        let (elsewhere, _) = state.test_lecture().await;
        let err = state
            .cast_lecture_speed_vote(user, elsewhere, "faster")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(ForbiddenReason::NotMember)));

        state.close_lecture(lecture, &key).await.unwrap();
        let err = state
            .cast_lecture_speed_vote(user, lecture, "slower")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(ConflictReason::LectureClosed)));
        let lecture = state.get_lecture(lecture).await.unwrap();
        assert_eq!((lecture.faster_count, lecture.slower_count), (0, 0));
    }

    #[tokio::test]
    async fn test_concurrent_votes_are_all_counted() {
        let state = Arc::new(state());
        let (lecture, _) = state.test_lecture().await;
        let users: Vec<i64> = (10..30).map(id).collect();
        for user in &users {
            state
                .register_user(lecture, *user, "Student", &format!("device-{user}"))
                .await
                .unwrap();
        }

        let handles: Vec<_> = users
            .iter()
            .map(|&user| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .cast_lecture_speed_vote(user, lecture, "slower")
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let lecture = state.get_lecture(lecture).await.unwrap();
        assert_eq!(lecture.slower_count, users.len() as i64);
        assert_eq!(lecture.faster_count, 0);
    }

    #[tokio::test]
    async fn test_moderator_operations_need_the_key() {
        let state = state();
        let (lecture, key, user) = joined(&state, 6).await;
        state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();
        let wrong = Uuid::new_v4().to_string();

        let err = state.close_lecture(lecture, &wrong).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(AuthError::InvalidKey)));
        let err = state.set_frequency(lecture, &wrong, 10).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(AuthError::InvalidKey)));
        let err = state.reset_speed_votes(lecture, &wrong).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(AuthError::InvalidKey)));
        let err = state.delete_lecture(lecture, &wrong).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(AuthError::InvalidKey)));
        let err = state.check_moderator(lecture, &wrong).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(AuthError::InvalidKey)));

        let unchanged = state.get_lecture(lecture).await.unwrap();
        assert!(unchanged.open);
        assert_eq!(unchanged.frequency, 0);
        assert_eq!(unchanged.faster_count, 1);
        assert_eq!(state.list_user_votes(user).await.unwrap().len(), 1);

        state.check_moderator(lecture, &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_frequency_and_reset() {
        let state = state();
        let (lecture, key, user) = joined(&state, 7).await;

        let paused = state.toggle_lecture_pause(lecture, &key).await.unwrap();
        assert!(!paused.open);
        let resumed = state.toggle_lecture_pause(lecture, &key).await.unwrap();
        assert!(resumed.open);

        let err = state.set_frequency(lecture, &key, -1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let updated = state.set_frequency(lecture, &key, 300).await.unwrap();
        assert_eq!(updated.frequency, 300);

        state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();
        let reset = state.reset_speed_votes(lecture, &key).await.unwrap();
        assert_eq!((reset.faster_count, reset.slower_count), (0, 0));
        assert!(state.list_user_votes(user).await.unwrap().is_empty());

        // After a reset the same vote counts again instead of retracting.
        let vote = state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();
        assert_eq!(vote.outcome, VoteOutcome::Cast);
    }

    #[tokio::test]
    async fn test_delete_lecture() {
        let state = state();
        let (lecture, key) = state.test_lecture().await;

        state.delete_lecture(lecture, &key).await.unwrap();
        let err = state.get_lecture(lecture).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(Entity::Lecture)));
        let err = state.delete_lecture(lecture, &key).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(AuthError::LectureNotFound)));
    }
}
