//! Moderator key check.
//!
//! Every moderator mutation calls [`authorize`] inside its transaction before
//! touching anything, so a rejected key never leaves a partial write.
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{AuthError, Error, Result},
    models::Lecture,
    storage::StoreTx,
};

/// The key is a random v4 uuid handed out once at lecture creation, compared
/// exactly against the lowercase hyphenated form it was handed out in. Swap
/// this out to move to hashed keys.
pub fn keys_match(stored: &Uuid, presented: &str) -> bool {
    let mut buf = Uuid::encode_buffer();
    let expected: &str = stored.hyphenated().encode_lower(&mut buf);
    presented == expected
}

/// Loads the lecture if `presented_key` is its moderator key.
pub async fn authorize<T: StoreTx>(
    tx: &mut T,
    lecture_id: Uuid,
    presented_key: &str,
) -> Result<Lecture> {
    let lecture = tx
        .get_lecture(lecture_id)
        .await?
        .ok_or(Error::Unauthorized(AuthError::LectureNotFound))?;

    if !keys_match(&lecture.mod_key, presented_key) {
        warn!(%lecture_id, "rejected moderator key");
        return Err(Error::Unauthorized(AuthError::InvalidKey));
    }

    Ok(lecture)
}
