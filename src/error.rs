use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Lecture,
    User,
    Question,
    Poll,
    PollOption,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Lecture => "lecture",
            Entity::User => "user",
            Entity::Question => "question",
            Entity::Poll => "poll",
            Entity::PollOption => "poll option",
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("lecture not found")]
    LectureNotFound,

    #[error("invalid moderator key")]
    InvalidKey,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    #[error("question belongs to another user")]
    NotOwner,

    #[error("user is not a member of this lecture")]
    NotMember,

    #[error("user is banned")]
    Banned,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    #[error("lecture is closed")]
    LectureClosed,

    #[error("lecture has not started yet")]
    NotStarted,

    #[error("poll is closed")]
    PollClosed,

    #[error("poll is open, close it before changing options")]
    PollOpen,

    #[error("already voted on this poll")]
    AlreadyVoted,

    #[error("question has already been answered")]
    AlreadyAnswered,

    #[error("asking questions too frequently")]
    RateLimited,

    #[error("user id is registered to another device")]
    DuplicateUser,

    #[error("too many users registered from this address")]
    IpLimitReached,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(Entity),

    #[error("unauthorized: {0}")]
    Unauthorized(AuthError),

    #[error("forbidden: {0}")]
    Forbidden(ForbiddenReason),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(ConflictReason),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    /// Only storage failures are worth retrying; everything else is a verdict.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError::Contention | StorageError::Backend(_))
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(AuthError::LectureNotFound) => StatusCode::NOT_FOUND,
            Error::Unauthorized(AuthError::InvalidKey) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Storage(StorageError::Contention) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
