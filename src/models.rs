//! Rows, vote keys and request bodies.
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Lecture {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub mod_key: Uuid,
    pub name: String,
    pub creator_name: String,
    pub open: bool,
    pub faster_count: i64,
    pub slower_count: i64,
    /// Minimum seconds between two questions of the same user.
    pub frequency: i32,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub fingerprint: String,
    pub lecture_id: Uuid,
    pub banned: bool,
    /// Lecture whose moderator issued the ban.
    pub banned_by: Option<Uuid>,
}

impl User {
    /// Bans only hold in the lecture that issued them.
    pub fn is_banned_from(&self, lecture_id: Uuid) -> bool {
        self.banned && self.banned_by == Some(lecture_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    New,
    BeingAnswered,
    BeingEdited,
}

#[derive(Debug, Error)]
#[error("unknown question status {0:?}")]
pub struct UnknownStatus(String);

impl QuestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionStatus::New => "new",
            QuestionStatus::BeingAnswered => "being_answered",
            QuestionStatus::BeingEdited => "being_edited",
        }
    }
}

impl TryFrom<String> for QuestionStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "new" => Ok(QuestionStatus::New),
            "being_answered" => Ok(QuestionStatus::BeingAnswered),
            "being_edited" => Ok(QuestionStatus::BeingEdited),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub lecture_id: Uuid,
    pub text: String,
    pub votes: i64,
    pub asked_at: DateTime<Utc>,
    pub answered: bool,
    pub edited: bool,
    pub answer: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Doubles as the asker's credential, so it never leaves the server.
    #[serde(skip_serializing)]
    pub owner_id: i64,
    #[sqlx(try_from = "String")]
    pub status: QuestionStatus,
}

#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub lecture_id: Uuid,
    pub text: String,
    pub owner_id: i64,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Poll {
    pub id: i64,
    pub lecture_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub votes: i64,
    pub open: bool,
}

#[derive(Debug, Clone)]
pub struct NewPoll {
    pub lecture_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: i64,
    pub poll_id: i64,
    pub text: String,
    pub votes: i64,
    pub correct: bool,
}

#[derive(Debug, Clone)]
pub struct NewOption {
    pub poll_id: i64,
    pub text: String,
    pub correct: bool,
}

/// A poll together with its options, ordered by creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollView {
    pub poll: Poll,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedChoice {
    Faster,
    Slower,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("vote must be \"faster\" or \"slower\", got {0:?}")]
pub struct InvalidSpeedChoice(pub String);

impl FromStr for SpeedChoice {
    type Err = InvalidSpeedChoice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "faster" => Ok(SpeedChoice::Faster),
            "slower" => Ok(SpeedChoice::Slower),
            other => Err(InvalidSpeedChoice(other.to_string())),
        }
    }
}

impl fmt::Display for SpeedChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpeedChoice::Faster => "faster",
            SpeedChoice::Slower => "slower",
        })
    }
}

/// Scope inside which a user holds at most one vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum VoteGroup {
    Lecture(Uuid),
    Question(i64),
    Poll(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VoteChoice {
    Speed(SpeedChoice),
    Upvote,
    Option(i64),
}

#[derive(Debug, Error)]
#[error("malformed vote key {0:?}")]
pub struct MalformedVoteKey(pub String);

impl fmt::Display for VoteGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteGroup::Lecture(id) => write!(f, "lecture:{id}"),
            VoteGroup::Question(id) => write!(f, "question:{id}"),
            VoteGroup::Poll(id) => write!(f, "poll:{id}"),
        }
    }
}

impl FromStr for VoteGroup {
    type Err = MalformedVoteKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedVoteKey(s.to_string());
        let (kind, id) = s.split_once(':').ok_or_else(malformed)?;
        match kind {
            "lecture" => id.parse().map(VoteGroup::Lecture).map_err(|_| malformed()),
            "question" => id.parse().map(VoteGroup::Question).map_err(|_| malformed()),
            "poll" => id.parse().map(VoteGroup::Poll).map_err(|_| malformed()),
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteChoice::Speed(choice) => write!(f, "{choice}"),
            VoteChoice::Upvote => f.write_str("up"),
            VoteChoice::Option(id) => write!(f, "option:{id}"),
        }
    }
}

impl FromStr for VoteChoice {
    type Err = MalformedVoteKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "up" {
            return Ok(VoteChoice::Upvote);
        }
        if let Some(id) = s.strip_prefix("option:") {
            return id
                .parse()
                .map(VoteChoice::Option)
                .map_err(|_| MalformedVoteKey(s.to_string()));
        }
        s.parse()
            .map(VoteChoice::Speed)
            .map_err(|_| MalformedVoteKey(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteRecord {
    pub user_id: i64,
    pub group: VoteGroup,
    pub choice: VoteChoice,
    pub cast_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct CreateLectureRequest {
    pub name: String,
    pub creator_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub frequency: Option<i32>,
}

#[derive(Serialize)]
pub struct CreatedLecture {
    pub lecture: Lecture,
    pub mod_key: Uuid,
}

#[derive(Deserialize)]
pub struct FrequencyRequest {
    pub seconds: i32,
}

#[derive(Deserialize)]
pub struct SpeedVoteRequest {
    pub user_id: i64,
    pub choice: String,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub id: i64,
    pub name: String,
    pub fingerprint: String,
}

#[derive(Deserialize)]
pub struct AskRequest {
    pub user_id: i64,
    pub text: String,
}

#[derive(Deserialize)]
pub struct UserRequest {
    pub user_id: i64,
}

#[derive(Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Deserialize)]
pub struct OptionRequest {
    pub text: String,
    #[serde(default)]
    pub correct: bool,
}
