//! Questions: asking, upvoting and moderation.
//!
//! A moderator opening the answer or edit popup moves the question into
//! `being_answered` or `being_edited`; closing or submitting it returns the
//! question to `new`. The status is a hint for other moderators, not a lock:
//! a second moderator may still take the question over and is only told it
//! was already being handled.
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::authorize,
    error::{ConflictReason, Entity, Error, ForbiddenReason, Result},
    ledger::{with_retry, UpvoteLedger, VoteOutcome},
    models::{NewQuestion, Question, QuestionStatus, VoteGroup},
    state::AppState,
    storage::{Store, StoreTx},
    user::require_member,
};

pub const MAX_TEXT_LENGTH: usize = 500;
pub const MAX_ANSWER_LENGTH: usize = 5_000;

/// Non-fatal notes attached to a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Advisory {
    AlreadyHandled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handling {
    pub question: Question,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<Advisory>,
}

/// A question as listed to attendees. Askers stay anonymous; `mine` tells
/// the viewer which questions are their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedQuestion {
    #[serde(flatten)]
    pub question: Question,
    pub mine: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Upvote {
    pub outcome: VoteOutcome,
    pub votes: i64,
}

fn check_text(text: &str, max_length: usize) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidInput("text must not be empty".into()));
    }
    if text.chars().count() > max_length {
        return Err(Error::InvalidInput(format!(
            "text must be at most {max_length} characters"
        )));
    }
    Ok(text.to_string())
}

async fn load_question<T: StoreTx>(tx: &mut T, question_id: i64) -> Result<Question> {
    tx.get_question(question_id)
        .await?
        .ok_or(Error::NotFound(Entity::Question))
}

impl<S: Store> AppState<S> {
    pub async fn ask_question(&self, lecture_id: Uuid, user_id: i64, text: &str) -> Result<Question> {
        let text = check_text(text, MAX_TEXT_LENGTH)?;

        let mut tx = self.store.begin().await?;
        let lecture = tx
            .get_lecture(lecture_id)
            .await?
            .ok_or(Error::NotFound(Entity::Lecture))?;
        if !lecture.open {
            return Err(Error::Conflict(ConflictReason::LectureClosed));
        }
        let now = Utc::now();
        if now < lecture.start_time {
            return Err(Error::Conflict(ConflictReason::NotStarted));
        }
        require_member(&mut tx, user_id, lecture_id).await?;

        if lecture.frequency > 0 {
            let last_asked = tx
                .find_questions_by_lecture(lecture_id)
                .await?
                .into_iter()
                .filter(|question| question.owner_id == user_id)
                .map(|question| question.asked_at)
                .max();
            if let Some(last_asked) = last_asked {
                if now - last_asked < TimeDelta::seconds(i64::from(lecture.frequency)) {
                    return Err(Error::Conflict(ConflictReason::RateLimited));
                }
            }
        }

        let question = tx
            .create_question(&NewQuestion {
                lecture_id,
                text,
                owner_id: user_id,
                asked_at: now,
            })
            .await?;
        tx.commit().await?;

        debug!(question_id = question.id, user_id, %lecture_id, "question asked");
        Ok(question)
    }

    /// Open questions first, then by votes, oldest first among equals.
    pub async fn list_questions(&self, lecture_id: Uuid) -> Result<Vec<Question>> {
        let mut tx = self.store.begin().await?;
        if tx.get_lecture(lecture_id).await?.is_none() {
            return Err(Error::NotFound(Entity::Lecture));
        }

        let mut questions = tx.find_questions_by_lecture(lecture_id).await?;
        questions.sort_by(|a, b| {
            a.answered
                .cmp(&b.answered)
                .then(b.votes.cmp(&a.votes))
                .then(a.asked_at.cmp(&b.asked_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(questions)
    }

    /// [`Self::list_questions`] as seen by `viewer`, without owner ids.
    pub async fn list_questions_for(
        &self,
        lecture_id: Uuid,
        viewer: Option<i64>,
    ) -> Result<Vec<ListedQuestion>> {
        let questions = self.list_questions(lecture_id).await?;
        Ok(questions
            .into_iter()
            .map(|question| ListedQuestion {
                mine: viewer == Some(question.owner_id),
                question,
            })
            .collect())
    }

    /// Upvotes, or takes back an earlier upvote.
    pub async fn upvote_question(&self, question_id: i64, user_id: i64) -> Result<Upvote> {
        with_retry(move || self.try_upvote(question_id, user_id)).await
    }

    async fn try_upvote(&self, question_id: i64, user_id: i64) -> Result<Upvote> {
        let mut tx = self.store.begin().await?;
        let mut question = load_question(&mut tx, question_id).await?;
        let lecture = tx
            .get_lecture(question.lecture_id)
            .await?
            .ok_or(Error::NotFound(Entity::Lecture))?;
        if !lecture.open {
            return Err(Error::Conflict(ConflictReason::LectureClosed));
        }
        require_member(&mut tx, user_id, question.lecture_id).await?;

        let group = VoteGroup::Question(question_id);
        let existing = tx.get_vote_record(user_id, &group).await?;
        let transition = UpvoteLedger::decide(existing.as_ref(), ())?;
        UpvoteLedger::record(&mut tx, user_id, group, transition).await?;

        for ((), delta) in transition.deltas() {
            question.votes += delta;
        }
        tx.save_question(&question).await?;
        tx.commit().await?;

        debug!(question_id, user_id, outcome = ?transition.outcome(), "upvote");
        Ok(Upvote {
            outcome: transition.outcome(),
            votes: question.votes,
        })
    }

    pub async fn begin_answering(&self, question_id: i64, key: &str) -> Result<Handling> {
        self.begin_handling(question_id, key, QuestionStatus::BeingAnswered)
            .await
    }

    pub async fn begin_editing(&self, question_id: i64, key: &str) -> Result<Handling> {
        self.begin_handling(question_id, key, QuestionStatus::BeingEdited)
            .await
    }

    /// Never refuses: a question someone else is handling is taken over and
    /// the caller gets [`Advisory::AlreadyHandled`].
    async fn begin_handling(
        &self,
        question_id: i64,
        key: &str,
        status: QuestionStatus,
    ) -> Result<Handling> {
        let mut tx = self.store.begin().await?;
        let mut question = load_question(&mut tx, question_id).await?;
        authorize(&mut tx, question.lecture_id, key).await?;

        let advisory = (question.status != QuestionStatus::New).then_some(Advisory::AlreadyHandled);
        if advisory.is_some() {
            warn!(
                question_id,
                current = question.status.as_str(),
                requested = status.as_str(),
                "question already being handled"
            );
        }

        question.status = status;
        tx.save_question(&question).await?;
        tx.commit().await?;

        Ok(Handling { question, advisory })
    }

    pub async fn cancel_answering(&self, question_id: i64, key: &str) -> Result<Question> {
        self.cancel_handling(question_id, key, QuestionStatus::BeingAnswered)
            .await
    }

    pub async fn cancel_editing(&self, question_id: i64, key: &str) -> Result<Question> {
        self.cancel_handling(question_id, key, QuestionStatus::BeingEdited)
            .await
    }

    /// Back to `new`, unless another moderator has since moved the question
    /// into a different popup.
    async fn cancel_handling(
        &self,
        question_id: i64,
        key: &str,
        status: QuestionStatus,
    ) -> Result<Question> {
        let mut tx = self.store.begin().await?;
        let mut question = load_question(&mut tx, question_id).await?;
        authorize(&mut tx, question.lecture_id, key).await?;

        if question.status == status {
            question.status = QuestionStatus::New;
            tx.save_question(&question).await?;
            tx.commit().await?;
        }
        Ok(question)
    }

    /// Stores the answer. Answering again replaces the previous answer.
    pub async fn submit_answer(&self, question_id: i64, key: &str, answer: &str) -> Result<Question> {
        let mut tx = self.store.begin().await?;
        let mut question = load_question(&mut tx, question_id).await?;
        authorize(&mut tx, question.lecture_id, key).await?;
        let answer = check_text(answer, MAX_ANSWER_LENGTH)?;

        question.answered = true;
        question.answer = Some(answer);
        question.answered_at = Some(Utc::now());
        question.status = QuestionStatus::New;
        tx.save_question(&question).await?;
        tx.commit().await?;

        info!(question_id, "question answered");
        Ok(question)
    }

    pub async fn submit_edit(&self, question_id: i64, key: &str, text: &str) -> Result<Question> {
        let mut tx = self.store.begin().await?;
        let mut question = load_question(&mut tx, question_id).await?;
        authorize(&mut tx, question.lecture_id, key).await?;
        let text = check_text(text, MAX_TEXT_LENGTH)?;

        question.text = text;
        question.edited = true;
        question.status = QuestionStatus::New;
        tx.save_question(&question).await?;
        tx.commit().await?;

        info!(question_id, "question edited");
        Ok(question)
    }

    /// The asker withdrawing a question that has not been answered yet.
    pub async fn delete_own_question(&self, question_id: i64, user_id: i64) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let question = load_question(&mut tx, question_id).await?;
        if question.owner_id != user_id {
            return Err(Error::Forbidden(ForbiddenReason::NotOwner));
        }
        if question.answered {
            return Err(Error::Conflict(ConflictReason::AlreadyAnswered));
        }

        tx.delete_question(question_id).await?;
        tx.commit().await?;

        debug!(question_id, user_id, "question withdrawn");
        Ok(())
    }

    pub async fn delete_question_as_moderator(&self, question_id: i64, key: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let question = load_question(&mut tx, question_id).await?;
        authorize(&mut tx, question.lecture_id, key).await?;

        tx.delete_question(question_id).await?;
        tx.commit().await?;

        info!(question_id, "question deleted by moderator");
        Ok(())
    }
}
