//! Polls: options, voting and the two fetch views.
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::authorize,
    error::{ConflictReason, Entity, Error, Result},
    ledger::{with_retry, PollLedger, VoteOutcome},
    models::{NewOption, NewPoll, Poll, PollOption, PollView, VoteGroup},
    state::AppState,
    storage::{Store, StoreTx},
    user::require_member,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollVote {
    pub outcome: VoteOutcome,
}

fn check_text(text: &str, what: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(text.to_string())
}

async fn load_poll<T: StoreTx>(tx: &mut T, poll_id: i64) -> Result<Poll> {
    tx.get_poll(poll_id)
        .await?
        .ok_or(Error::NotFound(Entity::Poll))
}

async fn view<T: StoreTx>(tx: &mut T, poll: Poll) -> Result<PollView> {
    let options = tx.find_options_by_poll(poll.id).await?;
    Ok(PollView { poll, options })
}

/// What attendees get to see: no tallies and no quiz answers.
fn redact(mut view: PollView) -> PollView {
    view.poll.votes = 0;
    for option in &mut view.options {
        option.votes = 0;
        option.correct = false;
    }
    view
}

impl<S: Store> AppState<S> {
    /// New polls start closed so the moderator can add options first. The
    /// newest poll becomes the lecture's current one.
    pub async fn create_poll(&self, lecture_id: Uuid, key: &str, text: &str) -> Result<Poll> {
        let mut tx = self.store.begin().await?;
        authorize(&mut tx, lecture_id, key).await?;
        let text = check_text(text, "poll question")?;

        let poll = tx
            .create_poll(&NewPoll {
                lecture_id,
                text,
                created_at: Utc::now(),
            })
            .await?;
        tx.commit().await?;

        info!(poll_id = poll.id, %lecture_id, "poll created");
        Ok(poll)
    }

    pub async fn add_option(
        &self,
        poll_id: i64,
        key: &str,
        text: &str,
        correct: bool,
    ) -> Result<PollOption> {
        let mut tx = self.store.begin().await?;
        let poll = load_poll(&mut tx, poll_id).await?;
        authorize(&mut tx, poll.lecture_id, key).await?;
        if poll.open {
            return Err(Error::Conflict(ConflictReason::PollOpen));
        }
        let text = check_text(text, "option text")?;

        let option = tx
            .create_option(&NewOption {
                poll_id,
                text,
                correct,
            })
            .await?;
        tx.commit().await?;

        debug!(poll_id, option_id = option.id, "poll option added");
        Ok(option)
    }

    /// Opens a closed poll and closes an open one.
    pub async fn toggle_poll(&self, poll_id: i64, key: &str) -> Result<Poll> {
        let mut tx = self.store.begin().await?;
        let mut poll = load_poll(&mut tx, poll_id).await?;
        authorize(&mut tx, poll.lecture_id, key).await?;

        poll.open = !poll.open;
        tx.save_poll(&poll).await?;
        tx.commit().await?;

        info!(poll_id, open = poll.open, "poll toggled");
        Ok(poll)
    }

    /// Drops every vote of the poll and zeroes the poll and option tallies.
    pub async fn reset_poll_votes(&self, poll_id: i64, key: &str) -> Result<PollView> {
        let mut tx = self.store.begin().await?;
        let mut poll = load_poll(&mut tx, poll_id).await?;
        authorize(&mut tx, poll.lecture_id, key).await?;

        let dropped = PollLedger::reset(&mut tx, VoteGroup::Poll(poll_id)).await?;
        let mut options = tx.find_options_by_poll(poll_id).await?;
        for option in &mut options {
            option.votes = 0;
            tx.save_option(option).await?;
        }
        poll.votes = 0;
        tx.save_poll(&poll).await?;
        tx.commit().await?;

        info!(poll_id, dropped, "poll votes reset");
        Ok(PollView { poll, options })
    }

    /// One vote per poll: once cast it cannot be moved to another option or
    /// taken back.
    pub async fn cast_poll_vote(&self, option_id: i64, user_id: i64) -> Result<PollVote> {
        with_retry(move || self.try_poll_vote(option_id, user_id)).await
    }

    async fn try_poll_vote(&self, option_id: i64, user_id: i64) -> Result<PollVote> {
        let mut tx = self.store.begin().await?;
        let mut option = tx
            .get_poll_option(option_id)
            .await?
            .ok_or(Error::NotFound(Entity::PollOption))?;
        let mut poll = load_poll(&mut tx, option.poll_id).await?;
        if !poll.open {
            return Err(Error::Conflict(ConflictReason::PollClosed));
        }
        require_member(&mut tx, user_id, poll.lecture_id).await?;

        let group = VoteGroup::Poll(poll.id);
        let existing = tx.get_vote_record(user_id, &group).await?;
        let transition = PollLedger::decide(existing.as_ref(), option_id)?;
        PollLedger::record(&mut tx, user_id, group, transition).await?;

        // No switching, so every delta lands on this option.
        for (_, delta) in transition.deltas() {
            option.votes += delta;
            poll.votes += delta;
        }
        tx.save_option(&option).await?;
        tx.save_poll(&poll).await?;
        tx.commit().await?;

        debug!(poll_id = poll.id, option_id, user_id, "poll vote");
        Ok(PollVote {
            outcome: transition.outcome(),
        })
    }

    /// The lecture's current poll as attendees see it.
    pub async fn fetch_for_student(&self, lecture_id: Uuid) -> Result<PollView> {
        let mut tx = self.store.begin().await?;
        let poll = tx
            .find_latest_poll_for_lecture(lecture_id)
            .await?
            .ok_or(Error::NotFound(Entity::Poll))?;
        Ok(redact(view(&mut tx, poll).await?))
    }

    pub async fn fetch_for_moderator(&self, lecture_id: Uuid, key: &str) -> Result<PollView> {
        let mut tx = self.store.begin().await?;
        authorize(&mut tx, lecture_id, key).await?;
        let poll = tx
            .find_latest_poll_for_lecture(lecture_id)
            .await?
            .ok_or(Error::NotFound(Entity::Poll))?;
        view(&mut tx, poll).await
    }
}
