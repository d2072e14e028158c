//! At most one vote per user and vote group.
//!
//! Lecture speed, question upvotes and poll options share the same bookkeeping
//! and differ only in policy: whether a different choice switches the vote,
//! and whether repeating a choice retracts it or is refused.
//!
//! [`VoteLedger::decide`] is pure: given the stored record and the requested
//! choice it picks a [`Transition`]. [`VoteLedger::record`] writes the vote
//! records for that transition; the caller applies [`Transition::deltas`] to
//! its own counters in the same transaction.
use std::{fmt, future::Future, marker::PhantomData};

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::{
    error::{ConflictReason, Error, Result},
    models::{SpeedChoice, VoteChoice, VoteGroup, VoteRecord},
    storage::{StorageError, StoreTx},
};

/// Attempts made by [`with_retry`] before a contended vote is reported.
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Cast,
    Retracted,
    Switched,
}

/// What repeating the stored choice does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Retract,
    Reject,
}

pub trait LedgerPolicy {
    type Choice: Copy + Eq + fmt::Debug + Send + Sync;

    /// Whether a different choice replaces the stored one.
    const SWITCH: bool;
    const REPEAT: Repeat;

    fn to_record(choice: Self::Choice) -> VoteChoice;

    fn from_record(choice: &VoteChoice) -> Option<Self::Choice>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<C> {
    Cast(C),
    Retract(C),
    Switch { from: C, to: C },
}

impl<C: Copy> Transition<C> {
    pub fn outcome(&self) -> VoteOutcome {
        match self {
            Transition::Cast(_) => VoteOutcome::Cast,
            Transition::Retract(_) => VoteOutcome::Retracted,
            Transition::Switch { .. } => VoteOutcome::Switched,
        }
    }

    /// Counter changes, one entry per affected choice.
    pub fn deltas(&self) -> Vec<(C, i64)> {
        match *self {
            Transition::Cast(choice) => vec![(choice, 1)],
            Transition::Retract(choice) => vec![(choice, -1)],
            Transition::Switch { from, to } => vec![(from, -1), (to, 1)],
        }
    }
}

pub struct VoteLedger<P>(PhantomData<P>);

impl<P: LedgerPolicy> VoteLedger<P> {
    pub fn decide(existing: Option<&VoteRecord>, choice: P::Choice) -> Result<Transition<P::Choice>> {
        let Some(record) = existing else {
            return Ok(Transition::Cast(choice));
        };
        let previous = P::from_record(&record.choice).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "vote {} does not belong in group {}",
                record.choice, record.group
            ))
        })?;

        if previous == choice {
            match P::REPEAT {
                Repeat::Retract => Ok(Transition::Retract(choice)),
                Repeat::Reject => Err(Error::Conflict(ConflictReason::AlreadyVoted)),
            }
        } else if P::SWITCH {
            Ok(Transition::Switch {
                from: previous,
                to: choice,
            })
        } else {
            Err(Error::Conflict(ConflictReason::AlreadyVoted))
        }
    }

    pub async fn record<T: StoreTx>(
        tx: &mut T,
        user_id: i64,
        group: VoteGroup,
        transition: Transition<P::Choice>,
    ) -> Result<()> {
        match transition {
            Transition::Cast(choice) => Self::insert(tx, user_id, group, choice).await,
            Transition::Retract(_) => Self::remove(tx, user_id, group).await,
            Transition::Switch { to, .. } => {
                Self::remove(tx, user_id, group).await?;
                Self::insert(tx, user_id, group, to).await
            }
        }
    }

    /// Drops every vote of the group, returning how many there were.
    pub async fn reset<T: StoreTx>(tx: &mut T, group: VoteGroup) -> Result<u64> {
        Ok(tx.delete_all_vote_records_for_group(&group).await?)
    }

    async fn insert<T: StoreTx>(
        tx: &mut T,
        user_id: i64,
        group: VoteGroup,
        choice: P::Choice,
    ) -> Result<()> {
        let record = VoteRecord {
            user_id,
            group,
            choice: P::to_record(choice),
            cast_at: Utc::now(),
        };
        Ok(tx.save_vote_record(&record).await?)
    }

    async fn remove<T: StoreTx>(tx: &mut T, user_id: i64, group: VoteGroup) -> Result<()> {
        if tx.delete_vote_record(user_id, &group).await? {
            Ok(())
        } else {
            // Someone else retracted it between our read and this write.
            Err(StorageError::Contention.into())
        }
    }
}

/// Lecture pace: faster or slower, switchable, repeat retracts.
pub struct SpeedPolicy;

impl LedgerPolicy for SpeedPolicy {
    type Choice = SpeedChoice;

    const SWITCH: bool = true;
    const REPEAT: Repeat = Repeat::Retract;

    fn to_record(choice: SpeedChoice) -> VoteChoice {
        VoteChoice::Speed(choice)
    }

    fn from_record(choice: &VoteChoice) -> Option<SpeedChoice> {
        match choice {
            VoteChoice::Speed(speed) => Some(*speed),
            _ => None,
        }
    }
}

/// Question upvote: voted or not, a second upvote takes it back.
pub struct UpvotePolicy;

impl LedgerPolicy for UpvotePolicy {
    type Choice = ();

    const SWITCH: bool = false;
    const REPEAT: Repeat = Repeat::Retract;

    fn to_record(_: ()) -> VoteChoice {
        VoteChoice::Upvote
    }

    fn from_record(choice: &VoteChoice) -> Option<()> {
        matches!(choice, VoteChoice::Upvote).then_some(())
    }
}

/// Poll option: one vote per poll, final once cast.
pub struct PollPolicy;

impl LedgerPolicy for PollPolicy {
    type Choice = i64;

    const SWITCH: bool = false;
    const REPEAT: Repeat = Repeat::Reject;

    fn to_record(option_id: i64) -> VoteChoice {
        VoteChoice::Option(option_id)
    }

    fn from_record(choice: &VoteChoice) -> Option<i64> {
        match choice {
            VoteChoice::Option(id) => Some(*id),
            _ => None,
        }
    }
}

pub type SpeedLedger = VoteLedger<SpeedPolicy>;
pub type UpvoteLedger = VoteLedger<UpvotePolicy>;
pub type PollLedger = VoteLedger<PollPolicy>;

/// Runs `op` again when it lost a race in storage, up to [`MAX_ATTEMPTS`].
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(Error::Storage(StorageError::Contention)) if attempt < MAX_ATTEMPTS => {
                warn!(attempt, "vote contended, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}
