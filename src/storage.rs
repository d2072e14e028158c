//! Storage collaborator.
//!
//! Every core operation runs inside one [`StoreTx`]. Writes only become
//! visible on [`StoreTx::commit`]; dropping a transaction discards them, so an
//! operation that fails halfway leaves nothing behind.
//!
//! Implementations own concurrency control. A transaction that loses a race
//! (duplicate vote key, serialization failure) reports
//! [`StorageError::Contention`] instead of applying a stale write.
use std::future::Future;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Lecture, NewOption, NewPoll, NewQuestion, Poll, PollOption, Question, User, VoteGroup,
    VoteRecord,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("concurrent update, retry the request")]
    Contention,

    #[error("storage failure: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    fn begin(&self) -> impl Future<Output = StorageResult<Self::Tx>> + Send;
}

pub trait StoreTx: Send {
    fn get_lecture(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = StorageResult<Option<Lecture>>> + Send;

    /// Inserts or replaces the lecture.
    fn save_lecture(&mut self, lecture: &Lecture)
        -> impl Future<Output = StorageResult<()>> + Send;

    /// Removes the lecture with its questions, polls, options and every vote
    /// cast in any of them. Returns whether the lecture existed.
    fn delete_lecture(&mut self, id: Uuid) -> impl Future<Output = StorageResult<bool>> + Send;

    fn get_user(&mut self, id: i64) -> impl Future<Output = StorageResult<Option<User>>> + Send;

    fn get_user_in_lecture(
        &mut self,
        id: i64,
        lecture_id: Uuid,
    ) -> impl Future<Output = StorageResult<Option<User>>> + Send;

    /// Inserts or replaces the user.
    fn save_user(&mut self, user: &User) -> impl Future<Output = StorageResult<()>> + Send;

    fn count_users_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> impl Future<Output = StorageResult<i64>> + Send;

    fn get_question(
        &mut self,
        id: i64,
    ) -> impl Future<Output = StorageResult<Option<Question>>> + Send;

    fn find_questions_by_lecture(
        &mut self,
        lecture_id: Uuid,
    ) -> impl Future<Output = StorageResult<Vec<Question>>> + Send;

    fn create_question(
        &mut self,
        question: &NewQuestion,
    ) -> impl Future<Output = StorageResult<Question>> + Send;

    fn save_question(
        &mut self,
        question: &Question,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Removes the question and its upvotes.
    fn delete_question(&mut self, id: i64) -> impl Future<Output = StorageResult<bool>> + Send;

    fn get_vote_record(
        &mut self,
        user_id: i64,
        group: &VoteGroup,
    ) -> impl Future<Output = StorageResult<Option<VoteRecord>>> + Send;

    fn find_vote_records_by_user(
        &mut self,
        user_id: i64,
    ) -> impl Future<Output = StorageResult<Vec<VoteRecord>>> + Send;

    /// Inserts a new record. A record already holding the same
    /// `(user_id, group)` key is [`StorageError::Contention`].
    fn save_vote_record(
        &mut self,
        record: &VoteRecord,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    fn delete_vote_record(
        &mut self,
        user_id: i64,
        group: &VoteGroup,
    ) -> impl Future<Output = StorageResult<bool>> + Send;

    fn delete_all_vote_records_for_group(
        &mut self,
        group: &VoteGroup,
    ) -> impl Future<Output = StorageResult<u64>> + Send;

    fn get_poll(&mut self, id: i64) -> impl Future<Output = StorageResult<Option<Poll>>> + Send;

    /// The most recently created poll of the lecture.
    fn find_latest_poll_for_lecture(
        &mut self,
        lecture_id: Uuid,
    ) -> impl Future<Output = StorageResult<Option<Poll>>> + Send;

    fn create_poll(&mut self, poll: &NewPoll) -> impl Future<Output = StorageResult<Poll>> + Send;

    fn save_poll(&mut self, poll: &Poll) -> impl Future<Output = StorageResult<()>> + Send;

    fn get_poll_option(
        &mut self,
        id: i64,
    ) -> impl Future<Output = StorageResult<Option<PollOption>>> + Send;

    /// Options of the poll, in creation order.
    fn find_options_by_poll(
        &mut self,
        poll_id: i64,
    ) -> impl Future<Output = StorageResult<Vec<PollOption>>> + Send;

    fn create_option(
        &mut self,
        option: &NewOption,
    ) -> impl Future<Output = StorageResult<PollOption>> + Send;

    fn save_option(
        &mut self,
        option: &PollOption,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    fn commit(self) -> impl Future<Output = StorageResult<()>> + Send;
}
