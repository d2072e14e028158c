//! Store wrapper that loses races on demand.
//!
//! Wraps [`MemoryStore`] and, while a fault counter is above zero, answers
//! the way a store does when a concurrent transaction got there first.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use uuid::Uuid;

use crate::{
    memory::{MemoryStore, MemoryTx},
    models::{
        Lecture, NewOption, NewPoll, NewQuestion, Poll, PollOption, Question, User, VoteGroup,
        VoteRecord,
    },
    storage::{StorageError, StorageResult, Store, StoreTx},
};

#[derive(Debug, Default)]
struct Faults {
    vote_inserts: AtomicUsize,
    vote_deletes: AtomicUsize,
    commits: AtomicUsize,
    begun: AtomicUsize,
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FlakyStore {
    /// The next `n` vote inserts hit an existing key.
    pub fn fail_vote_inserts(&self, n: usize) {
        self.faults.vote_inserts.store(n, Ordering::SeqCst);
    }

    /// The next `n` vote deletes find the record already gone.
    pub fn lose_vote_deletes(&self, n: usize) {
        self.faults.vote_deletes.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits fail to serialize.
    pub fn fail_commits(&self, n: usize) {
        self.faults.commits.store(n, Ordering::SeqCst);
    }

    /// Transactions begun so far.
    pub fn transactions(&self) -> usize {
        self.faults.begun.load(Ordering::SeqCst)
    }
}

pub struct FlakyTx {
    inner: MemoryTx,
    faults: Arc<Faults>,
}

impl Store for FlakyStore {
    type Tx = FlakyTx;

    async fn begin(&self) -> StorageResult<FlakyTx> {
        self.faults.begun.fetch_add(1, Ordering::SeqCst);
        Ok(FlakyTx {
            inner: self.inner.begin().await?,
            faults: self.faults.clone(),
        })
    }
}

impl StoreTx for FlakyTx {
    async fn get_lecture(&mut self, id: Uuid) -> StorageResult<Option<Lecture>> {
        self.inner.get_lecture(id).await
    }

    async fn save_lecture(&mut self, lecture: &Lecture) -> StorageResult<()> {
        self.inner.save_lecture(lecture).await
    }

    async fn delete_lecture(&mut self, id: Uuid) -> StorageResult<bool> {
        self.inner.delete_lecture(id).await
    }

    async fn get_user(&mut self, id: i64) -> StorageResult<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn get_user_in_lecture(
        &mut self,
        id: i64,
        lecture_id: Uuid,
    ) -> StorageResult<Option<User>> {
        self.inner.get_user_in_lecture(id, lecture_id).await
    }

    async fn save_user(&mut self, user: &User) -> StorageResult<()> {
        self.inner.save_user(user).await
    }

    async fn count_users_by_fingerprint(&mut self, fingerprint: &str) -> StorageResult<i64> {
        self.inner.count_users_by_fingerprint(fingerprint).await
    }

    async fn get_question(&mut self, id: i64) -> StorageResult<Option<Question>> {
        self.inner.get_question(id).await
    }

    async fn find_questions_by_lecture(&mut self, lecture_id: Uuid) -> StorageResult<Vec<Question>> {
        self.inner.find_questions_by_lecture(lecture_id).await
    }

    async fn create_question(&mut self, question: &NewQuestion) -> StorageResult<Question> {
        self.inner.create_question(question).await
    }

    async fn save_question(&mut self, question: &Question) -> StorageResult<()> {
        self.inner.save_question(question).await
    }

    async fn delete_question(&mut self, id: i64) -> StorageResult<bool> {
        self.inner.delete_question(id).await
    }

    async fn get_vote_record(
        &mut self,
        user_id: i64,
        group: &VoteGroup,
    ) -> StorageResult<Option<VoteRecord>> {
        self.inner.get_vote_record(user_id, group).await
    }

    async fn find_vote_records_by_user(&mut self, user_id: i64) -> StorageResult<Vec<VoteRecord>> {
        self.inner.find_vote_records_by_user(user_id).await
    }

    async fn save_vote_record(&mut self, record: &VoteRecord) -> StorageResult<()> {
        if take(&self.faults.vote_inserts) {
            return Err(StorageError::Contention);
        }
        self.inner.save_vote_record(record).await
    }

    async fn delete_vote_record(&mut self, user_id: i64, group: &VoteGroup) -> StorageResult<bool> {
        if take(&self.faults.vote_deletes) {
            return Ok(false);
        }
        self.inner.delete_vote_record(user_id, group).await
    }

    async fn delete_all_vote_records_for_group(&mut self, group: &VoteGroup) -> StorageResult<u64> {
        self.inner.delete_all_vote_records_for_group(group).await
    }

    async fn get_poll(&mut self, id: i64) -> StorageResult<Option<Poll>> {
        self.inner.get_poll(id).await
    }

    async fn find_latest_poll_for_lecture(&mut self, lecture_id: Uuid) -> StorageResult<Option<Poll>> {
        self.inner.find_latest_poll_for_lecture(lecture_id).await
    }

    async fn create_poll(&mut self, poll: &NewPoll) -> StorageResult<Poll> {
        self.inner.create_poll(poll).await
    }

    async fn save_poll(&mut self, poll: &Poll) -> StorageResult<()> {
        self.inner.save_poll(poll).await
    }

    async fn get_poll_option(&mut self, id: i64) -> StorageResult<Option<PollOption>> {
        self.inner.get_poll_option(id).await
    }

    async fn find_options_by_poll(&mut self, poll_id: i64) -> StorageResult<Vec<PollOption>> {
        self.inner.find_options_by_poll(poll_id).await
    }

    async fn create_option(&mut self, option: &NewOption) -> StorageResult<PollOption> {
        self.inner.create_option(option).await
    }

    async fn save_option(&mut self, option: &PollOption) -> StorageResult<()> {
        self.inner.save_option(option).await
    }

    async fn commit(self) -> StorageResult<()> {
        if take(&self.faults.commits) {
            // Dropping the inner transaction discards its writes.
            return Err(StorageError::Contention);
        }
        self.inner.commit().await
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::{
        checksum::append_check_digit,
        config::Config,
        error::Error,
        ledger::{VoteOutcome, MAX_ATTEMPTS},
        state::AppState,
    };

    fn state() -> (AppState<FlakyStore>, FlakyStore) {
        let store = FlakyStore::default();
        (AppState::new(store.clone(), Config::default()), store)
    }

    async fn join(state: &AppState<FlakyStore>, lecture: Uuid, payload: u64) -> i64 {
        let id = append_check_digit(payload).unwrap();
        state
            .register_user(lecture, id, "Student", &format!("device-{payload}"))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_speed_vote_retries_after_duplicate_insert() {
        let (state, store) = state();
        let (lecture, _) = state.test_lecture().await;
        let user = join(&state, lecture, 1).await;

        store.fail_vote_inserts(1);
        let before = store.transactions();
        let vote = state
            .cast_lecture_speed_vote(user, lecture, "faster")
            .await
            .unwrap();

        assert_eq!(store.transactions() - before, 2);
        assert_eq!(vote.outcome, VoteOutcome::Cast);
        assert_eq!(vote.faster_count, 1);
        assert_eq!(state.get_lecture(lecture).await.unwrap().faster_count, 1);
        assert_eq!(state.list_user_votes(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retraction_retries_when_record_vanished() {
        let (state, store) = state();
        let (lecture, _) = state.test_lecture().await;
        let user = join(&state, lecture, 2).await;
        state
            .cast_lecture_speed_vote(user, lecture, "slower")
            .await
            .unwrap();

        store.lose_vote_deletes(1);
        let before = store.transactions();
        let vote = state
            .cast_lecture_speed_vote(user, lecture, "slower")
            .await
            .unwrap();

        assert_eq!(store.transactions() - before, 2);
        assert_eq!(vote.outcome, VoteOutcome::Retracted);
        assert_eq!(vote.slower_count, 0);
        assert!(state.list_user_votes(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upvote_retries_after_failed_commit() {
        let (state, store) = state();
        let (lecture, _) = state.test_lecture().await;
        let owner = join(&state, lecture, 3).await;
        let voter = join(&state, lecture, 4).await;
        let question = state
            .ask_question(lecture, owner, "Why is the sky blue?")
            .await
            .unwrap();

        store.fail_commits(1);
        let up = state.upvote_question(question.id, voter).await.unwrap();

        assert_eq!(up.outcome, VoteOutcome::Cast);
        assert_eq!(up.votes, 1);
        let listed = state.list_questions(lecture).await.unwrap();
        assert_eq!(listed[0].votes, 1);
    }

    #[tokio::test]
    async fn test_poll_vote_gives_up_without_writing() {
        let (state, store) = state();
        let (lecture, key) = state.test_lecture().await;
        let user = join(&state, lecture, 5).await;
        let poll = state.create_poll(lecture, &key, "Tabs?").await.unwrap();
        let option = state.add_option(poll.id, &key, "Yes", false).await.unwrap();
        state.toggle_poll(poll.id, &key).await.unwrap();

        store.fail_commits(MAX_ATTEMPTS);
        let before = store.transactions();
        let err = state.cast_poll_vote(option.id, user).await.unwrap_err();

        assert_eq!(store.transactions() - before, MAX_ATTEMPTS);
        assert!(matches!(err, Error::Storage(StorageError::Contention)));
        assert!(err.is_retryable());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let view = state.fetch_for_moderator(lecture, &key).await.unwrap();
        assert_eq!(view.poll.votes, 0);
        assert_eq!(view.options[0].votes, 0);
        assert!(state.list_user_votes(user).await.unwrap().is_empty());

        // Once the contention clears the same vote goes through once.
        let vote = state.cast_poll_vote(option.id, user).await.unwrap();
        assert_eq!(vote.outcome, VoteOutcome::Cast);
        let view = state.fetch_for_moderator(lecture, &key).await.unwrap();
        assert_eq!(view.poll.votes, 1);
        assert_eq!(view.options[0].votes, 1);
    }
}
