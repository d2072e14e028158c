//! Process-local store.
//!
//! Transactions are serialised on one async mutex and work on a copy of the
//! tables that replaces the shared state on commit. Good for tests and a
//! single-node demo; anything larger should run against Postgres.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    models::{
        Lecture, NewOption, NewPoll, NewQuestion, Poll, PollOption, Question, QuestionStatus,
        User, VoteGroup, VoteRecord,
    },
    storage::{StorageError, StorageResult, Store, StoreTx},
};

#[derive(Debug, Clone, Default)]
struct Tables {
    lectures: HashMap<Uuid, Lecture>,
    users: HashMap<i64, User>,
    questions: BTreeMap<i64, Question>,
    votes: HashMap<(i64, VoteGroup), VoteRecord>,
    polls: BTreeMap<i64, Poll>,
    options: BTreeMap<i64, PollOption>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn drop_group(&mut self, group: &VoteGroup) -> u64 {
        let before = self.votes.len();
        self.votes.retain(|(_, key), _| key != group);
        (before - self.votes.len()) as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StorageResult<MemoryTx> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(MemoryTx { guard, work })
    }
}

impl StoreTx for MemoryTx {
    async fn get_lecture(&mut self, id: Uuid) -> StorageResult<Option<Lecture>> {
        Ok(self.work.lectures.get(&id).cloned())
    }

    async fn save_lecture(&mut self, lecture: &Lecture) -> StorageResult<()> {
        self.work.lectures.insert(lecture.id, lecture.clone());
        Ok(())
    }

    async fn delete_lecture(&mut self, id: Uuid) -> StorageResult<bool> {
        if self.work.lectures.remove(&id).is_none() {
            return Ok(false);
        }

        let mut groups = vec![VoteGroup::Lecture(id)];
        self.work.questions.retain(|question_id, question| {
            let keep = question.lecture_id != id;
            if !keep {
                groups.push(VoteGroup::Question(*question_id));
            }
            keep
        });
        let mut polls = Vec::new();
        self.work.polls.retain(|poll_id, poll| {
            let keep = poll.lecture_id != id;
            if !keep {
                polls.push(*poll_id);
            }
            keep
        });
        self.work
            .options
            .retain(|_, option| !polls.contains(&option.poll_id));
        groups.extend(polls.into_iter().map(VoteGroup::Poll));

        for group in &groups {
            self.work.drop_group(group);
        }
        Ok(true)
    }

    async fn get_user(&mut self, id: i64) -> StorageResult<Option<User>> {
        Ok(self.work.users.get(&id).cloned())
    }

    async fn get_user_in_lecture(
        &mut self,
        id: i64,
        lecture_id: Uuid,
    ) -> StorageResult<Option<User>> {
        Ok(self
            .work
            .users
            .get(&id)
            .filter(|user| user.lecture_id == lecture_id)
            .cloned())
    }

    async fn save_user(&mut self, user: &User) -> StorageResult<()> {
        self.work.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn count_users_by_fingerprint(&mut self, fingerprint: &str) -> StorageResult<i64> {
        Ok(self
            .work
            .users
            .values()
            .filter(|user| user.fingerprint == fingerprint)
            .count() as i64)
    }

    async fn get_question(&mut self, id: i64) -> StorageResult<Option<Question>> {
        Ok(self.work.questions.get(&id).cloned())
    }

    async fn find_questions_by_lecture(&mut self, lecture_id: Uuid) -> StorageResult<Vec<Question>> {
        Ok(self
            .work
            .questions
            .values()
            .filter(|question| question.lecture_id == lecture_id)
            .cloned()
            .collect())
    }

    async fn create_question(&mut self, question: &NewQuestion) -> StorageResult<Question> {
        let created = Question {
            id: self.work.next_id(),
            lecture_id: question.lecture_id,
            text: question.text.clone(),
            votes: 0,
            asked_at: question.asked_at,
            answered: false,
            edited: false,
            answer: None,
            answered_at: None,
            owner_id: question.owner_id,
            status: QuestionStatus::New,
        };
        self.work.questions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn save_question(&mut self, question: &Question) -> StorageResult<()> {
        match self.work.questions.get_mut(&question.id) {
            Some(stored) => {
                *stored = question.clone();
                Ok(())
            }
            // Deleted by a transaction that committed before ours.
            None => Err(StorageError::Contention),
        }
    }

    async fn delete_question(&mut self, id: i64) -> StorageResult<bool> {
        if self.work.questions.remove(&id).is_none() {
            return Ok(false);
        }
        self.work.drop_group(&VoteGroup::Question(id));
        Ok(true)
    }

    async fn get_vote_record(
        &mut self,
        user_id: i64,
        group: &VoteGroup,
    ) -> StorageResult<Option<VoteRecord>> {
        Ok(self.work.votes.get(&(user_id, *group)).cloned())
    }

    async fn find_vote_records_by_user(&mut self, user_id: i64) -> StorageResult<Vec<VoteRecord>> {
        let mut records: Vec<VoteRecord> = self
            .work
            .votes
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.cast_at);
        Ok(records)
    }

    async fn save_vote_record(&mut self, record: &VoteRecord) -> StorageResult<()> {
        let key = (record.user_id, record.group);
        if self.work.votes.contains_key(&key) {
            return Err(StorageError::Contention);
        }
        self.work.votes.insert(key, record.clone());
        Ok(())
    }

    async fn delete_vote_record(&mut self, user_id: i64, group: &VoteGroup) -> StorageResult<bool> {
        Ok(self.work.votes.remove(&(user_id, *group)).is_some())
    }

    async fn delete_all_vote_records_for_group(&mut self, group: &VoteGroup) -> StorageResult<u64> {
        Ok(self.work.drop_group(group))
    }

    async fn get_poll(&mut self, id: i64) -> StorageResult<Option<Poll>> {
        Ok(self.work.polls.get(&id).cloned())
    }

    async fn find_latest_poll_for_lecture(&mut self, lecture_id: Uuid) -> StorageResult<Option<Poll>> {
        Ok(self
            .work
            .polls
            .values()
            .filter(|poll| poll.lecture_id == lecture_id)
            .max_by_key(|poll| (poll.created_at, poll.id))
            .cloned())
    }

    async fn create_poll(&mut self, poll: &NewPoll) -> StorageResult<Poll> {
        let created = Poll {
            id: self.work.next_id(),
            lecture_id: poll.lecture_id,
            text: poll.text.clone(),
            created_at: poll.created_at,
            votes: 0,
            open: false,
        };
        self.work.polls.insert(created.id, created.clone());
        Ok(created)
    }

    async fn save_poll(&mut self, poll: &Poll) -> StorageResult<()> {
        match self.work.polls.get_mut(&poll.id) {
            Some(stored) => {
                *stored = poll.clone();
                Ok(())
            }
            None => Err(StorageError::Contention),
        }
    }

    async fn get_poll_option(&mut self, id: i64) -> StorageResult<Option<PollOption>> {
        Ok(self.work.options.get(&id).cloned())
    }

    async fn find_options_by_poll(&mut self, poll_id: i64) -> StorageResult<Vec<PollOption>> {
        Ok(self
            .work
            .options
            .values()
            .filter(|option| option.poll_id == poll_id)
            .cloned()
            .collect())
    }

    async fn create_option(&mut self, option: &NewOption) -> StorageResult<PollOption> {
        let created = PollOption {
            id: self.work.next_id(),
            poll_id: option.poll_id,
            text: option.text.clone(),
            votes: 0,
            correct: option.correct,
        };
        self.work.options.insert(created.id, created.clone());
        Ok(created)
    }

    async fn save_option(&mut self, option: &PollOption) -> StorageResult<()> {
        match self.work.options.get_mut(&option.id) {
            Some(stored) => {
                *stored = option.clone();
                Ok(())
            }
            None => Err(StorageError::Contention),
        }
    }

    async fn commit(self) -> StorageResult<()> {
        let MemoryTx { mut guard, work } = self;
        *guard = work;
        Ok(())
    }
}
