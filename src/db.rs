//! Postgres store. Every transaction runs SERIALIZABLE.
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    models::{
        Lecture, NewOption, NewPoll, NewQuestion, Poll, PollOption, Question, User, VoteGroup,
        VoteRecord,
    },
    storage::{StorageError, StorageResult, Store, StoreTx},
};

pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Serialization failures, deadlocks and unique violations all mean another
/// transaction got there first.
const CONTENTION_CODES: [&str; 3] = ["40001", "40P01", "23505"];

fn is_contention(code: &str) -> bool {
    CONTENTION_CODES.contains(&code)
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db
                .code()
                .is_some_and(|code| is_contention(&code))
            {
                return StorageError::Contention;
            }
        }
        StorageError::Backend(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = create_pool(database_url, max_connections).await?;
        sqlx::migrate!().run(&pool).await?;
        info!("Database migrations applied");
        Ok(Self { pool })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> StorageResult<PgTx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(PgTx { tx })
    }
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    user_id: i64,
    group_key: String,
    choice: String,
    cast_at: DateTime<Utc>,
}

impl TryFrom<VoteRow> for VoteRecord {
    type Error = StorageError;

    fn try_from(row: VoteRow) -> Result<Self, Self::Error> {
        let corrupt = |err: crate::models::MalformedVoteKey| StorageError::Corrupt(err.to_string());
        Ok(VoteRecord {
            user_id: row.user_id,
            group: row.group_key.parse().map_err(corrupt)?,
            choice: row.choice.parse().map_err(corrupt)?,
            cast_at: row.cast_at,
        })
    }
}

const QUESTION_COLUMNS: &str = "id, lecture_id, text, votes, asked_at, answered, edited, \
     answer, answered_at, owner_id, status";

impl StoreTx for PgTx {
    async fn get_lecture(&mut self, id: Uuid) -> StorageResult<Option<Lecture>> {
        let lecture = sqlx::query_as::<_, Lecture>("SELECT * FROM lectures WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(lecture)
    }

    async fn save_lecture(&mut self, lecture: &Lecture) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO lectures \
                 (id, mod_key, name, creator_name, open, faster_count, slower_count, frequency, start_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
                 mod_key = EXCLUDED.mod_key, name = EXCLUDED.name, \
                 creator_name = EXCLUDED.creator_name, open = EXCLUDED.open, \
                 faster_count = EXCLUDED.faster_count, slower_count = EXCLUDED.slower_count, \
                 frequency = EXCLUDED.frequency, start_time = EXCLUDED.start_time",
        )
        .bind(lecture.id)
        .bind(lecture.mod_key)
        .bind(&lecture.name)
        .bind(&lecture.creator_name)
        .bind(lecture.open)
        .bind(lecture.faster_count)
        .bind(lecture.slower_count)
        .bind(lecture.frequency)
        .bind(lecture.start_time)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_lecture(&mut self, id: Uuid) -> StorageResult<bool> {
        // Vote records are keyed by text, so the foreign keys cannot reach them.
        sqlx::query(
            "DELETE FROM vote_records WHERE group_key = 'lecture:' || $1::text \
                OR group_key IN (SELECT 'question:' || id FROM questions WHERE lecture_id = $1) \
                OR group_key IN (SELECT 'poll:' || id FROM polls WHERE lecture_id = $1)",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM lectures WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn get_user(&mut self, id: i64) -> StorageResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn get_user_in_lecture(
        &mut self,
        id: i64,
        lecture_id: Uuid,
    ) -> StorageResult<Option<User>> {
        let user =
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND lecture_id = $2")
                .bind(id)
                .bind(lecture_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(user)
    }

    async fn save_user(&mut self, user: &User) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO users (id, name, fingerprint, lecture_id, banned, banned_by) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, fingerprint = EXCLUDED.fingerprint, \
                 lecture_id = EXCLUDED.lecture_id, banned = EXCLUDED.banned, \
                 banned_by = EXCLUDED.banned_by",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.fingerprint)
        .bind(user.lecture_id)
        .bind(user.banned)
        .bind(user.banned_by)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn count_users_by_fingerprint(&mut self, fingerprint: &str) -> StorageResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    async fn get_question(&mut self, id: i64) -> StorageResult<Option<Question>> {
        let question = sqlx::query_as::<_, Question>(&format!(
            "SELECT {QUESTION_COLUMNS} FROM questions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(question)
    }

    async fn find_questions_by_lecture(&mut self, lecture_id: Uuid) -> StorageResult<Vec<Question>> {
        let questions = sqlx::query_as::<_, Question>(&format!(
            "SELECT {QUESTION_COLUMNS} FROM questions WHERE lecture_id = $1 ORDER BY id"
        ))
        .bind(lecture_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(questions)
    }

    async fn create_question(&mut self, question: &NewQuestion) -> StorageResult<Question> {
        let created = sqlx::query_as::<_, Question>(&format!(
            "INSERT INTO questions (lecture_id, text, owner_id, asked_at) \
             VALUES ($1, $2, $3, $4) RETURNING {QUESTION_COLUMNS}"
        ))
        .bind(question.lecture_id)
        .bind(&question.text)
        .bind(question.owner_id)
        .bind(question.asked_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn save_question(&mut self, question: &Question) -> StorageResult<()> {
        let updated = sqlx::query(
            "UPDATE questions SET text = $2, votes = $3, answered = $4, edited = $5, \
                 answer = $6, answered_at = $7, status = $8 \
             WHERE id = $1",
        )
        .bind(question.id)
        .bind(&question.text)
        .bind(question.votes)
        .bind(question.answered)
        .bind(question.edited)
        .bind(&question.answer)
        .bind(question.answered_at)
        .bind(question.status.as_str())
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StorageError::Contention);
        }
        Ok(())
    }

    async fn delete_question(&mut self, id: i64) -> StorageResult<bool> {
        self.delete_all_vote_records_for_group(&VoteGroup::Question(id))
            .await?;
        let deleted = sqlx::query("DELETE FROM questions WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn get_vote_record(
        &mut self,
        user_id: i64,
        group: &VoteGroup,
    ) -> StorageResult<Option<VoteRecord>> {
        let row = sqlx::query_as::<_, VoteRow>(
            "SELECT * FROM vote_records WHERE user_id = $1 AND group_key = $2",
        )
        .bind(user_id)
        .bind(group.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(VoteRecord::try_from).transpose()
    }

    async fn find_vote_records_by_user(&mut self, user_id: i64) -> StorageResult<Vec<VoteRecord>> {
        let rows = sqlx::query_as::<_, VoteRow>(
            "SELECT * FROM vote_records WHERE user_id = $1 ORDER BY cast_at",
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(VoteRecord::try_from).collect()
    }

    async fn save_vote_record(&mut self, record: &VoteRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO vote_records (user_id, group_key, choice, cast_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(record.user_id)
        .bind(record.group.to_string())
        .bind(record.choice.to_string())
        .bind(record.cast_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_vote_record(&mut self, user_id: i64, group: &VoteGroup) -> StorageResult<bool> {
        let deleted =
            sqlx::query("DELETE FROM vote_records WHERE user_id = $1 AND group_key = $2")
                .bind(user_id)
                .bind(group.to_string())
                .execute(&mut *self.tx)
                .await?
                .rows_affected();
        Ok(deleted > 0)
    }

    async fn delete_all_vote_records_for_group(&mut self, group: &VoteGroup) -> StorageResult<u64> {
        let deleted = sqlx::query("DELETE FROM vote_records WHERE group_key = $1")
            .bind(group.to_string())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn get_poll(&mut self, id: i64) -> StorageResult<Option<Poll>> {
        let poll = sqlx::query_as::<_, Poll>("SELECT * FROM polls WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(poll)
    }

    async fn find_latest_poll_for_lecture(&mut self, lecture_id: Uuid) -> StorageResult<Option<Poll>> {
        let poll = sqlx::query_as::<_, Poll>(
            "SELECT * FROM polls WHERE lecture_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(lecture_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(poll)
    }

    async fn create_poll(&mut self, poll: &NewPoll) -> StorageResult<Poll> {
        let created = sqlx::query_as::<_, Poll>(
            "INSERT INTO polls (lecture_id, text, created_at) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(poll.lecture_id)
        .bind(&poll.text)
        .bind(poll.created_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn save_poll(&mut self, poll: &Poll) -> StorageResult<()> {
        let updated = sqlx::query("UPDATE polls SET text = $2, votes = $3, open = $4 WHERE id = $1")
            .bind(poll.id)
            .bind(&poll.text)
            .bind(poll.votes)
            .bind(poll.open)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(StorageError::Contention);
        }
        Ok(())
    }

    async fn get_poll_option(&mut self, id: i64) -> StorageResult<Option<PollOption>> {
        let option = sqlx::query_as::<_, PollOption>("SELECT * FROM poll_options WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(option)
    }

    async fn find_options_by_poll(&mut self, poll_id: i64) -> StorageResult<Vec<PollOption>> {
        let options = sqlx::query_as::<_, PollOption>(
            "SELECT * FROM poll_options WHERE poll_id = $1 ORDER BY id",
        )
        .bind(poll_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(options)
    }

    async fn create_option(&mut self, option: &NewOption) -> StorageResult<PollOption> {
        let created = sqlx::query_as::<_, PollOption>(
            "INSERT INTO poll_options (poll_id, text, correct) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(option.poll_id)
        .bind(&option.text)
        .bind(option.correct)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn save_option(&mut self, option: &PollOption) -> StorageResult<()> {
        let updated =
            sqlx::query("UPDATE poll_options SET text = $2, votes = $3, correct = $4 WHERE id = $1")
                .bind(option.id)
                .bind(&option.text)
                .bind(option.votes)
                .bind(option.correct)
                .execute(&mut *self.tx)
                .await?
                .rows_affected();

        if updated == 0 {
            return Err(StorageError::Contention);
        }
        Ok(())
    }

    async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{SpeedChoice, VoteChoice};

    fn row(group_key: &str, choice: &str) -> VoteRow {
        VoteRow {
            user_id: 79_927_398_713,
            group_key: group_key.into(),
            choice: choice.into(),
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn test_contention_codes() {
        assert!(is_contention("40001"));
        assert!(is_contention("40P01"));
        assert!(is_contention("23505"));
        assert!(!is_contention("23503"));
        assert!(!is_contention("42P01"));
    }

    #[test]
    fn test_non_database_errors_are_backend() {
        assert!(matches!(
            StorageError::from(sqlx::Error::RowNotFound),
            StorageError::Backend(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolTimedOut),
            StorageError::Backend(_)
        ));
    }

    #[test]
    fn test_vote_rows_decode() {
        let lecture = Uuid::new_v4();
        let record = VoteRecord::try_from(row(&format!("lecture:{lecture}"), "slower")).unwrap();
        assert_eq!(record.group, VoteGroup::Lecture(lecture));
        assert_eq!(record.choice, VoteChoice::Speed(SpeedChoice::Slower));

        let record = VoteRecord::try_from(row("poll:3", "option:12")).unwrap();
        assert_eq!(record.group, VoteGroup::Poll(3));
        assert_eq!(record.choice, VoteChoice::Option(12));
    }

    #[test]
    fn test_malformed_vote_rows_are_corrupt() {
        for (group, choice) in [("question:x", "up"), ("ballot:1", "up"), ("question:1", "sideways")] {
            assert!(matches!(
                VoteRecord::try_from(row(group, choice)),
                Err(StorageError::Corrupt(_))
            ));
        }
    }
}
