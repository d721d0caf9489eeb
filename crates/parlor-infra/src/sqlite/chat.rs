//! SQLite chat repository implementation.
//!
//! Implements `ChatRepository` from `parlor-core` on the task-scoped
//! [`Database`]. Follows the same patterns as `SqliteUserRepository`: raw
//! queries, private Row structs, writes inside transaction frames.

use chrono::{DateTime, Utc};
use parlor_core::repository::ChatRepository;
use parlor_types::chat::{Answer, HistoryEntry, NewQuestion, Question, UserId};
use parlor_types::error::RepositoryError;
use sqlx::Row;

use super::error::from_sqlx;
use super::session::Database;

/// SQLite-backed implementation of `ChatRepository`.
#[derive(Clone)]
pub struct SqliteChatRepository {
    db: Database,
}

impl SqliteChatRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct QuestionRow {
    id: i64,
    user_id: i64,
    telegram_message_id: Option<i64>,
    content: String,
    is_voice: bool,
    created_at: String,
}

impl QuestionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            telegram_message_id: row.try_get("telegram_message_id")?,
            content: row.try_get("content")?,
            is_voice: row.try_get("is_voice")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_question(self) -> Result<Question, RepositoryError> {
        Ok(Question {
            id: self.id,
            user_id: self.user_id,
            telegram_message_id: self.telegram_message_id,
            content: self.content,
            is_voice: self.is_voice,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct AnswerRow {
    id: i64,
    user_id: i64,
    question_id: i64,
    content: String,
    created_at: String,
}

impl AnswerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            question_id: row.try_get("question_id")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_answer(self) -> Result<Answer, RepositoryError> {
        Ok(Answer {
            id: self.id,
            user_id: self.user_id,
            question_id: self.question_id,
            content: self.content,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// ChatRepository implementation
// ---------------------------------------------------------------------------

impl ChatRepository for SqliteChatRepository {
    async fn create_question(&self, question: &NewQuestion) -> Result<Question, RepositoryError> {
        self.db
            .transaction(|session| async move {
                let mut session = session.resource().await?;
                let row = sqlx::query(
                    r#"INSERT INTO questions (user_id, telegram_message_id, content, is_voice, created_at)
                       VALUES (?, ?, ?, ?, ?)
                       RETURNING *"#,
                )
                .bind(question.user_id)
                .bind(question.telegram_message_id)
                .bind(&question.content)
                .bind(question.is_voice)
                .bind(format_datetime(&Utc::now()))
                .fetch_one(session.connection()?)
                .await
                .map_err(from_sqlx)?;

                QuestionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_question()
            })
            .await
    }

    async fn create_answer(
        &self,
        user_id: UserId,
        question_id: i64,
        content: &str,
    ) -> Result<Answer, RepositoryError> {
        self.db
            .transaction(|session| async move {
                let mut session = session.resource().await?;
                let row = sqlx::query(
                    r#"INSERT INTO answers (user_id, question_id, content, created_at)
                       VALUES (?, ?, ?, ?)
                       RETURNING *"#,
                )
                .bind(user_id)
                .bind(question_id)
                .bind(content)
                .bind(format_datetime(&Utc::now()))
                .fetch_one(session.connection()?)
                .await
                .map_err(from_sqlx)?;

                AnswerRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_answer()
            })
            .await
    }

    async fn get_history(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, RepositoryError> {
        self.db
            .session(|session| async move {
                let mut session = session.resource().await?;
                // Newest `limit` pairs, flipped to oldest first below.
                let rows = sqlx::query(
                    r#"SELECT q.content AS question, a.content AS answer
                       FROM questions q
                       JOIN answers a ON a.question_id = q.id
                       WHERE q.user_id = ?
                       ORDER BY q.id DESC, a.id DESC
                       LIMIT ?"#,
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(session.connection()?)
                .await
                .map_err(from_sqlx)?;

                let mut history = rows
                    .iter()
                    .map(|row| {
                        Ok(HistoryEntry {
                            question: row.try_get("question")?,
                            answer: row.try_get("answer")?,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                history.reverse();
                Ok(history)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sqlite::user::SqliteUserRepository;
    use parlor_core::chat::{ChatService, GenerateGateway};
    use parlor_core::repository::UserRepository;
    use parlor_types::chat::NewUser;
    use parlor_types::config::DatabaseSettings;
    use parlor_types::error::ChatError;

    async fn test_db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        let db = Database::connect(&DatabaseSettings::with_url(url)).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    async fn make_user(db: &Database, name: &str) -> UserId {
        SqliteUserRepository::new(db.clone())
            .create(&NewUser {
                name: name.to_string(),
                ..NewUser::default()
            })
            .await
            .unwrap()
            .id
    }

    fn ask(user_id: UserId, content: &str) -> NewQuestion {
        NewQuestion {
            user_id,
            content: content.to_string(),
            ..NewQuestion::default()
        }
    }

    async fn question_count(db: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM questions")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    /// Echoes the question back, or fails on demand.
    struct EchoGateway {
        fail: bool,
        calls: AtomicUsize,
    }

    impl EchoGateway {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl GenerateGateway for EchoGateway {
        async fn generate(&self, messages: &[String]) -> Result<String, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ChatError::Generation("model unavailable".to_string()));
            }
            Ok(format!("echo: {}", messages.last().cloned().unwrap_or_default()))
        }
    }

    #[tokio::test]
    async fn test_create_question_and_answer() {
        let db = test_db().await;
        let repo = SqliteChatRepository::new(db.clone());
        let user_id = make_user(&db, "ada").await;

        let question = repo.create_question(&ask(user_id, "why?")).await.unwrap();
        assert_eq!(question.user_id, user_id);
        assert_eq!(question.content, "why?");
        assert!(!question.is_voice);

        let answer = repo.create_answer(user_id, question.id, "because").await.unwrap();
        assert_eq!(answer.question_id, question.id);
        assert_eq!(answer.content, "because");
    }

    #[tokio::test]
    async fn test_question_for_unknown_user_is_conflict() {
        let db = test_db().await;
        let repo = SqliteChatRepository::new(db);

        let err = repo.create_question(&ask(404, "hello?")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_history_is_windowed_and_oldest_first() {
        let db = test_db().await;
        let repo = SqliteChatRepository::new(db.clone());
        let ada = make_user(&db, "ada").await;
        let bob = make_user(&db, "bob").await;

        for i in 1..=4 {
            let q = repo.create_question(&ask(ada, &format!("q{i}"))).await.unwrap();
            repo.create_answer(ada, q.id, &format!("a{i}")).await.unwrap();
        }
        let q = repo.create_question(&ask(bob, "other")).await.unwrap();
        repo.create_answer(bob, q.id, "other answer").await.unwrap();
        // Unanswered questions are not part of the history.
        repo.create_question(&ask(ada, "pending")).await.unwrap();

        let history = repo.get_history(ada, 2).await.unwrap();
        assert_eq!(
            history,
            vec![
                HistoryEntry {
                    question: "q3".to_string(),
                    answer: "a3".to_string()
                },
                HistoryEntry {
                    question: "q4".to_string(),
                    answer: "a4".to_string()
                },
            ]
        );
        assert!(repo.get_history(ada, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_user_cascades_to_chat() {
        let db = test_db().await;
        let repo = SqliteChatRepository::new(db.clone());
        let users = SqliteUserRepository::new(db.clone());
        let ada = make_user(&db, "ada").await;

        let q = repo.create_question(&ask(ada, "q")).await.unwrap();
        repo.create_answer(ada, q.id, "a").await.unwrap();
        users.delete_by_id(ada).await.unwrap();

        assert_eq!(question_count(&db).await, 0);
        assert!(repo.get_history(ada, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_make_answer_in_transaction_commits_both_rows() {
        let db = test_db().await;
        let ada = make_user(&db, "ada").await;
        let service = ChatService::new(SqliteChatRepository::new(db.clone()), EchoGateway::new(false), 20);

        let answer = db
            .transaction(|_| service.make_answer(ask(ada, "ping")))
            .await
            .unwrap();

        assert_eq!(answer.content, "echo: Answer the following question: ping");
        let history = service.repo().get_history(ada, 20).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].question, "ping");
    }

    #[tokio::test]
    async fn test_failed_generation_rolls_back_the_question() {
        let db = test_db().await;
        let ada = make_user(&db, "ada").await;
        let gateway = EchoGateway::new(true);
        let service = ChatService::new(SqliteChatRepository::new(db.clone()), gateway, 20);

        let err = db
            .transaction(|_| service.make_answer(ask(ada, "doomed")))
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Generation(_)));
        // The question was written inside the transaction and went with it.
        assert_eq!(question_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_make_answer_without_transaction_keeps_the_question() {
        let db = test_db().await;
        let ada = make_user(&db, "ada").await;
        let service = ChatService::new(SqliteChatRepository::new(db.clone()), EchoGateway::new(true), 20);

        let err = service.make_answer(ask(ada, "orphan")).await.unwrap_err();

        assert!(matches!(err, ChatError::Generation(_)));
        assert_eq!(question_count(&db).await, 1);
    }
}
