//! ChatRepository trait definition.
//!
//! Questions and answers are written separately; the chat history joins them
//! back into question/answer pairs.

use std::future::Future;

use parlor_types::chat::{Answer, HistoryEntry, NewQuestion, Question, UserId};
use parlor_types::error::RepositoryError;

/// Repository trait for questions, answers and chat history.
pub trait ChatRepository: Send + Sync {
    /// Record a question before it is answered.
    fn create_question(
        &self,
        question: &NewQuestion,
    ) -> impl Future<Output = Result<Question, RepositoryError>> + Send;

    /// Record the answer to a question.
    fn create_answer(
        &self,
        user_id: UserId,
        question_id: i64,
        content: &str,
    ) -> impl Future<Output = Result<Answer, RepositoryError>> + Send;

    /// Up to `limit` answered questions of a user, oldest first.
    fn get_history(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, RepositoryError>> + Send;
}
