//! Chat service answering questions and recording the exchange.
//!
//! `make_answer` performs several repository writes. It does not open a
//! transaction itself: callers wrap it in the database unit of work so the
//! recorded question disappears again when generation fails.

use parlor_types::chat::{Answer, NewQuestion};
use parlor_types::error::ChatError;
use tracing::{debug, info};

use super::answer::{AnswerService, GenerateGateway};
use crate::repository::ChatRepository;

/// Generic over the chat repository and the generation gateway so that
/// parlor-core never depends on parlor-infra.
pub struct ChatService<R: ChatRepository, G: GenerateGateway> {
    repo: R,
    answers: AnswerService<G>,
    history_window: u32,
}

impl<R: ChatRepository, G: GenerateGateway> ChatService<R, G> {
    pub fn new(repo: R, gateway: G, history_window: u32) -> Self {
        Self {
            repo,
            answers: AnswerService::new(gateway),
            history_window,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn history_window(&self) -> u32 {
        self.history_window
    }

    /// Answer `question` using the user's last `history_window` exchanges.
    ///
    /// The question is recorded before generation and the answer after it.
    pub async fn make_answer(&self, question: NewQuestion) -> Result<Answer, ChatError> {
        let user_id = question.user_id;
        let history = self.repo.get_history(user_id, self.history_window).await?;
        debug!(user_id, history = history.len(), "loaded chat history");

        let question = self.repo.create_question(&question).await?;
        let content = self.answers.make(&question, &history).await?;
        let answer = self
            .repo
            .create_answer(user_id, question.id, &content)
            .await?;

        info!(user_id, question_id = question.id, answer_id = answer.id, "question answered");
        Ok(answer)
    }
}
