//! Prompt assembly in front of the text generation gateway.

use std::future::Future;

use parlor_types::chat::{HistoryEntry, Question};
use parlor_types::error::ChatError;

/// Port to whatever produces answer text (an LLM client in production).
pub trait GenerateGateway: Send + Sync {
    /// Produce a reply to the conversation in `messages`, oldest first.
    fn generate(&self, messages: &[String])
    -> impl Future<Output = Result<String, ChatError>> + Send;
}

const PROMPT: &str = "Answer the following question: ";

/// Builds the conversation for a question and asks the gateway for a reply.
pub struct AnswerService<G: GenerateGateway> {
    gateway: G,
}

impl<G: GenerateGateway> AnswerService<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// History pairs first, then the prompted question.
    pub fn messages(question: &Question, history: &[HistoryEntry]) -> Vec<String> {
        let mut messages: Vec<String> = history
            .iter()
            .flat_map(|entry| [entry.question.clone(), entry.answer.clone()])
            .collect();
        messages.push(format!("{PROMPT}{}", question.content));
        messages
    }

    pub async fn make(
        &self,
        question: &Question,
        history: &[HistoryEntry],
    ) -> Result<String, ChatError> {
        let messages = Self::messages(question, history);
        self.gateway.generate(&messages).await
    }
}
