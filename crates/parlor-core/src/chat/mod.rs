//! Chat use case: answer a user's question with their recent history.

pub mod answer;
pub mod service;

pub use answer::{AnswerService, GenerateGateway};
pub use service::ChatService;
