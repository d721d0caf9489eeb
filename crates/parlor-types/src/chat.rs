//! Chat domain types: users, the questions they ask and the answers they get.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;

/// A person talking to the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub telegram_user_id: Option<i64>,
    pub telegram_username: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub telegram_user_id: Option<i64>,
    pub telegram_username: Option<String>,
    pub is_admin: bool,
}

/// Partial update of a user. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub telegram_username: Option<Option<String>>,
    pub is_admin: Option<bool>,
}

/// A question as recorded before the answer is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub user_id: UserId,
    pub telegram_message_id: Option<i64>,
    pub content: String,
    pub is_voice: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields required to record a question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewQuestion {
    pub user_id: UserId,
    pub telegram_message_id: Option<i64>,
    pub content: String,
    pub is_voice: bool,
}

/// The bot's reply to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub user_id: UserId,
    pub question_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One question/answer pair of a user's chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub question: String,
    pub answer: String,
}
