//! Shared domain types for Parlor.
//!
//! This crate contains the types passed between the unit-of-work machinery,
//! the storage drivers and the chat layer: users, questions and answers,
//! cache commands, settings, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
