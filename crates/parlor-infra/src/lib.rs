//! Infrastructure implementations for Parlor.
//!
//! - `sqlite`: database units of work over SQLite, async (`sqlx`) and
//!   blocking (`rusqlite`), plus the repositories built on them.
//! - `cache`: the in-process cache store and its command pipelines.
//! - `config`: settings loader for `{data_dir}/config.toml`.

pub mod cache;
pub mod config;
pub mod sqlite;
