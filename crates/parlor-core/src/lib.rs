//! Unit-of-work machinery and port definitions for Parlor.
//!
//! `unit_of_work` binds one backend resource (a database session or a cache
//! pipeline) to the logical call chain and layers nested transaction frames
//! on top of it. The driver, cache and repository traits are the "ports"
//! that `parlor-infra` implements. This crate never depends on a database
//! or cache crate.

pub mod cache;
pub mod chat;
pub mod repository;
pub mod unit_of_work;
