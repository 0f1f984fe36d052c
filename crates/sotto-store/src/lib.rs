//! # sotto-store
//!
//! Durable server-side storage for the sotto relay: the account table
//! (user id -> password hash) and the per-user offline delivery queue.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for both tables.
//! Writes commit before the triggering call returns, so a queued envelope
//! is durable by the time the relay moves on.

pub mod accounts;
pub mod database;
pub mod migrations;
pub mod models;
pub mod queue;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
