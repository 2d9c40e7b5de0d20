//! Durable storage — SQLite-backed message and task stores.

pub mod db;
pub mod messages;
pub mod tasks;

pub use db::Database;
pub use messages::{MessageStore, StoredMessage};
pub use tasks::TaskStore;
