//! SQLite persistence for chats, jobs, and chunks.

pub mod chats;
pub mod db;
pub mod jobs;

pub use chats::{ChatStore, StoredMessage};
pub use db::Database;
pub use jobs::{ChunkRecord, ChunkStatus, JobRecord, JobStatus, JobStore, NewJob};
