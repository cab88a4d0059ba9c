//! Kivi - a durable networked key-value store
//!
//! Clients connect over TCP and issue line-oriented text commands
//! (`PUT`, `GET`, `DELETE`, `EXISTS`, `SIZE`, `PING`, `FLUSH`, `STATS`).
//! Mutations are appended to a write-ahead log before they touch the
//! in-memory map, and the log is replayed on startup to rebuild state.
//!
//! Module structure:
//! - `config`: configuration loading and defaults
//! - `store`: sharded reader-writer-locked map, the hot data plane
//! - `wal`: append-only binary log with replay
//! - `protocol`: text command parser
//! - `server`: command execution, connection handling, lifecycle
//! - `client`: thin async request/response wrapper

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod store;
pub mod wal;

pub use client::KvClient;
pub use config::Config;
pub use protocol::Command;
pub use server::Server;
pub use store::{InsertOutcome, MapStatistics, ShardedMap};
pub use wal::{WalOp, WalOptions, WriteAheadLog};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, KvError>;

/// Error taxonomy.
///
/// Lookup misses are deliberately absent: a missing key is a `NOT_FOUND`
/// reply, not an error.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Socket or log file I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed command or unknown verb. The message is the reply body.
    #[error("{0}")]
    Protocol(&'static str),

    /// Key or value exceeds its configured ceiling.
    #[error("{0}")]
    Validation(&'static str),

    /// WAL framing became inconsistent before the last record.
    #[error("WAL corrupted: {0}")]
    Corrupt(String),

    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),
}
