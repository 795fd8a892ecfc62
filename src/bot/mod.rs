//! Conversation layer: turns inbound messages into ledger operations and
//! reply texts.

pub mod cache;
pub mod commands;
pub mod cooldown;
pub mod dedup;
pub mod engine;
pub mod format;
pub mod session;


pub use cache::{CacheStats, CachedAnswer, ResponseCache};
pub use commands::{Command, SmallTalk};
pub use cooldown::{GateStatus, RefreshGate};
pub use dedup::Deduplicator;
pub use engine::{Dispatcher, DispatcherSettings, Inbound};
pub use session::{Sessions, SetupStep, Turn};

use crate::ledger::LedgerError;
use crate::oracle::OracleError;

/// Failure of a dispatch step that the user is told about.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
