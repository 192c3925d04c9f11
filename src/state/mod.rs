//! Durable run state.
//!
//! Runs are persisted as append-only journals of [`JournalRecord`]s and
//! rebuilt with [`RunSnapshot::replay`]. [`FileStateStore`] is the on-disk
//! backend; [`MemoryStateStore`] backs tests.

mod file;
mod journal;
mod memory;
mod store;

pub use file::FileStateStore;
pub use journal::{JournalRecord, LogEntry, LogLevel, RunSnapshot, Transition};
pub use memory::MemoryStateStore;
pub use store::StateStore;
