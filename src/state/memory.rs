//! In-memory state store for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::journal::JournalRecord;
use super::store::StateStore;
use crate::core::{Run, RunId};
use crate::error::{Error, Result};

/// Journals kept in a map. Optionally fails every write after a fixed
/// number of successful ones, to exercise commit-failure handling.
#[derive(Default)]
pub struct MemoryStateStore {
    journals: Mutex<HashMap<RunId, Vec<JournalRecord>>>,
    writes: AtomicUsize,
    write_limit: Option<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that accepts `limit` writes and rejects every write after that.
    pub fn failing_after(limit: usize) -> Self {
        Self {
            write_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn admit_write(&self, run_id: &RunId) -> Result<()> {
        if let Some(limit) = self.write_limit {
            if self.writes.load(Ordering::SeqCst) >= limit {
                return Err(Error::persistence(run_id, "injected write failure"));
            }
        }
        Ok(())
    }

    fn lock(
        &self,
        run_id: &RunId,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, Vec<JournalRecord>>>> {
        self.journals
            .lock()
            .map_err(|_| Error::persistence(run_id, "journal lock poisoned"))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        self.admit_write(&run.id)?;
        let mut journals = self.lock(&run.id)?;
        if journals.contains_key(&run.id) {
            return Err(Error::RunExists(run.id.to_string()));
        }
        journals.insert(
            run.id.clone(),
            vec![JournalRecord::RunCreated { run: run.clone() }],
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, run_id: &RunId, record: JournalRecord) -> Result<()> {
        self.admit_write(run_id)?;
        let mut journals = self.lock(run_id)?;
        let journal = journals
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        journal.push(record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn records(&self, run_id: &RunId) -> Result<Vec<JournalRecord>> {
        self.lock(run_id)?
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    async fn run_ids(&self) -> Result<Vec<RunId>> {
        let placeholder = RunId::from("*");
        let mut ids: Vec<RunId> = self.lock(&placeholder)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
