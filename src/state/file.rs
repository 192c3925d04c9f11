//! Append-only JSONL journal on the local filesystem.
//!
//! Layout: `<root>/runs/<run-id>.jsonl`, one [`JournalRecord`] per line.
//! Each append is a single `write_all` of the full line followed by
//! `sync_data`, so a crash leaves at most one torn line at the end of the
//! file. Reads discard that torn tail; every append checks the last byte
//! and truncates a torn tail before writing. A failed append is rolled
//! back to the length the file had before it.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::journal::JournalRecord;
use super::store::StateStore;
use crate::core::{Run, RunId};
use crate::error::{Error, Result};
use crate::util::blocking;

const JOURNAL_EXT: &str = "jsonl";

pub struct FileStateStore {
    runs_dir: PathBuf,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let runs_dir = root.join("runs");
        fs::create_dir_all(&runs_dir)?;
        debug!(path = %runs_dir.display(), "opened file state store");
        Ok(Self { runs_dir })
    }

    pub fn journal_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir
            .join(format!("{}.{}", run_id.as_str(), JOURNAL_EXT))
    }
}

fn encode(record: &JournalRecord) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Drop a partially written final line. Only the last byte is read when
/// the tail is intact.
fn repair_tail(file: &mut File, path: &Path) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    warn!(
        path = %path.display(),
        discarded = content.len() - keep,
        "truncating torn journal tail"
    );
    file.set_len(keep as u64)?;
    file.sync_data()
}

fn parse_journal(run_id: &RunId, content: &[u8]) -> Result<Vec<JournalRecord>> {
    let complete = match content.iter().rposition(|b| *b == b'\n') {
        Some(end) => &content[..=end],
        None => &content[..0],
    };
    if complete.len() < content.len() {
        warn!(run_id = %run_id, "ignoring torn final journal line");
    }
    let complete = std::str::from_utf8(complete).map_err(|e| Error::CorruptJournal {
        run_id: run_id.to_string(),
        record: 0,
        reason: e.to_string(),
    })?;

    complete
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| Error::CorruptJournal {
                run_id: run_id.to_string(),
                record: index,
                reason: e.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let path = self.journal_path(&run.id);
        let run_id = run.id.clone();
        let line = encode(&JournalRecord::RunCreated { run: run.clone() })?;

        blocking(move || {
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(Error::RunExists(run_id.to_string()))
                }
                Err(e) => return Err(Error::persistence(&run_id, e)),
            };
            file.write_all(&line)
                .and_then(|_| file.sync_all())
                .map_err(|e| Error::persistence(&run_id, e))
        })
        .await
    }

    async fn append(&self, run_id: &RunId, record: JournalRecord) -> Result<()> {
        let path = self.journal_path(run_id);
        let run_id = run_id.clone();
        let line = encode(&record)?;

        blocking(move || {
            let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::RunNotFound(run_id.to_string()))
                }
                Err(e) => return Err(Error::persistence(&run_id, e)),
            };
            repair_tail(&mut file, &path).map_err(|e| Error::persistence(&run_id, e))?;

            let committed = file
                .seek(SeekFrom::End(0))
                .map_err(|e| Error::persistence(&run_id, e))?;
            if let Err(e) = file.write_all(&line).and_then(|_| file.sync_data()) {
                if let Err(undo) = file.set_len(committed).and_then(|_| file.sync_data()) {
                    warn!(run_id = %run_id, error = %undo, "could not roll back failed append");
                }
                return Err(Error::persistence(&run_id, e));
            }
            Ok(())
        })
        .await
    }

    async fn records(&self, run_id: &RunId) -> Result<Vec<JournalRecord>> {
        let path = self.journal_path(run_id);
        let run_id = run_id.clone();

        blocking(move || {
            let mut content = Vec::new();
            match File::open(&path) {
                Ok(mut file) => {
                    file.read_to_end(&mut content)?;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::RunNotFound(run_id.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
            parse_journal(&run_id, &content)
        })
        .await
    }

    async fn run_ids(&self) -> Result<Vec<RunId>> {
        let runs_dir = self.runs_dir.clone();
        blocking(move || {
            let mut ids = Vec::new();
            for entry in fs::read_dir(&runs_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(RunId::from(stem));
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}
