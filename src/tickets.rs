//! Ticket sources.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::core::Ticket;
use crate::util::blocking;
use crate::{Error, Result};

/// Read-only supplier of tickets, in declared order.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn list_tickets(&self, project: &str) -> Result<Vec<Ticket>>;
}

/// Tickets defined in `*.toml` files under one directory.
///
/// Files are read in file-name order. A file holds either a single ticket
/// table or a `[[tickets]]` array; tickets keep their in-file order.
pub struct TomlTicketSource {
    dir: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TicketFile {
    Many { tickets: Vec<Ticket> },
    One(Ticket),
}

impl TomlTicketSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn read_all(dir: &Path) -> Result<Vec<Ticket>> {
        if !dir.is_dir() {
            return Err(Error::Validation(format!(
                "tickets directory not found: {}",
                dir.display()
            )));
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        let mut tickets = Vec::new();
        for path in paths {
            let file: TicketFile = toml::from_str(&fs::read_to_string(&path)?).map_err(|e| {
                Error::Validation(format!("invalid ticket file {}: {}", path.display(), e))
            })?;
            match file {
                TicketFile::Many { tickets: many } => tickets.extend(many),
                TicketFile::One(ticket) => tickets.push(ticket),
            }
        }

        let mut seen = std::collections::HashSet::new();
        for ticket in &tickets {
            if !seen.insert(ticket.id.as_str()) {
                return Err(Error::Validation(format!(
                    "ticket id {} is declared more than once",
                    ticket.id
                )));
            }
        }
        Ok(tickets)
    }
}

#[async_trait]
impl TicketSource for TomlTicketSource {
    async fn list_tickets(&self, project: &str) -> Result<Vec<Ticket>> {
        let dir = self.dir.clone();
        let tickets = blocking(move || Self::read_all(&dir)).await?;
        debug!(project, count = tickets.len(), "tickets loaded");
        Ok(tickets)
    }
}
