//! Persistence layer.
//!
//! Saves and loads the session ledger to/from a JSON file, one file per
//! backend session id. Aggregates are written for readability but always
//! recomputed from the entries on load.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::tracker::{Ledger, LedgerAggregates, LedgerEntry};

/// On-disk shape of a saved ledger.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    session_id: String,
    saved_at: DateTime<Utc>,
    aggregates: LedgerAggregates,
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    dir: PathBuf,
}

impl LedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the ledger of `session_id`. Characters outside
    /// `[A-Za-z0-9_-]` are replaced so an id can never escape the directory.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("ledger_{safe}.json"))
    }

    /// Save the ledger of `session_id`, replacing any previous file.
    pub fn save(&self, session_id: &str, ledger: &Ledger) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .context(format!("Failed to create data dir {}", self.dir.display()))?;

        let file = LedgerFile {
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
            aggregates: ledger.aggregates().clone(),
            entries: ledger.entries().to_vec(),
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialise ledger")?;

        // Readers only ever see a complete file.
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).context(format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .context(format!("Failed to move ledger to {}", path.display()))?;

        debug!(path = %path.display(), entries = file.entries.len(), "Ledger saved");
        Ok(())
    }

    /// Load the ledger of `session_id`.
    /// Returns None if the file doesn't exist (fresh session).
    pub fn load(&self, session_id: &str, window_size: usize) -> Result<Option<Ledger>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            debug!(path = %path.display(), "No saved ledger for session");
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)
            .context(format!("Failed to read ledger from {}", path.display()))?;
        let file: LedgerFile = serde_json::from_str(&json)
            .context(format!("Failed to parse ledger from {}", path.display()))?;
        if file.session_id != session_id {
            bail!(
                "ledger file {} belongs to session {}",
                path.display(),
                file.session_id
            );
        }

        let ledger = Ledger::from_entries(file.entries, window_size)
            .context(format!("Ledger in {} is not in round order", path.display()))?;

        info!(
            session_id,
            entries = ledger.len(),
            net_pnl_sol = %ledger.aggregates().net_pnl_sol,
            "Ledger restored from disk"
        );
        Ok(Some(ledger))
    }

    /// Delete the ledger of `session_id` if present.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .context(format!("Failed to delete ledger file {}", path.display()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
