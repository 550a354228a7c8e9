use crate::types::{ClassResult, RunRecord};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Sidecar record of completed block numbers, used to resume an
/// interrupted classification run.
///
/// The file is rewritten in full after each completed block. Atomicity
/// across a crash is limited to "at most the last in-flight block is
/// reprocessed", which is sufficient because block writes are idempotent.
pub struct RunLedger {
    path: PathBuf,
    record: RunRecord,
    completed: HashSet<u64>,
}

impl RunLedger {
    /// Sidecar path for a given output raster
    pub fn sidecar_path<P: AsRef<Path>>(output: P) -> PathBuf {
        let mut name = output.as_ref().as_os_str().to_os_string();
        name.push(".blocks.json");
        PathBuf::from(name)
    }

    /// Load an existing ledger, or start a fresh one if none is present
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> ClassResult<Self> {
        let path = path.as_ref().to_path_buf();
        let record = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let record: RunRecord = serde_json::from_str(&raw)?;
            log::info!(
                "Resuming from ledger {} ({} blocks already complete)",
                path.display(),
                record.completed.len()
            );
            record
        } else {
            RunRecord {
                created: Utc::now(),
                completed: Vec::new(),
            }
        };
        let completed = record.completed.iter().copied().collect();
        Ok(Self {
            path,
            record,
            completed,
        })
    }

    pub fn contains(&self, block: u64) -> bool {
        self.completed.contains(&block)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Record a block as complete and persist the ledger
    pub fn mark_complete(&mut self, block: u64) -> ClassResult<()> {
        if self.completed.insert(block) {
            self.record.completed.push(block);
        }
        let raw = serde_json::to_string(&self.record)?;
        std::fs::write(&self.path, raw)?;
        log::debug!("Ledger updated: block {} complete", block);
        Ok(())
    }
}
