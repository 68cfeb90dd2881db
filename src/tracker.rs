// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Failure journal.
//!
//! Every soft deployment failure lands in a line-oriented journal so a later
//! `deploy-failures` run can replay exactly the failed subset against the
//! same commit. The on-disk format is the commit id on the first line and one
//! JSON record per following line:
//!
//! ```text
//! commitid:1f6f937c...
//! {"EndpointName":"web01","Files":["web01/etc/motd"],"ErrorMessage":"..."}
//! ```
//!
//! A record either covers the host's whole file list (index 0, host-level
//! failure) or a single failing file (index >= 1). Adjacent records for the
//! same host merge when the journal is persisted, and persistence is atomic
//! so a crash can never leave a half-written journal behind.

use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, info};

/// Journal file name, located beside the controller settings.
pub const JOURNAL_FILE_NAME: &str = "failtracker.log";

/// Prefix of the journal's first line.
const COMMIT_PREFIX: &str = "commitid:";

/// One persisted failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Host the failure belongs to.
    #[serde(rename = "EndpointName")]
    pub endpoint_name: String,

    /// Repository paths affected by the failure.
    #[serde(rename = "Files")]
    pub files: Vec<String>,

    /// Human-readable failure description.
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
}

#[derive(Debug)]
struct FailureEvent {
    record: FailureRecord,
    index: usize,
}

/// Parsed journal of a prior run, ready for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalReplay {
    /// Commit the failed run was deploying.
    pub commit_id: String,

    /// Failure records in journal order.
    pub records: Vec<FailureRecord>,
}

impl JournalReplay {
    /// Hosts named by the journal, deduplicated in order.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for record in &self.records {
            if !hosts.contains(&record.endpoint_name) {
                hosts.push(record.endpoint_name.clone());
            }
        }
        hosts
    }

    /// Repository paths named by the journal, deduplicated in order.
    pub fn files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for record in &self.records {
            for file in &record.files {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }
}

/// Accumulates failure events during a run and persists them at the end.
#[derive(Debug)]
pub struct FailureJournal {
    path: PathBuf,
    events: Mutex<Vec<FailureEvent>>,
}

impl FailureJournal {
    /// Construct an empty journal that will persist at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), events: Mutex::new(Vec::new()) }
    }

    /// Path the journal persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a host-level failure covering the host's whole file list.
    ///
    /// # Panics
    ///
    /// Will panic if the event mutex is poisoned.
    pub fn record_host_failure(
        &self,
        host: impl Into<String>,
        files: Vec<String>,
        error: impl std::fmt::Display,
    ) {
        let record = FailureRecord {
            endpoint_name: host.into(),
            files,
            error_message: error.to_string(),
        };
        debug!("Journal host failure: {record:?}");
        self.events.lock().unwrap().push(FailureEvent { record, index: 0 });
    }

    /// Record a single-file failure at its 1-based position in the host's
    /// file list.
    ///
    /// # Panics
    ///
    /// Will panic if the event mutex is poisoned, or the index is 0.
    pub fn record_file_failure(
        &self,
        host: impl Into<String>,
        file: impl Into<String>,
        index: usize,
        error: impl std::fmt::Display,
    ) {
        assert!(index >= 1, "file failures use indices starting at 1");
        let record = FailureRecord {
            endpoint_name: host.into(),
            files: vec![file.into()],
            error_message: error.to_string(),
        };
        debug!("Journal file failure at index {index}: {record:?}");
        self.events.lock().unwrap().push(FailureEvent { record, index });
    }

    /// Determine if any failure has been recorded so far.
    ///
    /// # Panics
    ///
    /// Will panic if the event mutex is poisoned.
    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// Merge adjacent same-host records into the persisted record list.
    ///
    /// # Panics
    ///
    /// Will panic if the event mutex is poisoned.
    pub fn merged_records(&self) -> Vec<FailureRecord> {
        let events = self.events.lock().unwrap();

        let mut merged: Vec<FailureRecord> = Vec::new();
        for event in events.iter() {
            match merged.last_mut() {
                Some(last) if last.endpoint_name == event.record.endpoint_name => {
                    for file in &event.record.files {
                        if !last.files.contains(file) {
                            last.files.push(file.clone());
                        }
                    }
                    if !last.error_message.contains(&event.record.error_message) {
                        last.error_message.push_str("; ");
                        last.error_message.push_str(&event.record.error_message);
                    }
                }
                _ => merged.push(event.record.clone()),
            }
        }

        merged
    }

    /// Atomically overwrite the journal file when failures were recorded.
    ///
    /// Returns whether a journal was written.
    ///
    /// # Panics
    ///
    /// Will panic if the event mutex is poisoned.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if the journal cannot be written or moved into
    ///   place.
    /// - Return [`Error::Json`] if a record cannot be encoded.
    pub fn persist(&self, commit_id: &str) -> Result<bool> {
        let records = self.merged_records();
        if records.is_empty() {
            return Ok(false);
        }

        let mut data = format!("{COMMIT_PREFIX}{commit_id}\n");
        for record in &records {
            data.push_str(&serde_json::to_string(record)?);
            data.push('\n');
        }

        let staging = self.path.with_extension("tmp");
        fs::write(&staging, data)?;
        fs::rename(&staging, &self.path)?;
        info!("Wrote failure journal with {} records to {:?}", records.len(), self.path);

        Ok(true)
    }

    /// Delete the journal file after a fully successful replay.
    ///
    /// A missing file is fine, the goal state is "no journal".
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed failure journal {:?}", self.path);
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Parse a prior run's journal for replay.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoJournal`] if there is no journal file.
    /// - Return [`Error::BadJournal`] if the file does not follow the journal
    ///   format.
    pub fn replay(path: impl AsRef<Path>) -> Result<JournalReplay> {
        let path = path.as_ref();
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoJournal { path: path.into() });
            }
            Err(error) => return Err(error.into()),
        };

        let mut lines = data.lines();
        let commit_id = lines
            .next()
            .and_then(|line| line.strip_prefix(COMMIT_PREFIX))
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| Error::BadJournal {
                path: path.into(),
                reason: format!("first line must be {COMMIT_PREFIX}<hex>"),
            })?
            .to_string();

        let mut records = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let record: FailureRecord =
                serde_json::from_str(line).map_err(|error| Error::BadJournal {
                    path: path.into(),
                    reason: error.to_string(),
                })?;
            records.push(record);
        }

        if records.is_empty() {
            return Err(Error::BadJournal {
                path: path.into(),
                reason: "journal names no failures".into(),
            });
        }

        Ok(JournalReplay { commit_id, records })
    }
}
