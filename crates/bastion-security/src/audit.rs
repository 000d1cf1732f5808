//! ---
//! bastion_section: "03-event-logging"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Security event model and event log collaborators."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::events::{select, EventDraft, EventFilter, EventLog, EventLogError, SecurityEvent};

const GENESIS_HASH_LEN: usize = 64;

/// Line stored in the event log file: the event plus its link in the hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainedEvent {
    /// Recorded event.
    #[serde(flatten)]
    pub event: SecurityEvent,
    /// SHA-256 hash of the event contents and previous hash.
    pub hash: String,
    /// Hash of the previous entry (or zero string for the first entry).
    pub previous_hash: String,
}

impl ChainedEvent {
    fn compute_hash(event: &SecurityEvent, previous_hash: &str) -> Result<String, EventLogError> {
        let mut hasher = Sha256::new();
        hasher.update(event.id.to_be_bytes());
        hasher.update(
            event
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_be_bytes(),
        );
        hasher.update(serde_json::to_vec(event)?);
        hasher.update(previous_hash.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug)]
struct FileState {
    last_hash: String,
    events: Vec<SecurityEvent>,
}

/// Event log backed by a newline-delimited JSON file with a SHA-256 hash chain.
///
/// Every event is mirrored in memory so window queries never touch the disk. Appends
/// run on the blocking pool so a slow disk never stalls a runtime worker.
#[derive(Debug)]
pub struct FileEventLog {
    inner: Arc<ChainFile>,
}

#[derive(Debug)]
struct ChainFile {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileEventLog {
    /// Open (or create) the log at `path`. Existing entries are loaded to restore the head hash.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut state = FileState {
            last_hash: "0".repeat(GENESIS_HASH_LEN),
            events: Vec::new(),
        };
        if path.exists() {
            for entry in read_entries(&path)? {
                state.last_hash = entry.hash;
                state.events.push(entry.event);
            }
        }
        debug!(path = %path.display(), events = state.events.len(), "event log opened");
        Ok(Self {
            inner: Arc::new(ChainFile {
                path,
                state: Mutex::new(state),
            }),
        })
    }

    /// Location of the log on disk.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().events.is_empty()
    }

    /// Verify integrity of the file (detect tampering).
    pub fn verify(&self) -> Result<bool, EventLogError> {
        let path = self.path();
        if !path.exists() {
            return Ok(true);
        }
        let mut previous = "0".repeat(GENESIS_HASH_LEN);
        for entry in read_entries(path)? {
            if entry.previous_hash != previous {
                return Ok(false);
            }
            let expected = ChainedEvent::compute_hash(&entry.event, &previous)?;
            if expected != entry.hash {
                return Ok(false);
            }
            previous = entry.hash;
        }
        Ok(true)
    }
}

impl ChainFile {
    fn append(
        &self,
        draft: EventDraft,
        timestamp: DateTime<Utc>,
    ) -> Result<SecurityEvent, EventLogError> {
        let mut state = self.state.lock();
        let event = draft.into_event(state.events.len() as u64 + 1, timestamp);
        let hash = ChainedEvent::compute_hash(&event, &state.last_hash)?;
        let entry = ChainedEvent {
            event: event.clone(),
            hash: hash.clone(),
            previous_hash: state.last_hash.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        state.last_hash = hash;
        state.events.push(event.clone());
        Ok(event)
    }
}

fn read_entries(path: &Path) -> Result<Vec<ChainedEvent>, EventLogError> {
    let mut entries = Vec::new();
    for line in BufReader::new(fs::File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn record(
        &self,
        draft: EventDraft,
        timestamp: DateTime<Utc>,
    ) -> Result<SecurityEvent, EventLogError> {
        let chain = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || chain.append(draft, timestamp))
            .await
            .map_err(|err| EventLogError::Unavailable(format!("append task failed: {err}")))?
    }

    async fn query(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, EventLogError> {
        Ok(select(&self.inner.state.lock().events, filter, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_types, Severity};
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::tempdir;

    #[tokio::test]
    async fn reopened_log_continues_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = FileEventLog::open(&path).unwrap();
        log.record(
            EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium).with_source_ip("10.0.0.5"),
            Utc::now(),
        )
        .await
        .unwrap();
        drop(log);

        let log = FileEventLog::open(&path).unwrap();
        assert_eq!(log.len(), 1);
        let second = log
            .record(
                EventDraft::new(event_types::SUCCESSFUL_LOGIN, Severity::Low).with_subject("alice"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(second.id, 2);
        assert!(log.verify().unwrap());

        let filter = EventFilter {
            source_ip: Some("10.0.0.5".into()),
            ..EventFilter::default()
        };
        assert_eq!(log.query(&filter, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_keep_one_chain() {
        let dir = tempdir().unwrap();
        let log = Arc::new(FileEventLog::open(dir.path().join("events.log")).unwrap());
        let mut tasks = Vec::new();
        for n in 0..20 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.record(
                    EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium)
                        .with_source_ip(format!("10.0.0.{n}")),
                    Utc::now(),
                )
                .await
                .unwrap()
                .id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
        assert_eq!(log.len(), 20);
        assert!(log.verify().unwrap());
        assert_eq!(FileEventLog::open(log.path()).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn event_log_detects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = FileEventLog::open(&path).unwrap();
        log.record(
            EventDraft::new(event_types::ACCESS_DENIED, Severity::High)
                .with_subject("bob")
                .with_resource("payroll"),
            Utc::now(),
        )
        .await
        .unwrap();
        log.record(
            EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium)
                .with_details(serde_json::json!({"attempt": 1})),
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(log.verify().unwrap());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        let mut entries: Vec<serde_json::Value> = contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        entries[1]["details"]["attempt"] = serde_json::json!(2);
        file.set_len(0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        for value in entries {
            file.write_all(value.to_string().as_bytes()).unwrap();
            file.write_all(b"\n").unwrap();
        }
        assert!(!FileEventLog::open(&path).unwrap().verify().unwrap());
    }
}
