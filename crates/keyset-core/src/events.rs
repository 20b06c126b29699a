//! Lifecycle events emitted after a keyset mutation commits.
//!
//! Delivery is at-least-once: a sink may see the same event twice if a caller
//! retries, so consumers should de-duplicate on [`LifecycleEvent::id`].

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{KeysetError, KeysetResult},
    fsutil,
    models::{KeysetId, Namespace},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Created,
    Disabled,
    Removed,
    Activated,
    Rotated,
    Destroyed,
}

impl LifecycleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventKind::Created => "created",
            LifecycleEventKind::Disabled => "disabled",
            LifecycleEventKind::Removed => "removed",
            LifecycleEventKind::Activated => "activated",
            LifecycleEventKind::Rotated => "rotated",
            LifecycleEventKind::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub kind: LifecycleEventKind,
    pub keyset_id: KeysetId,
    pub namespace: Namespace,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, keyset_id: KeysetId, namespace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            keyset_id,
            namespace: namespace.into(),
            occurred_at: OffsetDateTime::now_utc(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &LifecycleEvent) -> KeysetResult<()>;
}

/// Collects events in memory; used by tests and embedded deployments.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn kinds_for(&self, keyset_id: &KeysetId) -> Vec<LifecycleEventKind> {
        self.events
            .lock()
            .iter()
            .filter(|event| &event.keyset_id == keyset_id)
            .map(|event| event.kind)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: &LifecycleEvent) -> KeysetResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// One line of the file event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedEvent {
    pub event: LifecycleEvent,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// Bytes read from the end of the log per step when looking for the last entry.
const TAIL_WINDOW: u64 = 4096;

/// Append-only JSON-lines log where each entry commits to the hash of the previous one.
///
/// The previous hash is re-read from the file under an exclusive lock on every
/// append, so several processes can share one log without forking the chain.
pub struct FileEventLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl FileEventLog {
    pub fn new<P: AsRef<Path>>(path: P) -> KeysetResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fsutil::ensure_private_dir(dir).map_err(KeysetError::event)?;
        }
        if path.exists() {
            fsutil::tighten_permissions(&path).map_err(KeysetError::event)?;
        }
        Ok(Self {
            path,
            append_lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> KeysetResult<Vec<ChainedEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).map_err(KeysetError::event)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(KeysetError::event)?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line).map_err(KeysetError::event)?);
        }
        Ok(entries)
    }

    /// Most recent `limit` entries, newest first.
    pub fn tail(&self, limit: usize) -> KeysetResult<Vec<ChainedEvent>> {
        let entries = self.read_all()?;
        let start = entries.len().saturating_sub(limit);
        let mut recent: Vec<_> = entries.into_iter().skip(start).collect();
        recent.reverse();
        Ok(recent)
    }

    /// Recompute the chain; returns the number of entries checked.
    pub fn verify_chain(&self) -> KeysetResult<usize> {
        let entries = self.read_all()?;
        let mut prev: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            let expected = compute_event_hash(&entry.event, prev.as_deref())?;
            if entry.prev_hash != prev || entry.hash != expected {
                return Err(KeysetError::event(format!(
                    "event chain broken at entry {index} ({})",
                    entry.event.id
                )));
            }
            prev = Some(entry.hash.clone());
        }
        Ok(entries.len())
    }
}

impl EventSink for FileEventLog {
    fn publish(&self, event: &LifecycleEvent) -> KeysetResult<()> {
        let _guard = self.append_lock.lock();
        let mut options = OpenOptions::new();
        options.create(true).read(true).append(true);
        let mut file =
            fsutil::open_private(&self.path, &mut options).map_err(KeysetError::event)?;
        FileExt::lock_exclusive(&file).map_err(KeysetError::event)?;

        let prev_hash = last_entry_hash(&mut file)?;
        let hash = compute_event_hash(event, prev_hash.as_deref())?;
        let entry = ChainedEvent {
            event: event.clone(),
            prev_hash,
            hash: hash.clone(),
        };
        let mut writer = BufWriter::new(&file);
        serde_json::to_writer(&mut writer, &entry).map_err(KeysetError::event)?;
        writer.write_all(b"\n").map_err(KeysetError::event)?;
        writer.flush().map_err(KeysetError::event)?;
        drop(writer);
        file.sync_all().map_err(KeysetError::event)?;
        FileExt::unlock(&file).map_err(KeysetError::event)?;
        Ok(())
    }
}

/// Hash of the final entry, scanning backwards from the end of the file.
fn last_entry_hash(file: &mut File) -> KeysetResult<Option<String>> {
    let len = file.seek(SeekFrom::End(0)).map_err(KeysetError::event)?;
    let mut window = TAIL_WINDOW.min(len);
    while window > 0 {
        file.seek(SeekFrom::Start(len - window))
            .map_err(KeysetError::event)?;
        let mut buf = vec![0u8; window as usize];
        file.read_exact(&mut buf).map_err(KeysetError::event)?;

        let end = buf
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |pos| pos + 1);
        let body = &buf[..end];
        let line = match body.iter().rposition(|b| *b == b'\n') {
            Some(pos) => &body[pos + 1..],
            None if window == len => body,
            None => {
                window = (window * 2).min(len);
                continue;
            }
        };
        if line.is_empty() {
            return Ok(None);
        }
        let entry: ChainedEvent = serde_json::from_slice(line).map_err(KeysetError::event)?;
        return Ok(Some(entry.hash));
    }
    Ok(None)
}

pub fn compute_event_hash(event: &LifecycleEvent, prev_hash: Option<&str>) -> KeysetResult<String> {
    #[derive(Serialize)]
    struct HashPayload<'a> {
        event: &'a LifecycleEvent,
        prev_hash: Option<&'a str>,
    }

    let payload =
        serde_json::to_vec(&HashPayload { event, prev_hash }).map_err(KeysetError::event)?;
    Ok(hex::encode(Sha256::digest(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_log_chains_hashes() {
        let dir = TempDir::new().expect("tempdir");
        let log = FileEventLog::new(dir.path().join("events.log")).expect("log");
        let id = Uuid::new_v4();
        log.publish(&LifecycleEvent::new(LifecycleEventKind::Created, id, "tenant"))
            .expect("created");
        log.publish(&LifecycleEvent::new(LifecycleEventKind::Rotated, id, "tenant"))
            .expect("rotated");

        let tail = log.tail(10).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event.kind, LifecycleEventKind::Rotated);
        assert_eq!(tail[0].prev_hash.as_deref(), Some(tail[1].hash.as_str()));
        assert_eq!(log.verify_chain().expect("verify"), 2);
    }

    #[test]
    fn reopened_log_continues_chain() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        let id = Uuid::new_v4();
        FileEventLog::new(&path)
            .unwrap()
            .publish(&LifecycleEvent::new(LifecycleEventKind::Created, id, "t"))
            .unwrap();
        FileEventLog::new(&path)
            .unwrap()
            .publish(&LifecycleEvent::new(LifecycleEventKind::Destroyed, id, "t"))
            .unwrap();
        assert_eq!(FileEventLog::new(&path).unwrap().verify_chain().unwrap(), 2);
    }

    #[test]
    fn independent_writers_share_one_chain() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        let first = FileEventLog::new(&path).unwrap();
        let second = FileEventLog::new(&path).unwrap();
        let id = Uuid::new_v4();

        first
            .publish(&LifecycleEvent::new(LifecycleEventKind::Created, id, "t"))
            .unwrap();
        second
            .publish(&LifecycleEvent::new(LifecycleEventKind::Disabled, id, "t"))
            .unwrap();
        first
            .publish(&LifecycleEvent::new(LifecycleEventKind::Activated, id, "t"))
            .unwrap();
        second
            .publish(&LifecycleEvent::new(LifecycleEventKind::Rotated, id, "t"))
            .unwrap();

        assert_eq!(first.verify_chain().unwrap(), 4);
    }

    #[test]
    fn last_hash_is_found_beyond_one_tail_window() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        let log = FileEventLog::new(&path).unwrap();
        let long_namespace = "n".repeat(TAIL_WINDOW as usize * 2);
        let id = Uuid::new_v4();
        log.publish(&LifecycleEvent::new(LifecycleEventKind::Created, id, long_namespace.as_str()))
            .unwrap();
        log.publish(&LifecycleEvent::new(LifecycleEventKind::Rotated, id, long_namespace.as_str()))
            .unwrap();
        assert_eq!(log.verify_chain().unwrap(), 2);
    }

    #[test]
    fn tampered_entry_breaks_chain() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        let log = FileEventLog::new(&path).unwrap();
        log.publish(&LifecycleEvent::new(
            LifecycleEventKind::Created,
            Uuid::new_v4(),
            "tenant-a",
        ))
        .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("tenant-a", "tenant-b")).unwrap();
        assert!(matches!(log.verify_chain(), Err(KeysetError::Event(_))));
    }
}
