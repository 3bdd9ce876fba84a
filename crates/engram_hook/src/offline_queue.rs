//! Durable FIFO replay buffer for hook events.
//!
//! Backed by a JSON-lines file under the Engram home. Entries keep total
//! enqueue order; replay is oldest-first. The queue is bounded: when full,
//! the oldest entry is dropped with an audit log line. Per-process only -
//! each hook process owns its own file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use engram_protocol::defaults::{OFFLINE_QUEUE_MAX_ENTRIES, OFFLINE_QUEUE_RETRY_CAP};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub id: String,
    pub event_type: String,
    /// Ingress path to replay against, e.g. `/api/hooks/observation`.
    pub path: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    max_entries: usize,
    retry_cap: u32,
    entries: Mutex<Vec<OfflineQueueEntry>>,
}

impl OfflineQueue {
    /// Open (or create) the queue file and load surviving entries.
    /// Malformed lines are dropped with a warning rather than poisoning
    /// the whole queue.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_limits(path, OFFLINE_QUEUE_MAX_ENTRIES, OFFLINE_QUEUE_RETRY_CAP)
    }

    pub fn open_with_limits(path: &Path, max_entries: usize, retry_cap: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create queue directory {}", parent.display()))?;
        }

        let mut entries = Vec::new();
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read offline queue {}", path.display()))?;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<OfflineQueueEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Dropping malformed offline queue line: {}", e),
                }
            }
        }

        debug!(
            "Offline queue opened with {} entries ({})",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            max_entries: max_entries.max(1),
            retry_cap,
            entries: Mutex::new(entries),
        })
    }

    /// Append an event. O(1) in the common case; when the queue is full
    /// the oldest entry is evicted (audited) before the append.
    pub fn enqueue(
        &self,
        event_type: &str,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<String> {
        let entry = OfflineQueueEntry {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            path: path.to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        let id = entry.id.clone();

        let mut entries = self.entries.lock().expect("offline queue lock poisoned");
        if entries.len() >= self.max_entries {
            let dropped = entries.remove(0);
            warn!(
                dropped_id = %dropped.id,
                event_type = %dropped.event_type,
                enqueued_at = %dropped.enqueued_at,
                "Offline queue full; dropping oldest entry"
            );
            entries.push(entry);
            self.rewrite(&entries)?;
        } else {
            self.append_line(&entry)?;
            entries.push(entry);
        }
        Ok(id)
    }

    /// Oldest-first, non-destructive.
    pub fn peek(&self, n: usize) -> Vec<OfflineQueueEntry> {
        let entries = self.entries.lock().expect("offline queue lock poisoned");
        entries.iter().take(n).cloned().collect()
    }

    /// Drop acknowledged entries.
    pub fn remove(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let drop: HashSet<&String> = ids.iter().collect();
        let mut entries = self.entries.lock().expect("offline queue lock poisoned");
        entries.retain(|entry| !drop.contains(&entry.id));
        self.rewrite(&entries)
    }

    /// Bump retry counts; entries past the cap are evicted and returned.
    pub fn mark_retried(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let bump: HashSet<&String> = ids.iter().collect();
        let mut exceeded = Vec::new();

        let mut entries = self.entries.lock().expect("offline queue lock poisoned");
        for entry in entries.iter_mut() {
            if bump.contains(&entry.id) {
                entry.retry_count += 1;
            }
        }
        entries.retain(|entry| {
            if entry.retry_count > self.retry_cap {
                warn!(
                    entry_id = %entry.id,
                    retries = entry.retry_count,
                    "Offline entry exceeded retry cap; evicting"
                );
                exceeded.push(entry.id.clone());
                false
            } else {
                true
            }
        });
        self.rewrite(&entries)?;
        Ok(exceeded)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("offline queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_line(&self, entry: &OfflineQueueEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open offline queue {}", self.path.display()))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn rewrite(&self, entries: &[OfflineQueueEntry]) -> Result<()> {
        let mut out = String::new();
        for entry in entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        fs::write(&self.path, out)
            .with_context(|| format!("Failed to rewrite offline queue {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> OfflineQueue {
        OfflineQueue::open_with_limits(&dir.path().join("offline.jsonl"), 5, 2).unwrap()
    }

    #[test]
    fn test_fifo_order_preserved() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);

        for i in 0..3 {
            queue
                .enqueue("observation", "/api/hooks/observation", serde_json::json!({"n": i}))
                .unwrap();
        }

        let peeked = queue.peek(10);
        assert_eq!(peeked.len(), 3);
        assert_eq!(peeked[0].payload["n"], 0);
        assert_eq!(peeked[2].payload["n"], 2);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline.jsonl");

        let first = OfflineQueue::open_with_limits(&path, 5, 2).unwrap();
        let id = first
            .enqueue("observation", "/api/hooks/observation", serde_json::json!({"n": 1}))
            .unwrap();
        drop(first);

        let reopened = OfflineQueue::open_with_limits(&path, 5, 2).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.peek(1)[0].id, id);
    }

    #[test]
    fn test_remove_acknowledged() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);

        let a = queue
            .enqueue("observation", "/api/hooks/observation", serde_json::json!({}))
            .unwrap();
        let b = queue
            .enqueue("observation", "/api/hooks/observation", serde_json::json!({}))
            .unwrap();

        queue.remove(&[a]).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek(1)[0].id, b);
    }

    #[test]
    fn test_retry_cap_evicts() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let id = queue
            .enqueue("observation", "/api/hooks/observation", serde_json::json!({}))
            .unwrap();

        assert!(queue.mark_retried(&[id.clone()]).unwrap().is_empty());
        assert!(queue.mark_retried(&[id.clone()]).unwrap().is_empty());
        // Third failure crosses the cap of 2.
        let exceeded = queue.mark_retried(&[id.clone()]).unwrap();
        assert_eq!(exceeded, vec![id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);

        for i in 0..7 {
            queue
                .enqueue("observation", "/api/hooks/observation", serde_json::json!({"n": i}))
                .unwrap();
        }

        assert_eq!(queue.len(), 5);
        let peeked = queue.peek(5);
        // 0 and 1 were dropped; order of the survivors is intact.
        assert_eq!(peeked[0].payload["n"], 2);
        assert_eq!(peeked[4].payload["n"], 6);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline.jsonl");
        fs::write(&path, "not json\n").unwrap();

        let queue = OfflineQueue::open_with_limits(&path, 5, 2).unwrap();
        assert!(queue.is_empty());
        queue
            .enqueue("observation", "/api/hooks/observation", serde_json::json!({}))
            .unwrap();
        assert_eq!(queue.len(), 1);
    }
}
