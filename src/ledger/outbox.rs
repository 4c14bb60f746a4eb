//! Append-only crash-recovery journal (§4.3). Every ledger mutation is
//! written here first; on restart the journal is replayed to rebuild the
//! in-memory index before the router accepts new work.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Eviction cap for the in-memory replay index; the journal file itself is
/// never truncated by this cap, only the index kept hot in RAM.
const MAX_INDEX_ENTRIES: usize = 200_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub intent_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

struct OutboxState {
    file: File,
    index: HashMap<String, OutboxRecord>,
    order: std::collections::VecDeque<String>,
}

/// Append-only JSONL journal with a bounded in-memory index keyed by
/// `intent_id`. Writers fsync after every append; replay on startup
/// reconstructs the index from the file on disk.
pub struct Outbox {
    path: PathBuf,
    state: Mutex<OutboxState>,
}

impl Outbox {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .context("failed to create outbox directory")?;
            }
        }

        let (index, order) = Self::replay(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("failed to open outbox journal")?;

        info!(path = %path.display(), entries = index.len(), "outbox journal opened");

        Ok(Self {
            path,
            state: Mutex::new(OutboxState { file, index, order }),
        })
    }

    async fn replay(path: &Path) -> Result<(HashMap<String, OutboxRecord>, std::collections::VecDeque<String>)> {
        let mut index = HashMap::new();
        let mut order = std::collections::VecDeque::new();

        if !path.exists() {
            return Ok((index, order));
        }

        let file = File::open(path).await.context("failed to open outbox for replay")?;
        let mut lines = BufReader::new(file).lines();
        let mut malformed = 0usize;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OutboxRecord>(&line) {
                Ok(record) => {
                    if !index.contains_key(&record.intent_id) {
                        order.push_back(record.intent_id.clone());
                    }
                    index.insert(record.intent_id.clone(), record);
                }
                Err(_) => malformed += 1,
            }
        }

        if malformed > 0 {
            warn!(malformed, "outbox replay skipped malformed lines");
        }

        while index.len() > MAX_INDEX_ENTRIES {
            if let Some(oldest) = order.pop_front() {
                index.remove(&oldest);
            } else {
                break;
            }
        }

        Ok((index, order))
    }

    /// Appends a record, fsyncing before returning so a crash immediately
    /// after `append` still has the write durable on disk.
    pub async fn append(&self, intent_id: impl Into<String>, kind: impl Into<String>, payload: serde_json::Value) -> Result<()> {
        let record = OutboxRecord {
            intent_id: intent_id.into(),
            kind: kind.into(),
            payload,
            ts: Utc::now(),
        };

        let mut line = serde_json::to_string(&record).context("failed to serialize outbox record")?;
        line.push('\n');

        let mut state = self.state.lock().await;
        state.file.write_all(line.as_bytes()).await.context("failed to append outbox record")?;
        state.file.flush().await.context("failed to flush outbox record")?;
        state.file.sync_data().await.context("failed to fsync outbox record")?;

        if !state.index.contains_key(&record.intent_id) {
            state.order.push_back(record.intent_id.clone());
        }
        state.index.insert(record.intent_id.clone(), record);

        while state.index.len() > MAX_INDEX_ENTRIES {
            if let Some(oldest) = state.order.pop_front() {
                state.index.remove(&oldest);
            } else {
                break;
            }
        }

        Ok(())
    }

    pub async fn get(&self, intent_id: &str) -> Option<OutboxRecord> {
        self.state.lock().await.index.get(intent_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.index.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_path::temp_journal_path;

    mod tempfile_path {
        use std::path::PathBuf;

        pub fn temp_journal_path(name: &str) -> PathBuf {
            let mut dir = std::env::temp_dir();
            dir.push(format!("execution-core-outbox-test-{name}-{}.jsonl", std::process::id()));
            dir
        }
    }

    #[tokio::test]
    async fn test_append_then_replay_recovers_records() {
        let path = temp_journal_path("replay");
        let _ = fs::remove_file(&path).await;

        {
            let outbox = Outbox::open(&path).await.unwrap();
            outbox
                .append("intent-1", "submit", serde_json::json!({"qty": "1.0"}))
                .await
                .unwrap();
        }

        let reopened = Outbox::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.get("intent-1").await.is_some());

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_last_write_wins_for_same_intent() {
        let path = temp_journal_path("overwrite");
        let _ = fs::remove_file(&path).await;

        let outbox = Outbox::open(&path).await.unwrap();
        outbox.append("intent-1", "submit", serde_json::json!({"v": 1})).await.unwrap();
        outbox.append("intent-1", "ack", serde_json::json!({"v": 2})).await.unwrap();

        let record = outbox.get("intent-1").await.unwrap();
        assert_eq!(record.kind, "ack");
        assert_eq!(outbox.len().await, 1);

        let _ = fs::remove_file(&path).await;
    }
}
