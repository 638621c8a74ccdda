//! Append-only log writer. Durably appends newline-delimited JSON records to
//! shard files under the sync directory; each shard is owned by one file
//! handle, cached under a map protected by its own mutex (two-tier locking:
//! one lock over the shard-to-handle map, one per open file).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::ids::agent_id_to_name;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardId {
    Events,
    Messages(String),
}

impl ShardId {
    pub fn for_author(agent_id: &str) -> ShardId {
        ShardId::Messages(agent_id_to_name(agent_id))
    }
}

pub struct LogWriter {
    sync_dir: PathBuf,
    handles: Mutex<HashMap<ShardId, Arc<Mutex<File>>>>,
}

impl LogWriter {
    pub fn open(sync_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let sync_dir = sync_dir.as_ref().to_path_buf();
        fs::create_dir_all(&sync_dir)?;
        fs::create_dir_all(sync_dir.join("messages"))?;
        Ok(LogWriter {
            sync_dir,
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn shard_path(&self, shard: &ShardId) -> PathBuf {
        match shard {
            ShardId::Events => self.sync_dir.join("events.jsonl"),
            ShardId::Messages(name) => self.sync_dir.join("messages").join(format!("{name}.jsonl")),
        }
    }

    /// Serializes `record`, writes it followed by `\n`, and flushes. Lazily
    /// opens (and caches) the shard's file handle on first use. No line
    /// interleaving across concurrent appends to the same shard: the
    /// per-shard lock is held for the whole write+flush.
    pub fn append(&self, shard: &ShardId, record: &serde_json::Value) -> Result<(), Error> {
        let line = serde_json::to_string(record)
            .map_err(|e| Error::Internal(format!("record serialization failed: {e}")))?;

        // The handle-cache mutex is held only long enough to fetch/insert a
        // clone of the per-shard `Arc<Mutex<File>>`; it is released before
        // the append so concurrent writes to different shards don't
        // serialize on the cache lock, only on their own shard's lock.
        let file_handle = {
            let mut handles = self.handles.lock().unwrap();
            if !handles.contains_key(shard) {
                let path = self.shard_path(shard);
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                handles.insert(shard.clone(), Arc::new(Mutex::new(file)));
            }
            handles.get(shard).expect("just inserted").clone()
        };

        let mut guard = file_handle.lock().unwrap();
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")?;
        guard.flush()?;
        Ok(())
    }

    pub fn close(&self) {
        let mut handles = self.handles.lock().unwrap();
        for (_, file) in handles.drain() {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("thrum_log_test_{tag}_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn append_creates_and_reopens_shard_across_writer_instances() {
        let dir = temp_dir("reopen");
        {
            let writer = LogWriter::open(&dir).unwrap();
            writer.append(&ShardId::Events, &json!({"n": 1})).unwrap();
        }
        {
            let writer = LogWriter::open(&dir).unwrap();
            writer.append(&ShardId::Events, &json!({"n": 2})).unwrap();
        }
        let contents = fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn message_shard_routes_by_agent_name() {
        let dir = temp_dir("shard");
        let writer = LogWriter::open(&dir).unwrap();
        let shard = ShardId::for_author("agent:reviewer:ABC123");
        writer.append(&shard, &json!({"n": 1})).unwrap();
        assert!(dir.join("messages/reviewer_ABC123.jsonl").exists());
        fs::remove_dir_all(&dir).ok();
    }
}
