//! Forward-only schema migrations, applied transactionally. On open: read
//! the current `schema_version`, apply every pending migration inside one
//! transaction each, and abort startup on the first failure rather than
//! leave a half-applied version, in place of ad-hoc idempotent
//! `ALTER TABLE ... ADD COLUMN` calls guarded by `.ok()`.

use rusqlite::Connection;

use crate::error::Error;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
        CREATE TABLE schema_version (version INTEGER NOT NULL);

        CREATE TABLE events (
            event_id TEXT PRIMARY KEY,
            sequence INTEGER NOT NULL UNIQUE,
            type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            origin_daemon TEXT NOT NULL,
            event_json TEXT NOT NULL
        );
        CREATE INDEX idx_events_origin_sequence ON events(origin_daemon, sequence);

        CREATE TABLE agents (
            agent_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            role TEXT NOT NULL,
            module TEXT,
            display TEXT,
            registered_at TEXT NOT NULL,
            last_seen_at TEXT,
            deleted_at TEXT
        );
        CREATE INDEX idx_agents_role ON agents(role) WHERE deleted_at IS NULL;

        CREATE TABLE sessions (
            session_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL REFERENCES agents(agent_id),
            started_at TEXT NOT NULL,
            ended_at TEXT,
            active INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX idx_sessions_agent ON sessions(agent_id);

        CREATE TABLE threads (
            thread_id TEXT PRIMARY KEY,
            title TEXT,
            created_at TEXT NOT NULL,
            created_by TEXT NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            last_message_at TEXT
        );

        CREATE TABLE messages (
            message_id TEXT PRIMARY KEY,
            thread_id TEXT REFERENCES threads(thread_id),
            agent_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            format TEXT NOT NULL,
            content TEXT NOT NULL,
            structured TEXT,
            scopes TEXT NOT NULL DEFAULT '[]',
            refs TEXT NOT NULL DEFAULT '[]',
            mentions TEXT NOT NULL DEFAULT '[]',
            reply_to TEXT,
            disclosed INTEGER NOT NULL DEFAULT 0,
            authored_by TEXT,
            sequence INTEGER NOT NULL
        );
        CREATE INDEX idx_messages_thread ON messages(thread_id);
        CREATE INDEX idx_messages_agent ON messages(agent_id);
        CREATE INDEX idx_messages_reply_to ON messages(reply_to);
        CREATE INDEX idx_messages_sequence ON messages(sequence);

        CREATE TABLE groups (
            group_id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            created_at TEXT NOT NULL,
            created_by TEXT NOT NULL
        );

        CREATE TABLE group_members (
            group_id TEXT NOT NULL REFERENCES groups(group_id),
            member_type TEXT NOT NULL,
            member_value TEXT NOT NULL,
            added_at TEXT NOT NULL,
            added_by TEXT NOT NULL,
            PRIMARY KEY (group_id, member_type, member_value)
        );

        CREATE TABLE read_markers (
            viewer_id TEXT NOT NULL,
            message_id TEXT NOT NULL REFERENCES messages(message_id),
            read_at TEXT,
            PRIMARY KEY (viewer_id, message_id)
        );

        CREATE TABLE subscriptions (
            subscription_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(session_id),
            filter_type TEXT NOT NULL,
            scope_type TEXT,
            scope_value TEXT,
            mention TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX idx_subscriptions_session ON subscriptions(session_id);
    "#,
}];

/// Applies every migration whose version is greater than the store's
/// current `schema_version`, each inside its own transaction. A failure
/// mid-migration rolls back that transaction (rusqlite's `Transaction`
/// rolls back on `Drop` unless explicitly committed) and aborts startup.
pub fn run(conn: &mut Connection) -> Result<(), Error> {
    let current = current_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Internal(format!("failed to open migration transaction: {e}")))?;
        tx.execute_batch(migration.sql).map_err(|e| {
            Error::Internal(format!(
                "migration {} failed, aborting startup: {e}",
                migration.version
            ))
        })?;
        if migration.version == 1 {
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [migration.version])
                .map_err(|e| Error::Internal(format!("failed to stamp schema_version: {e}")))?;
        } else {
            tx.execute("UPDATE schema_version SET version = ?1", [migration.version])
                .map_err(|e| Error::Internal(format!("failed to stamp schema_version: {e}")))?;
        }
        tx.commit()
            .map_err(|e| Error::Internal(format!("failed to commit migration {}: {e}", migration.version)))?;
        eprintln!("📦 applied schema migration {}", migration.version);
    }

    Ok(())
}

fn current_version(conn: &Connection) -> Result<i64, Error> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false);

    if !table_exists {
        return Ok(0);
    }

    conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .map_err(|e| Error::Internal(format!("failed to read schema_version: {e}")))
}

// --- side migrations (file layout, not SQL) --------------------------------
//
// Run once at startup by the same engine, before the SQL migrations above
// touch anything: these operate on the JSONL log files, not the projection.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};

/// If a legacy monolithic `messages.jsonl` is present at the sync dir root,
/// splits it into per-agent shards under `messages/`, preserving order.
/// Writes to a temp directory and renames into place so a crash mid-split
/// leaves either the original file untouched or the fully-split shards,
/// never a partial mix. A no-op if no legacy file exists.
pub fn shard_legacy_messages_file(sync_dir: &Path) -> Result<(), Error> {
    let legacy_path = sync_dir.join("messages.jsonl");
    if !legacy_path.exists() {
        return Ok(());
    }

    let reader = BufReader::new(fs::File::open(&legacy_path)?);
    let mut by_shard: HashMap<String, Vec<String>> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue, // trailing partial line from a prior crash; dropped, not carried forward
        };
        let author = record
            .get("body")
            .and_then(|b| b.get("agent_id"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        by_shard.entry(crate::ids::agent_id_to_name(author)).or_default().push(line);
    }

    let tmp_dir = sync_dir.join(format!(".migrate-tmp-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&tmp_dir)?;
    let messages_dir = sync_dir.join("messages");
    fs::create_dir_all(&messages_dir)?;

    for (shard_name, lines) in &by_shard {
        let mut content = lines.join("\n");
        content.push('\n');
        let tmp_path = tmp_dir.join(format!("{shard_name}.jsonl"));
        fs::write(&tmp_path, &content)?;

        let dest_path = messages_dir.join(format!("{shard_name}.jsonl"));
        if dest_path.exists() {
            // A shard already exists (the daemon has been writing under the
            // new layout for a while); legacy lines are strictly older, so
            // they're prepended to preserve chronological order.
            let existing = fs::read_to_string(&dest_path)?;
            fs::write(&dest_path, format!("{content}{existing}"))?;
        } else {
            fs::rename(&tmp_path, &dest_path)?;
        }
    }

    fs::remove_dir_all(&tmp_dir).ok();
    fs::remove_file(&legacy_path)?;
    eprintln!("📦 split legacy messages.jsonl into {} per-agent shard(s)", by_shard.len());
    Ok(())
}

/// Assigns a deterministic `event_id` to any JSONL record missing one,
/// derived from `(timestamp, type, hash-of-body)` so re-ingesting the same
/// legacy event twice still dedupes correctly. Rewrites affected shard
/// files in place via a temp file plus rename.
pub fn backfill_event_ids(sync_dir: &Path) -> Result<usize, Error> {
    let mut backfilled = 0;

    let events_path = sync_dir.join("events.jsonl");
    if events_path.exists() {
        backfilled += backfill_file(&events_path)?;
    }

    let messages_dir = sync_dir.join("messages");
    if messages_dir.exists() {
        for entry in fs::read_dir(&messages_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                backfilled += backfill_file(&path)?;
            }
        }
    }

    if backfilled > 0 {
        eprintln!("📦 backfilled {backfilled} legacy event(s) missing event_id");
    }
    Ok(backfilled)
}

fn backfill_file(path: &Path) -> Result<usize, Error> {
    let content = fs::read_to_string(path)?;
    let mut changed = 0;
    let mut out_lines = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut record: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                out_lines.push(line.to_string());
                continue;
            }
        };
        if record.get("event_id").and_then(|v| v.as_str()).is_none() {
            record["event_id"] = serde_json::Value::String(deterministic_event_id(&record));
            changed += 1;
        }
        out_lines.push(record.to_string());
    }

    if changed > 0 {
        let mut content = out_lines.join("\n");
        content.push('\n');
        let tmp_path = path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;
    }
    Ok(changed)
}

/// `evt_` plus a 26-hex-character digest of `(timestamp, type, body)` —
/// deterministic so the same legacy line backfilled twice (e.g. on two
/// daemons that both received a pre-event_id export) lands on the same id.
/// Not lexicographically sortable by time like `ids::new_event_id`'s
/// suffix; that tradeoff is acceptable for events that predate the ID
/// scheme entirely.
fn deterministic_event_id(record: &serde_json::Value) -> String {
    let timestamp = record.get("timestamp").and_then(|v| v.as_str()).unwrap_or("");
    let type_ = record.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let body = record.get("body").map(|b| b.to_string()).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(type_.as_bytes());
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    format!("evt_{}", hex::encode(&digest[..13]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_ends_at_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn migrations_are_idempotent_to_run_twice() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn legacy_messages_file_is_split_by_author_and_removed() {
        let dir = std::env::temp_dir().join(format!("thrum-migrate-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let legacy = serde_json::json!({"type": "message.create", "body": {"agent_id": "agent:reviewer:ABC123", "content": "hi"}});
        let legacy2 = serde_json::json!({"type": "message.create", "body": {"agent_id": "agent:implementer:XYZ789", "content": "yo"}});
        fs::write(
            dir.join("messages.jsonl"),
            format!("{}\n{}\n", legacy, legacy2),
        )
        .unwrap();

        shard_legacy_messages_file(&dir).unwrap();

        assert!(!dir.join("messages.jsonl").exists());
        assert!(dir.join("messages").join("reviewer_ABC123.jsonl").exists());
        assert!(dir.join("messages").join("implementer_XYZ789.jsonl").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn shard_split_is_a_no_op_without_a_legacy_file() {
        let dir = std::env::temp_dir().join(format!("thrum-migrate-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        shard_legacy_messages_file(&dir).unwrap();
        assert!(!dir.join("messages").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn backfill_assigns_deterministic_ids_to_records_missing_one() {
        let dir = std::env::temp_dir().join(format!("thrum-migrate-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let record = serde_json::json!({"type": "agent.register", "timestamp": "2026-01-01T00:00:00Z", "body": {"role": "reviewer"}});
        fs::write(dir.join("events.jsonl"), format!("{record}\n")).unwrap();

        let first_pass = backfill_event_ids(&dir).unwrap();
        assert_eq!(first_pass, 1);

        let content = fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let rewritten: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        let id_after_first_pass = rewritten.get("event_id").and_then(|v| v.as_str()).unwrap().to_string();
        assert!(id_after_first_pass.starts_with("evt_"));

        // A second backfill over an event that now already has an event_id
        // must be a no-op, and the previously-assigned id must be stable.
        let second_pass = backfill_event_ids(&dir).unwrap();
        assert_eq!(second_pass, 0);
        let content = fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let unchanged: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(unchanged.get("event_id").and_then(|v| v.as_str()).unwrap(), id_after_first_pass);

        fs::remove_dir_all(&dir).ok();
    }
}
