//! Lifecycle & supervision (§4.8). Startup (migrate, open the writer, mint
//! the daemon identity, announce `daemon.start`), background loops
//! (heartbeat, stale-subscription sweep, projection health probe), and
//! shutdown draining. Each background loop follows the same shape: an
//! initial delay, then a fixed-interval `tokio::time::sleep` loop that logs
//! and continues on error rather than panicking.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::NotificationBus;
use crate::config::Config;
use crate::dispatch::EVERYONE_GROUP;
use crate::error::Error;
use crate::ids;
use crate::log::LogWriter;
use crate::migrations;
use crate::models::{Daemon, Event, Group};
use crate::projection;
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

pub struct ProjectionHealth {
    pub healthy: AtomicBool,
}

impl Default for ProjectionHealth {
    fn default() -> Self {
        ProjectionHealth {
            healthy: AtomicBool::new(true),
        }
    }
}

/// Opens the store and log writer, runs migrations, mints the daemon
/// identity, seeds the `everyone` group if absent, and announces
/// `daemon.start` through the normal write funnel.
pub fn startup(config: &Config, repo_id: &str, repo_path: &str) -> Result<(Store, EventWriter, Daemon), Error> {
    std::fs::create_dir_all(&config.sync_dir)?;
    std::fs::create_dir_all(config.identities_dir())?;
    std::fs::create_dir_all(config.context_dir())?;

    // Side migrations run on the JSONL layout before anything opens those
    // files, so both the log writer and the SQL projection always see the
    // current per-agent shard layout and backfilled ids.
    migrations::shard_legacy_messages_file(&config.sync_dir)?;
    migrations::backfill_event_ids(&config.sync_dir)?;

    let store = Store::open(config.projection_db_path())?;
    let log = LogWriter::open(&config.sync_dir)?;
    let last_sequence = store.max_sequence()?;

    let daemon = Daemon {
        daemon_id: ids::new_daemon_id(),
        repo_id: repo_id.to_string(),
        repo_path: repo_path.to_string(),
        sync_dir: config.sync_dir.display().to_string(),
        started_at: ids::now_rfc3339(),
    };

    let writer = EventWriter::new(daemon.daemon_id.clone(), log, last_sequence);

    if store.get_group_by_name(EVERYONE_GROUP)?.is_none() {
        store.insert_group(&Group {
            group_id: ids::new_group_id(),
            name: EVERYONE_GROUP.to_string(),
            description: Some("every registered agent".to_string()),
            created_at: ids::now_rfc3339(),
            created_by: daemon.daemon_id.clone(),
        })?;
    }

    eprintln!(
        "📡 thrum daemon {} started for repo {} (sync dir: {})",
        daemon.daemon_id, daemon.repo_id, daemon.sync_dir
    );

    Ok((store, writer, daemon))
}

/// Publishes `daemon.start` through the write funnel. Split from `startup`
/// so callers that need the bus (constructed after the store/writer in
/// `lib.rs`'s composition root) can call it once everything is wired up.
pub fn announce_start(writer: &EventWriter, store: &Store, bus: &NotificationBus, daemon: &Daemon) -> Result<(), Error> {
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "daemon.start".to_string(),
            origin_daemon: Some(daemon.daemon_id.clone()),
            timestamp: None,
            v: None,
            body: serde_json::json!({
                "daemon_id": daemon.daemon_id,
                "repo_id": daemon.repo_id,
            }),
            author_agent_id: None,
        },
        // `daemon.start` has no domain table of its own (projection::apply's
        // no-op default arm), so there is no projection write here.
        |_event| Ok(()),
    )?;
    Ok(())
}

/// Background loop: refreshes `agents.last_seen_at` for every active
/// session's owning agent on an interval.
pub fn spawn_heartbeat(store: Arc<Store>, interval_secs: u64, shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match store.list_sessions(None, true) {
                Ok(sessions) => {
                    let now = ids::now_rfc3339();
                    for session in sessions {
                        if let Err(e) = store.touch_agent_last_seen(&session.agent_id, &now) {
                            eprintln!("⚠️ heartbeat: failed to update {}: {e}", session.agent_id);
                        }
                    }
                }
                Err(e) => eprintln!("⚠️ heartbeat: failed to list sessions: {e}"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
        }
    });
}

/// Background loop: sweeps sessions that ended without their subscriptions
/// being torn down (e.g. an unclean connection close), deleting any
/// orphaned subscription rows.
pub fn spawn_stale_subscription_sweep(
    store: Arc<Store>,
    bus: Arc<NotificationBus>,
    interval_secs: u64,
    shutdown: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match store.list_sessions(None, false) {
                Ok(sessions) => {
                    for session in sessions.iter().filter(|s| !s.active) {
                        match store.delete_subscriptions_for_session(&session.session_id) {
                            Ok(n) if n > 0 => {
                                bus.end_session(&session.session_id);
                                eprintln!(
                                    "🧹 stale-subscription sweep: removed {n} subscriptions for ended session {}",
                                    session.session_id
                                );
                            }
                            Ok(_) => {}
                            Err(e) => eprintln!("⚠️ stale-subscription sweep failed: {e}"),
                        }
                    }
                }
                Err(e) => eprintln!("⚠️ stale-subscription sweep: failed to list sessions: {e}"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
        }
    });
}

/// Background loop: periodically probes that the projection store answers
/// a trivial query, marking `ProjectionHealth` unhealthy if not. A
/// projector failure after a successful append leaves the event durable
/// but not queryable, so the daemon logs and marks itself unhealthy rather
/// than crash.
pub fn spawn_projection_health_probe(
    store: Arc<Store>,
    health: Arc<ProjectionHealth>,
    interval_secs: u64,
    shutdown: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match store.max_sequence() {
                Ok(_) => health.healthy.store(true, Ordering::SeqCst),
                Err(e) => {
                    health.healthy.store(false, Ordering::SeqCst);
                    eprintln!("⚠️ projection health probe failed: {e}");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
        }
    });
}

/// Stops accepting new RPCs (the caller flips its own flag before calling
/// this), then flushes and closes the log writer.
pub fn shutdown(writer: &EventWriter, shutdown_flag: &AtomicBool) {
    shutdown_flag.store(true, Ordering::SeqCst);
    writer.close();
    eprintln!("🛑 thrum daemon shutting down");
}

/// Offline recovery: rebuilds the SQL projection from scratch by replaying
/// `events.jsonl` and every `messages/*.jsonl` shard in strict sequence
/// order. Used when the projection db is lost, corrupted, or out of step
/// with the log — the log is the source of truth, the projection is a
/// cache over it. Not called from the normal startup path; a caller (CLI
/// tool, recovery RPC) invokes this before serving traffic again.
pub fn rebuild_projection(config: &Config) -> Result<Store, Error> {
    let db_path = config.projection_db_path();
    if db_path.exists() {
        fs::remove_file(&db_path)?;
    }
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let store = Store::open(&db_path)?;
    let mut records = read_all_log_records(&config.events_log_path())?;
    records.extend(read_all_shard_records(&config.messages_dir())?);
    records.sort_by_key(|r| r.get("sequence").and_then(|v| v.as_u64()).unwrap_or(0));

    let mut applied = 0;
    for record in &records {
        if apply_record(&store, record)? {
            applied += 1;
        }
    }
    eprintln!("📦 rebuilt projection from {applied} log record(s)");
    Ok(store)
}

fn read_all_log_records(path: &Path) -> Result<Vec<serde_json::Value>, Error> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

fn read_all_shard_records(messages_dir: &Path) -> Result<Vec<serde_json::Value>, Error> {
    if !messages_dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(messages_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            records.extend(read_all_log_records(&path)?);
        }
    }
    Ok(records)
}

/// Re-applies one logged event to the projection via the same
/// `projection::apply` the sync-ingest path uses — this is the inverse of
/// every `rpc::*` write path. Returns whether the event row was newly
/// inserted (idempotent re-runs of this function over an already-rebuilt
/// store apply nothing twice).
fn apply_record(store: &Store, record: &serde_json::Value) -> Result<bool, Error> {
    let event_id = record.get("event_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let sequence = record.get("sequence").and_then(|v| v.as_u64()).unwrap_or(0);
    let type_ = record.get("type").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let timestamp = record.get("timestamp").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let origin_daemon = record.get("origin_daemon").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let v = record.get("v").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    let event_json = record.to_string();
    let body = record.get("body").cloned().unwrap_or(serde_json::Value::Null);

    let newly_inserted = store.insert_event_row(&event_id, sequence, &type_, &timestamp, &origin_daemon, &event_json)?;
    if !newly_inserted {
        return Ok(false);
    }

    let event = Event {
        event_id,
        type_,
        timestamp,
        origin_daemon,
        sequence,
        v,
        body,
    };
    projection::apply(store, &event)?;
    Ok(true)
}
