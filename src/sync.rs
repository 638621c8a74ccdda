//! Sync ingest (§4.7): accepts a batch of events originating on a peer
//! daemon and integrates them idempotently, preserving the peer's
//! `origin_daemon` and `sequence` rather than re-stamping them locally.
//! Reuses the append/project/notify steps of `writer::write_event` but
//! skips sequence assignment entirely, since the peer already assigned it.

use std::ops::Range;

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::log::{LogWriter, ShardId};
use crate::models::Event;
use crate::projection;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub event_id: String,
    pub type_: String,
    pub timestamp: String,
    pub origin_daemon: String,
    pub sequence: u64,
    pub v: u32,
    pub body: serde_json::Value,
    /// Author agent id, if this is a message-family event, used for shard
    /// routing the same way local writes are routed.
    pub author_agent_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub accepted: usize,
    pub skipped_duplicate: usize,
    pub gaps: Vec<(String, Range<u64>)>,
}

/// Ingests a batch in order. Legacy events missing `origin_daemon` are
/// rejected outright rather than stamped with the local daemon's identity,
/// since that would collide with genuine sync ingest from a peer that
/// really did omit it.
pub fn ingest_batch(
    store: &Store,
    log: &LogWriter,
    bus: &NotificationBus,
    batch: Vec<InboundEvent>,
) -> Result<IngestReport, Error> {
    if store.is_migrating() {
        return Err(Error::Unavailable("migration in progress".to_string()));
    }

    let mut report = IngestReport::default();

    for inbound in batch {
        if inbound.origin_daemon.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "event {} is missing origin_daemon; legacy relabeling is not supported",
                inbound.event_id
            )));
        }

        if store.event_exists(&inbound.event_id)? {
            report.skipped_duplicate += 1;
            continue;
        }

        let shard = match &inbound.author_agent_id {
            Some(agent_id) => ShardId::for_author(agent_id),
            None => ShardId::Events,
        };

        let record = serde_json::json!({
            "event_id": inbound.event_id,
            "type": inbound.type_,
            "timestamp": inbound.timestamp,
            "origin_daemon": inbound.origin_daemon,
            "sequence": inbound.sequence,
            "v": inbound.v,
            "body": inbound.body,
        });

        log.append(&shard, &record)?;

        let event_json = serde_json::to_string(&record)
            .map_err(|e| Error::Internal(format!("event serialization failed: {e}")))?;
        let inserted = store.insert_event_row(
            &inbound.event_id,
            inbound.sequence,
            &inbound.type_,
            &inbound.timestamp,
            &inbound.origin_daemon,
            &event_json,
        )?;

        if inserted {
            report.accepted += 1;
            let event = Event {
                event_id: inbound.event_id,
                type_: inbound.type_,
                timestamp: inbound.timestamp,
                origin_daemon: inbound.origin_daemon,
                sequence: inbound.sequence,
                v: inbound.v,
                body: inbound.body,
            };

            // Step 5 of §4.7: project, same as a local write's step 7. A
            // projection failure here does not unwind the batch — the event
            // is already durable in the log and the `events` row, so the
            // offline recovery path (§7) can rebuild this row later; the
            // alternative of aborting ingest on one bad event would also
            // lose every event after it in the batch.
            if let Err(e) = projection::apply(store, &event) {
                eprintln!(
                    "⚠️  projection failed for ingested event {} ({}): {e}",
                    event.event_id, event.type_
                );
            }

            bus.publish(&event);
        } else {
            report.skipped_duplicate += 1;
        }
    }

    report.gaps = store.gap_report()?;
    Ok(report)
}
