//! The single write funnel (§4.3). Every locally generated event passes
//! through `write_event`: normalize, sequence, append to the log, insert the
//! raw `events` row, project, then publish — the same compute-seq/insert/
//! project/publish shape as a single message send, generalized from one
//! event type to every event type.
//!
//! Steps 4-8 (sequence, append, row insert, project, publish) run inside
//! one logical critical section, held for the duration of a single
//! `write_event` call: without it, two concurrent callers (Rocket dispatches
//! sync routes on a blocking pool, so two `message.send`s really can race)
//! could take sequence numbers 5 and 6, and the one that took 6 could reach
//! `bus.publish` before the one that took 5 — the bus delivers in publish
//! order, not sequence order, so a subscribed session would see 6 before 5
//! and invariant 6 (per-session delivery order matches `sequence`) would
//! break. Serializing the whole span on one lock makes that interleaving
//! impossible: only one call is ever inside steps 4-8 at a time, so publish
//! order is sequence order by construction.

use std::sync::Mutex;

use serde_json::Value;

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::ids;
use crate::log::{LogWriter, ShardId};
use crate::models::Event;
use crate::store::Store;

/// A raw event about to be written, before the writer synthesizes the
/// fields it's responsible for (`event_id`, `origin_daemon`, `v`,
/// `timestamp`).
pub struct RawEvent {
    pub event_id: Option<String>,
    pub type_: String,
    pub origin_daemon: Option<String>,
    pub timestamp: Option<String>,
    pub v: Option<u32>,
    pub body: Value,
    /// Shard this event routes to. `None` means `events.jsonl`.
    pub author_agent_id: Option<String>,
}

pub struct EventWriter {
    local_daemon_id: String,
    next_sequence: Mutex<u64>,
    log: LogWriter,
}

impl EventWriter {
    pub fn new(local_daemon_id: String, log: LogWriter, last_sequence: u64) -> Self {
        EventWriter {
            local_daemon_id,
            next_sequence: Mutex::new(last_sequence + 1),
            log,
        }
    }

    pub fn close(&self) {
        self.log.close();
    }

    /// Runs the full `WriteEvent` algorithm (§4.3 steps 1-8): normalize,
    /// assign sequence, append, insert the raw `events` row, project via
    /// `project`, then publish to `bus` -- all while holding
    /// `next_sequence`'s lock, so the whole span from sequence assignment to
    /// publish is one critical section per event, across every caller.
    ///
    /// `project` receives the stamped `Event` and is expected to write it
    /// into the relational store (insert/update the relevant table(s)).
    /// If it errors, the error propagates and the event is never published
    /// -- it is already durable in the log and the `events` row, just not
    /// yet queryable, matching §7's "durable but not queryable" projector
    /// failure semantics; the offline recovery path can rebuild it later.
    pub fn write_event<F>(&self, store: &Store, bus: &NotificationBus, raw: RawEvent, project: F) -> Result<Event, Error>
    where
        F: FnOnce(&Event) -> Result<(), Error>,
    {
        if store.is_migrating() {
            return Err(Error::Unavailable("migration in progress".to_string()));
        }

        let event_id = raw.event_id.unwrap_or_else(ids::new_event_id);
        let origin_daemon = raw.origin_daemon.unwrap_or_else(|| self.local_daemon_id.clone());
        let v = raw.v.unwrap_or(1);
        let timestamp = raw.timestamp.unwrap_or_else(ids::now_rfc3339);

        if origin_daemon.is_empty() {
            return Err(Error::InvalidArgument("origin_daemon must not be empty".to_string()));
        }

        let shard = match &raw.author_agent_id {
            Some(agent_id) => ShardId::for_author(agent_id),
            None => ShardId::Events,
        };

        // Steps 4-8 in one critical section: held from the sequence take
        // below through `bus.publish` at the bottom, so no other
        // `write_event` call can assign a sequence, let alone publish,
        // until this one is fully durable and delivered.
        let mut next_sequence = self.next_sequence.lock().unwrap();
        let sequence = *next_sequence;
        *next_sequence += 1;

        let event = Event {
            event_id: event_id.clone(),
            type_: raw.type_.clone(),
            timestamp: timestamp.clone(),
            origin_daemon: origin_daemon.clone(),
            sequence,
            v,
            body: raw.body.clone(),
        };

        let record = serde_json::json!({
            "event_id": event.event_id,
            "type": event.type_,
            "timestamp": event.timestamp,
            "origin_daemon": event.origin_daemon,
            "sequence": event.sequence,
            "v": event.v,
            "body": event.body,
        });

        // Step 5: append fails -> event lost, sequence gap recorded,
        // surfaced to caller. The counter has already advanced above; that
        // gap is permitted, per §4.3.
        self.log.append(&shard, &record)?;

        // Step 6: INSERT OR IGNORE into events.
        let event_json = serde_json::to_string(&record)
            .map_err(|e| Error::Internal(format!("event serialization failed: {e}")))?;
        store.insert_event_row(
            &event.event_id,
            event.sequence,
            &event.type_,
            &event.timestamp,
            &event.origin_daemon,
            &event_json,
        )?;

        // Step 7: project. Still under the lock, so a concurrent send can't
        // publish in between this event's projection write and its publish.
        project(&event)?;

        // Step 8: publish, same lock held the whole way down from the
        // sequence take above.
        bus.publish(&event);

        drop(next_sequence);
        Ok(event)
    }
}
