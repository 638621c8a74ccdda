//! Subscription & notification bus. Per-session filter registrations, fan
//! out on every projected event, bounded delivery with a drop-oldest
//! overflow policy.
//!
//! Per-subscriber channel + filter struct + cursor replay shape, adapted to
//! three filter kinds: scope, role, and mention. `tokio::sync::broadcast`
//! isn't used here: a lagged broadcast receiver drops *everything* it
//! missed and reports one `Lagged` error, which can't express a per-session
//! drop counter. A plain bounded ring buffer per session, woken by
//! `tokio::sync::Notify`, can.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::models::{Event, FilterType};

#[derive(Debug, Clone)]
pub struct Notification {
    pub event: Event,
}

#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub subscription_id: String,
    pub filter_type: FilterType,
    pub scope_type: Option<String>,
    pub scope_value: Option<String>,
    pub mention: Option<String>,
}

impl SubscriptionFilter {
    fn matches(&self, event: &Event) -> bool {
        match self.filter_type {
            FilterType::All => true,
            FilterType::Scope => {
                let (Some(t), Some(v)) = (&self.scope_type, &self.scope_value) else {
                    return false;
                };
                event_scopes(event)
                    .iter()
                    .any(|s| &s.type_ == t && &s.value == v)
            }
            FilterType::Mention => {
                let Some(m) = &self.mention else {
                    return false;
                };
                event_mentions(event).iter().any(|x| x == m)
            }
        }
    }
}

fn event_scopes(event: &Event) -> Vec<crate::models::Scope> {
    event
        .body
        .get("scopes")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn event_mentions(event: &Event) -> Vec<String> {
    event
        .body
        .get("mentions")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

struct SessionQueue {
    filters: Vec<SubscriptionFilter>,
    queue: VecDeque<Notification>,
    capacity: usize,
    dropped_count: u64,
    notify: std::sync::Arc<tokio::sync::Notify>,
}

/// The notification bus: one bounded queue per session, guarded by a single
/// mutex (sessions are expected to be few relative to events, and every
/// operation below is O(sessions) at worst, a "one bounded channel per
/// session" resource policy without requiring a lock per queue).
pub struct NotificationBus {
    capacity: usize,
    sessions: Mutex<HashMap<String, SessionQueue>>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        NotificationBus {
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new filter for a session, creating its queue if absent.
    pub fn subscribe(&self, session_id: &str, filter: SubscriptionFilter) {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(|| SessionQueue {
            filters: Vec::new(),
            queue: VecDeque::new(),
            capacity: self.capacity,
            dropped_count: 0,
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
        });
        entry.filters.push(filter);
    }

    /// Removes a single subscription's filter from its session.
    pub fn unsubscribe(&self, session_id: &str, subscription_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.filters.retain(|f| f.subscription_id != subscription_id);
        }
    }

    /// Tears down every subscription owned by a session (`session.end` or
    /// connection close).
    pub fn end_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Publishes a projected event to every session with a matching filter.
    /// Never fails the writer: a full queue drops its oldest entry and
    /// increments that session's counter instead of erroring.
    pub fn publish(&self, event: &Event) {
        let mut sessions = self.sessions.lock().unwrap();
        for queue in sessions.values_mut() {
            if !queue.filters.iter().any(|f| f.matches(event)) {
                continue;
            }
            if queue.queue.len() >= queue.capacity {
                queue.queue.pop_front();
                queue.dropped_count += 1;
            }
            queue.queue.push_back(Notification { event: event.clone() });
            queue.notify.notify_waiters();
        }
    }

    /// Pops the next queued notification for a session, if any.
    pub fn try_recv(&self, session_id: &str) -> Option<Notification> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.get_mut(session_id).and_then(|q| q.queue.pop_front())
    }

    fn notify_handle(&self, session_id: &str) -> std::sync::Arc<tokio::sync::Notify> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionQueue {
                filters: Vec::new(),
                queue: VecDeque::new(),
                capacity: self.capacity,
                dropped_count: 0,
                notify: std::sync::Arc::new(tokio::sync::Notify::new()),
            })
            .notify
            .clone()
    }

    /// Long-poll: blocks until a notification is queued for `session_id` or
    /// `timeout` elapses. Returns `None` on timeout. Checks `cancelled`
    /// between wake-ups so a caller disconnect or daemon shutdown returns
    /// promptly instead of waiting out the full timeout.
    pub async fn wait(
        &self,
        session_id: &str,
        timeout: std::time::Duration,
        cancelled: &std::sync::atomic::AtomicBool,
    ) -> Option<Notification> {
        if let Some(n) = self.try_recv(session_id) {
            return Some(n);
        }
        let notify = self.notify_handle(session_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let step = remaining.min(std::time::Duration::from_millis(50));
            let _ = tokio::time::timeout(step, notify.notified()).await;
            if let Some(n) = self.try_recv(session_id) {
                return Some(n);
            }
        }
    }

    /// Number of notifications dropped for a session due to queue overflow,
    /// surfaced via `health`.
    pub fn dropped_count(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|q| q.dropped_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(seq: u64) -> Event {
        Event {
            event_id: format!("evt_{seq}"),
            type_: "message.create".to_string(),
            timestamp: crate::ids::now_rfc3339(),
            origin_daemon: "d_local".to_string(),
            sequence: seq,
            v: 1,
            body: json!({"scopes": [{"type": "project", "value": "x"}], "mentions": ["alice"]}),
        }
    }

    #[test]
    fn all_filter_matches_every_event() {
        let bus = NotificationBus::new(4);
        bus.subscribe(
            "ses_1",
            SubscriptionFilter {
                subscription_id: "sub_1".into(),
                filter_type: FilterType::All,
                scope_type: None,
                scope_value: None,
                mention: None,
            },
        );
        bus.publish(&sample_event(1));
        assert!(bus.try_recv("ses_1").is_some());
    }

    #[test]
    fn scope_filter_matches_type_and_value() {
        let bus = NotificationBus::new(4);
        bus.subscribe(
            "ses_1",
            SubscriptionFilter {
                subscription_id: "sub_1".into(),
                filter_type: FilterType::Scope,
                scope_type: Some("project".into()),
                scope_value: Some("x".into()),
                mention: None,
            },
        );
        bus.publish(&sample_event(1));
        assert!(bus.try_recv("ses_1").is_some());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let bus = NotificationBus::new(2);
        bus.subscribe(
            "ses_1",
            SubscriptionFilter {
                subscription_id: "sub_1".into(),
                filter_type: FilterType::All,
                scope_type: None,
                scope_value: None,
                mention: None,
            },
        );
        bus.publish(&sample_event(1));
        bus.publish(&sample_event(2));
        bus.publish(&sample_event(3));
        assert_eq!(bus.dropped_count("ses_1"), 1);
        let first = bus.try_recv("ses_1").unwrap();
        assert_eq!(first.event.sequence, 2);
    }

    #[test]
    fn end_session_removes_all_filters() {
        let bus = NotificationBus::new(4);
        bus.subscribe(
            "ses_1",
            SubscriptionFilter {
                subscription_id: "sub_1".into(),
                filter_type: FilterType::All,
                scope_type: None,
                scope_value: None,
                mention: None,
            },
        );
        bus.end_session("ses_1");
        bus.publish(&sample_event(1));
        assert!(bus.try_recv("ses_1").is_none());
    }
}
