//! `subscribe` / `unsubscribe` / `subscriptions.list` / `wait` (§4.5, §4.6).
//! The write funnel records subscription lifecycle for the event log and
//! sync, while the in-memory `NotificationBus` filter is what actually
//! gates delivery — the two are kept in lockstep by every handler below.
//! `wait` is a single-shot long-poll, not a stream, per the design notes:
//! one call returns at most one notification or times out.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rocket::serde::json::Json;
use rocket::{delete, get, post, State};
use serde::{Deserialize, Serialize};

use crate::bus::{NotificationBus, SubscriptionFilter};
use crate::error::Error;
use crate::ids;
use crate::models::{FilterType, Subscription};
use crate::rpc::{CancellationGuard, SessionContext};
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub filter_type: FilterType,
    #[serde(default)]
    pub scope_type: Option<String>,
    #[serde(default)]
    pub scope_value: Option<String>,
    #[serde(default)]
    pub mention: Option<String>,
}

/// Validates the filter shape matches its declared `filter_type` before
/// committing anything: a `scope` filter without both `scope_type` and
/// `scope_value`, or a `mention` filter without `mention`, can never match
/// an event and is rejected rather than silently accepted as dead weight.
fn validate_filter(body: &SubscribeRequest) -> Result<(), Error> {
    match body.filter_type {
        FilterType::Scope if body.scope_type.is_none() || body.scope_value.is_none() => Err(Error::InvalidArgument(
            "scope filters require scope_type and scope_value".to_string(),
        )),
        FilterType::Mention if body.mention.is_none() => {
            Err(Error::InvalidArgument("mention filters require mention".to_string()))
        }
        _ => Ok(()),
    }
}

#[post("/rpc/subscribe", data = "<body>")]
pub fn subscribe(
    body: Json<SubscribeRequest>,
    session: SessionContext,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<Subscription>, Error> {
    validate_filter(&body)?;

    let sub = Subscription {
        subscription_id: ids::new_subscription_id(),
        session_id: session.session_id.clone(),
        filter_type: body.filter_type,
        scope_type: body.scope_type.clone(),
        scope_value: body.scope_value.clone(),
        mention: body.mention.clone(),
        created_at: ids::now_rfc3339(),
    };

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "subscription.create".to_string(),
            origin_daemon: None,
            timestamp: Some(sub.created_at.clone()),
            v: None,
            body: serde_json::to_value(&sub).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: None,
        },
        |_event| {
            store.insert_subscription(&sub)?;
            bus.subscribe(
                &sub.session_id,
                SubscriptionFilter {
                    subscription_id: sub.subscription_id.clone(),
                    filter_type: sub.filter_type,
                    scope_type: sub.scope_type.clone(),
                    scope_value: sub.scope_value.clone(),
                    mention: sub.mention.clone(),
                },
            );
            Ok(())
        },
    )?;

    Ok(Json(sub))
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub subscription_id: String,
}

#[delete("/rpc/unsubscribe?<subscription_id>")]
pub fn unsubscribe(
    subscription_id: &str,
    session: SessionContext,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<UnsubscribeResponse>, Error> {
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "subscription.delete".to_string(),
            origin_daemon: None,
            timestamp: Some(ids::now_rfc3339()),
            v: None,
            body: serde_json::json!({"subscription_id": subscription_id}),
            author_agent_id: None,
        },
        |_event| {
            if !store.delete_subscription(subscription_id)? {
                return Err(Error::NotFound(format!("unknown subscription: {subscription_id}")));
            }
            bus.unsubscribe(&session.session_id, subscription_id);
            Ok(())
        },
    )?;

    Ok(Json(UnsubscribeResponse {
        subscription_id: subscription_id.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionListResponse {
    pub subscriptions: Vec<Subscription>,
}

#[get("/rpc/subscriptions/list")]
pub fn list(session: SessionContext, store: &State<Arc<Store>>) -> Result<Json<SubscriptionListResponse>, Error> {
    Ok(Json(SubscriptionListResponse {
        subscriptions: store.list_subscriptions(&session.session_id)?,
    }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WaitResponse {
    Notification {
        #[serde(rename = "type")]
        type_: String,
        event: crate::models::Event,
    },
    Timeout,
}

/// Classifies an event into the notification `type` surfaced to `wait`
/// callers: `message.*` events are delivered as `notification.message`,
/// everything else as `notification.<family>` using the event's own
/// dotted-family prefix, since subscribers care which entity changed more
/// than the precise verb.
fn notification_type(event_type: &str) -> String {
    let family = event_type.split('.').next().unwrap_or(event_type);
    format!("notification.{family}")
}

/// Single-shot long-poll: blocks up to `timeout_ms` for one notification
/// matching the session's subscriptions, returning immediately if one is
/// already queued. Returns `Timeout` rather than an error when nothing
/// arrives in time — a timeout is an expected outcome, not a failure.
#[get("/rpc/wait?<timeout_ms>")]
pub async fn wait(
    timeout_ms: Option<u64>,
    session: SessionContext,
    bus: &State<Arc<NotificationBus>>,
    shutdown: &State<Arc<AtomicBool>>,
) -> Json<WaitResponse> {
    let cancel = CancellationGuard::new();
    let shutdown_flag = shutdown.inner().clone();
    let cancelled = cancel.cancelled.clone();
    let watcher = tokio::spawn(async move {
        while !shutdown_flag.load(std::sync::atomic::Ordering::SeqCst) {
            if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let timeout = Duration::from_millis(timeout_ms.unwrap_or_else(default_timeout_ms));
    let result = bus.wait(&session.session_id, timeout, &cancel.cancelled).await;
    cancel.cancel();
    watcher.abort();

    match result {
        Some(notification) => Json(WaitResponse::Notification {
            type_: notification_type(&notification.event.type_),
            event: notification.event,
        }),
        None => Json(WaitResponse::Timeout),
    }
}
