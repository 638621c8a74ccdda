//! `message.send` / `edit` / `delete` / `list` / `get` / `markRead` /
//! `archive` / `deleteByAgent`. `message.send` is the only entry point that
//! invokes the dispatch engine.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::NotificationBus;
use crate::dispatch;
use crate::error::Error;
use crate::ids;
use crate::models::{Message, Scope};
use crate::store::{MessageFilter, Store};
use crate::writer::{EventWriter, RawEvent};

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub agent_id: String,
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub structured: Option<Value>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub refs: Vec<Scope>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub disclosed: bool,
    #[serde(default)]
    pub authored_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub recipient_count: usize,
    pub warnings: Vec<String>,
}

/// Primary write. Enforces validation, dispatches, returns `message_id`,
/// optional `thread_id`, resolved recipient count, warnings.
#[post("/rpc/message/send", data = "<body>")]
#[allow(clippy::too_many_arguments)]
pub fn send(
    body: Json<SendMessageRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<SendMessageResponse>, Error> {
    if body.content.trim().is_empty() {
        return Err(Error::InvalidArgument("content must not be empty".to_string()));
    }
    if store.get_agent(&body.agent_id)?.is_none() {
        return Err(Error::InvalidArgument(format!("unknown agent: {}", body.agent_id)));
    }

    let now = ids::now_rfc3339();
    let message_id = ids::new_message_id();
    let thread_id = dispatch::resolve_thread_id(store, body.reply_to.as_deref(), &body.agent_id, &now)?;

    let message = Message {
        message_id: message_id.clone(),
        thread_id: thread_id.clone(),
        agent_id: body.agent_id.clone(),
        session_id: body.session_id.clone(),
        created_at: now.clone(),
        updated_at: now.clone(),
        deleted_at: None,
        format: body.format.clone().unwrap_or_else(|| "text".to_string()),
        content: body.content.clone(),
        structured: body.structured.clone(),
        scopes: body.scopes.clone(),
        refs: body.refs.clone(),
        mentions: body.mentions.clone(),
        reply_to: body.reply_to.clone(),
        disclosed: body.disclosed,
        authored_by: body.authored_by.clone(),
    };

    let dispatch_result = dispatch::resolve_recipients(store, &message)?;

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "message.create".to_string(),
            origin_daemon: None,
            timestamp: Some(now.clone()),
            v: None,
            body: serde_json::to_value(&message).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: Some(message.agent_id.clone()),
        },
        |event| {
            store.insert_message(&message, event.sequence)?;
            if let Some(thread_id) = &thread_id {
                store.touch_thread(thread_id, &now)?;
            }
            dispatch::create_read_marker_stubs(store, &message_id, &dispatch_result.recipients)
        },
    )?;

    let mut warnings = Vec::new();
    if dispatch_result.warnings.empty_recipients {
        warnings.push("message has no recipients".to_string());
    }
    for m in &dispatch_result.warnings.unresolved_mentions {
        warnings.push(format!("unresolved mention: {m}"));
    }
    for s in &dispatch_result.warnings.scopes_with_no_subscribers {
        warnings.push(format!("scope matched no subscribers: {s}"));
    }

    Ok(Json(SendMessageResponse {
        message_id,
        thread_id,
        recipient_count: dispatch_result.recipients.len(),
        warnings,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub structured: Option<Value>,
}

/// Appends a `message.edit` event; projection updates in place. Edits route
/// to the author's shard.
#[post("/rpc/message/edit", data = "<body>")]
pub fn edit(
    body: Json<EditMessageRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<Message>, Error> {
    let existing = store
        .get_message(&body.message_id)?
        .ok_or_else(|| Error::NotFound(format!("unknown message: {}", body.message_id)))?;
    if existing.deleted_at.is_some() {
        return Err(Error::NotFound(format!("message already deleted: {}", body.message_id)));
    }

    let now = ids::now_rfc3339();
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "message.edit".to_string(),
            origin_daemon: None,
            timestamp: Some(now.clone()),
            v: None,
            body: serde_json::json!({
                "message_id": body.message_id,
                "content": body.content,
                "structured": body.structured,
            }),
            author_agent_id: Some(existing.agent_id.clone()),
        },
        |_event| store.edit_message(&body.message_id, &body.content, body.structured.as_ref(), &now).map(|_| ()),
    )?;

    store
        .get_message(&body.message_id)?
        .map(Json)
        .ok_or_else(|| Error::Internal("message disappeared after edit".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageRequest {
    pub message_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteMessageResponse {
    pub message_id: String,
    pub deleted: bool,
}

/// Appends a `message.delete` event. The row is preserved; reads blank the
/// body once `deleted_at` is set.
#[post("/rpc/message/delete", data = "<body>")]
pub fn delete(
    body: Json<DeleteMessageRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<DeleteMessageResponse>, Error> {
    let existing = store
        .get_message(&body.message_id)?
        .ok_or_else(|| Error::NotFound(format!("unknown message: {}", body.message_id)))?;

    let now = ids::now_rfc3339();
    let mut deleted = false;
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "message.delete".to_string(),
            origin_daemon: None,
            timestamp: Some(now.clone()),
            v: None,
            body: serde_json::json!({"message_id": body.message_id}),
            author_agent_id: Some(existing.agent_id.clone()),
        },
        |_event| {
            deleted = store.soft_delete_message(&body.message_id, &now)?;
            Ok(())
        },
    )?;
    Ok(Json(DeleteMessageResponse {
        message_id: body.message_id.clone(),
        deleted,
    }))
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<Message>,
}

/// Splits a `type:value` query param (e.g. `project:x`) into its two parts.
fn split_scope_param(raw: &str) -> Option<(String, String)> {
    let (t, v) = raw.split_once(':')?;
    Some((t.to_string(), v.to_string()))
}

/// Paged list with filters: `thread_id`, `author_id`, `for_agent`,
/// `unread_for_agent`, `scope`, `ref_` (`ref` is reserved in Rust, so the
/// query key is `ref_`), `mention`, `page_size`, `page`, `sort_order`. Both
/// `scope` and `ref_` take a single `type:value` pair.
#[get(
    "/rpc/message/list?<thread_id>&<author_id>&<for_agent>&<unread_for_agent>&<scope>&<ref_>&<mention>&<page_size>&<page>&<sort_order>"
)]
#[allow(clippy::too_many_arguments)]
pub fn list(
    thread_id: Option<&str>,
    author_id: Option<&str>,
    for_agent: Option<&str>,
    unread_for_agent: Option<&str>,
    scope: Option<&str>,
    ref_: Option<&str>,
    mention: Option<&str>,
    page_size: Option<u32>,
    page: Option<u32>,
    sort_order: Option<&str>,
    store: &State<Arc<Store>>,
) -> Result<Json<MessageListResponse>, Error> {
    let mut filter = MessageFilter::new();
    filter.thread_id = thread_id.map(str::to_string);
    filter.author_id = author_id.map(str::to_string);
    filter.mention = mention.map(str::to_string);
    filter.scope = scope.and_then(split_scope_param);
    filter.ref_ = ref_.and_then(split_scope_param);
    filter.page_size = page_size.unwrap_or(50).clamp(1, 500);
    filter.page = page.unwrap_or(1).max(1);
    filter.sort_order_desc = sort_order.map(|s| s.eq_ignore_ascii_case("desc")).unwrap_or(false);

    let mut messages = store.list_messages(&filter)?;

    // `for_agent` restricts to messages the viewer was an actual dispatch
    // recipient of, read or not; `unread_for_agent` narrows further to the
    // still-pending ones. Both rely on `read_markers` rows rather than
    // "no marker row", which would also match messages never addressed to
    // the viewer at all.
    if let Some(viewer) = for_agent {
        let recipient: std::collections::HashSet<String> =
            store.recipient_message_ids_for_viewer(viewer)?.into_iter().collect();
        messages.retain(|m| recipient.contains(&m.message_id));
    }
    if let Some(viewer) = unread_for_agent {
        let pending: std::collections::HashSet<String> =
            store.pending_message_ids_for_viewer(viewer)?.into_iter().collect();
        messages.retain(|m| pending.contains(&m.message_id));
    }

    Ok(Json(MessageListResponse { messages }))
}

#[get("/rpc/message/get?<message_id>")]
pub fn get(message_id: &str, store: &State<Arc<Store>>) -> Result<Json<Message>, Error> {
    store
        .get_message(message_id)?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("unknown message: {message_id}")))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub viewer_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub marked: usize,
}

/// Mutating but idempotent: re-marking a read message is a no-op. One
/// `read.mark` event per message, through the write funnel, same as every
/// other mutation.
#[post("/rpc/message/markRead", data = "<body>")]
pub fn mark_read(
    body: Json<MarkReadRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<MarkReadResponse>, Error> {
    let now = ids::now_rfc3339();
    let mut marked = 0;
    for message_id in &body.message_ids {
        writer.write_event(
            store,
            bus,
            RawEvent {
                event_id: None,
                type_: "read.mark".to_string(),
                origin_daemon: None,
                timestamp: Some(now.clone()),
                v: None,
                body: serde_json::json!({
                    "viewer_id": body.viewer_id,
                    "message_id": message_id,
                }),
                author_agent_id: None,
            },
            |_event| store.mark_read(&body.viewer_id, message_id, &now),
        )?;
        marked += 1;
    }
    Ok(Json(MarkReadResponse { marked }))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkResult {
    pub affected: usize,
}

/// Bulk management: archiving is a soft-delete-style hide, distinct from a
/// single `message.delete` only in how the caller framed the request —
/// archived messages keep their content, they are only excluded from
/// default listing, the same `deleted_at` flag `message.delete` already
/// sets; there is no separate archived-state column. Every affected message
/// still goes through the write funnel: one `message.delete` event per
/// message, same as the single-message path,
/// per §9's "no caller pokes the projection directly".
#[post("/rpc/message/archive", data = "<body>")]
pub fn archive(
    body: Json<ArchiveRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<BulkResult>, Error> {
    let mut affected = 0;
    for message_id in &body.message_ids {
        let Some(existing) = store.get_message(message_id)? else {
            continue;
        };
        if existing.deleted_at.is_some() {
            continue;
        }
        let now = ids::now_rfc3339();
        let mut did_delete = false;
        writer.write_event(
            store,
            bus,
            RawEvent {
                event_id: None,
                type_: "message.delete".to_string(),
                origin_daemon: None,
                timestamp: Some(now.clone()),
                v: None,
                body: serde_json::json!({"message_id": message_id}),
                author_agent_id: Some(existing.agent_id.clone()),
            },
            |_event| {
                did_delete = store.soft_delete_message(message_id, &now)?;
                Ok(())
            },
        )?;
        if did_delete {
            affected += 1;
        }
    }
    Ok(Json(BulkResult { affected }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteByAgentRequest {
    pub agent_id: String,
}

/// Bulk management: soft-deletes every undeleted message authored by
/// `agent_id`, one `message.delete` event per message through the write
/// funnel.
#[post("/rpc/message/deleteByAgent", data = "<body>")]
pub fn delete_by_agent(
    body: Json<DeleteByAgentRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<BulkResult>, Error> {
    let mut filter = MessageFilter::new();
    filter.author_id = Some(body.agent_id.clone());
    filter.page_size = 10_000;
    let messages = store.list_messages(&filter)?;

    let mut affected = 0;
    for message in messages {
        if message.deleted_at.is_some() {
            continue;
        }
        let now = ids::now_rfc3339();
        let mut did_delete = false;
        writer.write_event(
            store,
            bus,
            RawEvent {
                event_id: None,
                type_: "message.delete".to_string(),
                origin_daemon: None,
                timestamp: Some(now.clone()),
                v: None,
                body: serde_json::json!({"message_id": message.message_id}),
                author_agent_id: Some(message.agent_id.clone()),
            },
            |_event| {
                did_delete = store.soft_delete_message(&message.message_id, &now)?;
                Ok(())
            },
        )?;
        if did_delete {
            affected += 1;
        }
    }
    Ok(Json(BulkResult { affected }))
}
