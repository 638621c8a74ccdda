//! Type-specific projection: turns an already-appended, already-row-inserted
//! event into domain-table writes.
//!
//! The local write path applies this inline in each `rpc/*` handler right
//! after `writer::write_event` returns (compute, insert, respond). Sync
//! ingest has no per-event-type caller of its own, so `sync::ingest_batch`
//! calls this module directly to keep a replayed event exactly as queryable
//! as a locally-written one of the same type.

use crate::dispatch;
use crate::error::Error;
use crate::models::{Agent, Event, Group, GroupMember, Message, Session, Subscription, Thread};
use crate::store::Store;

/// Applies `event` to the projection tables its type owns. Unknown event
/// types (including `daemon.start`, which has no domain table of its own)
/// are a no-op — the raw `events` row is the only durable record they need.
pub fn apply(store: &Store, event: &Event) -> Result<(), Error> {
    match event.type_.as_str() {
        "agent.register" => apply_agent_register(store, event),
        "agent.delete" => apply_agent_delete(store, event),
        "session.start" => apply_session_start(store, event),
        "session.end" => apply_session_end(store, event),
        "message.create" => apply_message_create(store, event),
        "message.edit" => apply_message_edit(store, event),
        "message.delete" => apply_message_delete(store, event),
        "thread.create" => apply_thread_create(store, event),
        "group.create" => apply_group_create(store, event),
        "group.delete" => apply_group_delete(store, event),
        "group.member.add" => apply_group_member_add(store, event),
        "group.member.remove" => apply_group_member_remove(store, event),
        "subscription.create" => apply_subscription_create(store, event),
        "subscription.delete" => apply_subscription_delete(store, event),
        "read.mark" => apply_read_mark(store, event),
        _ => Ok(()),
    }
}

fn body_str(event: &Event, field: &str) -> Result<String, Error> {
    event
        .body
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Internal(format!("event {} missing body.{field}", event.event_id)))
}

fn apply_agent_register(store: &Store, event: &Event) -> Result<(), Error> {
    let agent: Agent = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed agent.register body: {e}")))?;
    store.upsert_agent(&agent)
}

fn apply_agent_delete(store: &Store, event: &Event) -> Result<(), Error> {
    let agent_id = body_str(event, "agent_id")?;
    store.delete_agent(&agent_id, &event.timestamp)
}

fn apply_session_start(store: &Store, event: &Event) -> Result<(), Error> {
    let session: Session = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed session.start body: {e}")))?;
    store.insert_session(&session)
}

fn apply_session_end(store: &Store, event: &Event) -> Result<(), Error> {
    let session_id = body_str(event, "session_id")?;
    if store.end_session(&session_id, &event.timestamp)? {
        store.delete_subscriptions_for_session(&session_id)?;
    }
    Ok(())
}

/// Re-runs dispatch locally before stubbing read-markers: a message
/// ingested from a peer still needs every *local* recipient to get a
/// pending read-marker, and this daemon's agent/group state at ingest time
/// is the only snapshot available to it (§4.4's "snapshot, not continuous"
/// rule applies per-daemon, not globally across the whole sync mesh).
fn apply_message_create(store: &Store, event: &Event) -> Result<(), Error> {
    let message: Message = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed message.create body: {e}")))?;
    store.insert_message(&message, event.sequence)?;
    if let Some(thread_id) = &message.thread_id {
        store.touch_thread(thread_id, &event.timestamp)?;
    }
    let dispatch_result = dispatch::resolve_recipients(store, &message)?;
    dispatch::create_read_marker_stubs(store, &message.message_id, &dispatch_result.recipients)
}

fn apply_message_edit(store: &Store, event: &Event) -> Result<(), Error> {
    let message_id = body_str(event, "message_id")?;
    let content = body_str(event, "content")?;
    let structured = event.body.get("structured").cloned().filter(|v| !v.is_null());
    store
        .edit_message(&message_id, &content, structured.as_ref(), &event.timestamp)
        .map(|_| ())
}

fn apply_message_delete(store: &Store, event: &Event) -> Result<(), Error> {
    let message_id = body_str(event, "message_id")?;
    store.soft_delete_message(&message_id, &event.timestamp).map(|_| ())
}

fn apply_thread_create(store: &Store, event: &Event) -> Result<(), Error> {
    let thread: Thread = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed thread.create body: {e}")))?;
    if store.thread_exists(&thread.thread_id)? {
        return Ok(());
    }
    store.insert_thread(&thread)
}

fn apply_group_create(store: &Store, event: &Event) -> Result<(), Error> {
    let group: Group = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed group.create body: {e}")))?;
    if store.get_group_by_name(&group.name)?.is_some() {
        return Ok(());
    }
    store.insert_group(&group)
}

fn apply_group_delete(store: &Store, event: &Event) -> Result<(), Error> {
    let name = body_str(event, "name")?;
    store.delete_group(&name).map(|_| ())
}

fn apply_group_member_add(store: &Store, event: &Event) -> Result<(), Error> {
    let member: GroupMember = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed group.member.add body: {e}")))?;
    store.add_group_member(&member)
}

fn apply_group_member_remove(store: &Store, event: &Event) -> Result<(), Error> {
    let group_name = body_str(event, "group_name")?;
    let member_value = body_str(event, "member_value")?;
    let Some(group) = store.get_group_by_name(&group_name)? else {
        return Ok(());
    };
    store.remove_group_member(&group.group_id, &member_value).map(|_| ())
}

fn apply_subscription_create(store: &Store, event: &Event) -> Result<(), Error> {
    let sub: Subscription = serde_json::from_value(event.body.clone())
        .map_err(|e| Error::Internal(format!("malformed subscription.create body: {e}")))?;
    store.insert_subscription(&sub)
}

fn apply_subscription_delete(store: &Store, event: &Event) -> Result<(), Error> {
    let subscription_id = body_str(event, "subscription_id")?;
    store.delete_subscription(&subscription_id).map(|_| ())
}

fn apply_read_mark(store: &Store, event: &Event) -> Result<(), Error> {
    let viewer_id = body_str(event, "viewer_id")?;
    let message_id = body_str(event, "message_id")?;
    store.mark_read(&viewer_id, &message_id, &event.timestamp)
}
