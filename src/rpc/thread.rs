//! `thread.list` / `thread.get` / `thread.create` (§4.6). Threads are
//! normally minted implicitly on first reply (`dispatch::resolve_thread_id`);
//! this module's `create` covers the explicit case (an agent wants to start
//! a thread with a title before anyone has replied to anything).

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::Deserialize;

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::ids;
use crate::models::Thread;
use crate::rpc::SessionContext;
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

#[derive(Debug, Deserialize)]
pub struct CreateThreadRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[post("/rpc/thread/create", data = "<body>")]
pub fn create(
    body: Json<CreateThreadRequest>,
    session: SessionContext,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<Thread>, Error> {
    let thread = Thread {
        thread_id: ids::new_thread_id(),
        title: body.title.clone(),
        created_at: ids::now_rfc3339(),
        created_by: session.agent_id.clone(),
        message_count: 0,
        last_message_at: None,
        unread_count: None,
    };

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "thread.create".to_string(),
            origin_daemon: None,
            timestamp: Some(thread.created_at.clone()),
            v: None,
            body: serde_json::to_value(&thread).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: None,
        },
        |_event| store.insert_thread(&thread),
    )?;

    Ok(Json(thread))
}

/// `unread_count` is filled in per the calling session's agent, since a
/// thread's unread state is inherently viewer-relative.
#[get("/rpc/thread/list")]
pub fn list(session: SessionContext, store: &State<Arc<Store>>) -> Result<Json<Vec<Thread>>, Error> {
    let mut threads = store.list_threads()?;
    for thread in &mut threads {
        thread.unread_count = Some(store.unread_count_for_viewer_in_thread(&session.agent_id, &thread.thread_id)?);
    }
    Ok(Json(threads))
}

#[get("/rpc/thread/get?<thread_id>")]
pub fn get(thread_id: &str, session: SessionContext, store: &State<Arc<Store>>) -> Result<Json<Thread>, Error> {
    let mut thread = store
        .get_thread(thread_id)?
        .ok_or_else(|| Error::NotFound(format!("unknown thread: {thread_id}")))?;
    thread.unread_count = Some(store.unread_count_for_viewer_in_thread(&session.agent_id, &thread.thread_id)?);
    Ok(Json(thread))
}
