//! `session.start` / `session.end` / `session.list`.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::ids;
use crate::models::Session;
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

/// Opens a session for an agent/user; returns `session_id`. Emits
/// `session.start` through the write funnel before the projection row
/// lands, same division as `agent.register`.
#[post("/rpc/session/start", data = "<body>")]
pub fn start(
    body: Json<StartSessionRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<StartSessionResponse>, Error> {
    let agent_id = body.agent_id.trim();
    if agent_id.is_empty() {
        return Err(Error::InvalidArgument("agent_id is required".to_string()));
    }
    if store.get_agent(agent_id)?.is_none() {
        return Err(Error::NotFound(format!("unknown agent: {agent_id}")));
    }

    let session = Session {
        session_id: ids::new_session_id(),
        agent_id: agent_id.to_string(),
        started_at: ids::now_rfc3339(),
        ended_at: None,
        active: true,
    };

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "session.start".to_string(),
            origin_daemon: None,
            timestamp: Some(session.started_at.clone()),
            v: None,
            body: serde_json::to_value(&session).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: None,
        },
        |_event| store.insert_session(&session),
    )?;

    Ok(Json(StartSessionResponse {
        session_id: session.session_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub ended: bool,
}

/// Closes a session; cascades subscription teardown.
#[post("/rpc/session/end?<session_id>")]
pub fn end(
    session_id: &str,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<EndSessionResponse>, Error> {
    if store.get_session(session_id)?.is_none() {
        return Err(Error::NotFound(format!("unknown session: {session_id}")));
    }
    let now = ids::now_rfc3339();
    let mut ended = false;
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "session.end".to_string(),
            origin_daemon: None,
            timestamp: Some(now.clone()),
            v: None,
            body: serde_json::json!({"session_id": session_id}),
            author_agent_id: None,
        },
        |_event| {
            ended = store.end_session(session_id, &now)?;
            if ended {
                // Ending a session atomically deletes all of its subscriptions.
                store.delete_subscriptions_for_session(session_id)?;
                bus.end_session(session_id);
            }
            Ok(())
        },
    )?;
    Ok(Json(EndSessionResponse { ended }))
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

/// Enumerates sessions, optionally filtered by agent or active flag.
#[get("/rpc/session/list?<agent_id>&<active_only>")]
pub fn list(
    agent_id: Option<&str>,
    active_only: Option<bool>,
    store: &State<Arc<Store>>,
) -> Result<Json<SessionListResponse>, Error> {
    let sessions = store.list_sessions(agent_id, active_only.unwrap_or(false))?;
    Ok(Json(SessionListResponse { sessions }))
}
