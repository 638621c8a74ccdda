//! `user.identify` / `user.register` — no session required.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{post, State};
use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::ids;
use crate::models::{Agent, AgentKind};
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

#[derive(Debug, Serialize)]
pub struct IdentifyResponse {
    pub repo_id: String,
    pub repo_path: String,
}

/// Returns local machine identity derived from repo config. No session
/// needed.
#[post("/rpc/user/identify")]
pub fn identify(daemon: &State<crate::models::Daemon>) -> Json<IdentifyResponse> {
    Json(IdentifyResponse {
        repo_id: daemon.repo_id.clone(),
        repo_path: daemon.repo_path.clone(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub display: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterUserResponse {
    pub agent_id: String,
    pub token: String,
}

/// Idempotent upsert of a user identity; returns a bearer token. No session
/// needed. The token is the `agent_id` itself: identity here is
/// trust-based, not cryptographically verified. Goes through the same
/// `agent.register` write funnel as `agent.register` — a user is an `Agent`
/// with `kind = user`, not a separate event type.
#[post("/rpc/user/register", data = "<body>")]
pub fn register(
    body: Json<RegisterUserRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<RegisterUserResponse>, Error> {
    let agent_id = ids::new_agent_id("user");
    let agent = Agent {
        agent_id: agent_id.clone(),
        kind: AgentKind::User,
        role: "user".to_string(),
        module: None,
        display: body.display.clone(),
        registered_at: ids::now_rfc3339(),
        last_seen_at: None,
        deleted_at: None,
    };

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "agent.register".to_string(),
            origin_daemon: None,
            timestamp: Some(agent.registered_at.clone()),
            v: None,
            body: serde_json::to_value(&agent).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: None,
        },
        |_event| store.upsert_agent(&agent),
    )?;
    Ok(Json(RegisterUserResponse {
        token: agent_id.clone(),
        agent_id,
    }))
}
