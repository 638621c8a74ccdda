//! `agent.register` / `agent.list` / `agent.delete` / `agent.listContext`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::ids;
use crate::models::{Agent, AgentKind, Daemon};
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

/// `context/<name>.md` + `context/<name>_preamble.md`, keyed the same way
/// `ids::agent_id_to_name` keys message shards (§6 "this mapping is
/// consumed by the log-shard router and by migrations; both paths must
/// agree exactly" — the context artifacts are a third consumer).
fn context_paths(context_dir: &Path, agent_id: &str) -> (PathBuf, PathBuf) {
    let name = ids::agent_id_to_name(agent_id);
    (context_dir.join(format!("{name}.md")), context_dir.join(format!("{name}_preamble.md")))
}

/// Creates an empty context stub for a newly registered agent, without
/// touching one that already exists -- `agent.register` is idempotent and
/// must not clobber branch/task/intent an agent has already set by editing
/// its file directly in the shared sync directory.
fn ensure_context_stub(context_dir: &Path, agent_id: &str) -> Result<(), Error> {
    let (context_path, preamble_path) = context_paths(context_dir, agent_id);
    std::fs::create_dir_all(context_dir)?;
    if !context_path.exists() {
        std::fs::write(&context_path, "---\nbranch:\ntask:\nintent:\n---\n")?;
    }
    if !preamble_path.exists() {
        std::fs::write(&preamble_path, "")?;
    }
    Ok(())
}

/// Parses the `---\nkey: value\n---` frontmatter block `context/<name>.md`
/// carries (the same convention the teacher uses to serve `SKILL.md`,
/// here parsed rather than served verbatim). Unknown keys and a missing or
/// malformed block are silently ignored -- an agent hand-editing this file
/// gets best-effort parsing, not a hard failure on `listContext`.
fn parse_context_frontmatter(content: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut branch = None;
    let mut task = None;
    let mut intent = None;
    let mut lines = content.lines();
    if lines.next() == Some("---") {
        for line in lines {
            if line.trim() == "---" {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim();
                let value = if value.is_empty() { None } else { Some(value.to_string()) };
                match key.trim() {
                    "branch" => branch = value,
                    "task" => task = value,
                    "intent" => intent = value,
                    _ => {}
                }
            }
        }
    }
    (branch, task, intent)
}

fn read_to_string_opt(path: &Path) -> Result<Option<String>, Error> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub role: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
    /// If set, refreshes the existing agent instead of minting a new id —
    /// `agent.register` is idempotent per §6.
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Create/refresh an agent; idempotent. Goes through the write funnel first
/// (an `agent.register` event) and only then updates the `agents`
/// projection — no caller is allowed to poke the projection directly (§9).
#[post("/rpc/agent/register", data = "<body>")]
pub fn register(
    body: Json<RegisterAgentRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
    daemon: &State<Daemon>,
) -> Result<Json<Agent>, Error> {
    if body.role.trim().is_empty() {
        return Err(Error::InvalidArgument("role is required".to_string()));
    }

    let now = ids::now_rfc3339();
    let agent_id = match &body.agent_id {
        Some(id) => id.clone(),
        None => ids::new_agent_id(&body.role),
    };

    let agent = Agent {
        agent_id,
        kind: AgentKind::Agent,
        role: body.role.clone(),
        module: body.module.clone(),
        display: body.display.clone(),
        registered_at: now.clone(),
        last_seen_at: Some(now),
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

    let context_dir = Path::new(&daemon.sync_dir).join("context");
    ensure_context_stub(&context_dir, &agent.agent_id)?;

    Ok(Json(agent))
}

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<Agent>,
}

/// Enumerates agents, filterable by role/module.
#[get("/rpc/agent/list?<role>&<module>")]
pub fn list(role: Option<&str>, module: Option<&str>, store: &State<Arc<Store>>) -> Result<Json<AgentListResponse>, Error> {
    let agents = store.list_agents(role, module)?;
    Ok(Json(AgentListResponse { agents }))
}

#[derive(Debug, Serialize)]
pub struct DeleteAgentResponse {
    pub agent_id: String,
}

/// Tombstones an agent; prior events remain.
#[post("/rpc/agent/delete?<agent_id>")]
pub fn delete(
    agent_id: &str,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<DeleteAgentResponse>, Error> {
    if store.get_agent(agent_id)?.is_none() {
        return Err(Error::NotFound(format!("unknown agent: {agent_id}")));
    }
    let now = ids::now_rfc3339();
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "agent.delete".to_string(),
            origin_daemon: None,
            timestamp: Some(now.clone()),
            v: None,
            body: serde_json::json!({"agent_id": agent_id}),
            author_agent_id: None,
        },
        |_event| store.delete_agent(agent_id, &now),
    )?;
    Ok(Json(DeleteAgentResponse {
        agent_id: agent_id.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct AgentContext {
    pub agent_id: String,
    pub branch: Option<String>,
    pub task: Option<String>,
    pub intent: Option<String>,
    pub preamble: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentContextResponse {
    pub contexts: Vec<AgentContext>,
}

/// Returns per-agent operational context (branch, task, intent), read
/// straight off `context/<name>.md` in the sync directory -- `agent.register`
/// seeds the stub, agents (or tooling acting on their behalf) update it by
/// editing the file in place in the shared sync tree, and this RPC is the
/// read side. An agent with no context file yet (register hasn't run, or
/// the file was removed) gets an all-`None` entry rather than an error.
#[get("/rpc/agent/listContext?<role>")]
pub fn list_context(role: Option<&str>, store: &State<Arc<Store>>, daemon: &State<Daemon>) -> Result<Json<AgentContextResponse>, Error> {
    let agents = store.list_agents(role, None)?;
    let context_dir = Path::new(&daemon.sync_dir).join("context");
    let mut contexts = Vec::with_capacity(agents.len());
    for agent in agents {
        let (context_path, preamble_path) = context_paths(&context_dir, &agent.agent_id);
        let (branch, task, intent) = match read_to_string_opt(&context_path)? {
            Some(content) => parse_context_frontmatter(&content),
            None => (None, None, None),
        };
        let preamble = read_to_string_opt(&preamble_path)?.filter(|p| !p.trim().is_empty());
        contexts.push(AgentContext {
            agent_id: agent.agent_id,
            branch,
            task,
            intent,
            preamble,
        });
    }
    Ok(Json(AgentContextResponse { contexts }))
}
