//! `health` — no session required. Reports daemon identity, uptime,
//! sequence/migration state, and projection/bus health.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, State};
use serde::Serialize;

use crate::error::Error;
use crate::ids;
use crate::lifecycle::ProjectionHealth;
use crate::models::Daemon;
use crate::store::Store;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub daemon_id: String,
    pub repo_id: String,
    pub version: &'static str,
    pub started_at: String,
    pub uptime_secs: i64,
    pub max_sequence: u64,
    pub migrating: bool,
    pub projection_healthy: bool,
}

#[get("/rpc/health")]
pub fn health(
    daemon: &State<Daemon>,
    store: &State<Arc<Store>>,
    projection_health: &State<Arc<ProjectionHealth>>,
    shutdown: &State<Arc<AtomicBool>>,
) -> Result<Json<HealthResponse>, Error> {
    let uptime_secs = ids::seconds_since(&daemon.started_at).unwrap_or(0);
    let healthy = projection_health.healthy.load(Ordering::SeqCst);
    let shutting_down = shutdown.load(Ordering::SeqCst);

    let status = if shutting_down {
        "shutting_down"
    } else if !healthy {
        "degraded"
    } else {
        "ok"
    };

    Ok(Json(HealthResponse {
        status,
        daemon_id: daemon.daemon_id.clone(),
        repo_id: daemon.repo_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: daemon.started_at.clone(),
        uptime_secs,
        max_sequence: store.max_sequence()?,
        migrating: store.is_migrating(),
        projection_healthy: healthy,
    }))
}
