//! Composition root (§4.8). Wires the projection store, event writer,
//! notification bus, and daemon identity into Rocket managed state, mounts
//! the `rpc/` surface, and spawns the three background loops: open/create
//! storage, manage state, mount routes, attach `AdHoc::on_liftoff` fairings
//! for the things that only make sense once the server is actually up.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod log;
pub mod migrations;
pub mod models;
pub mod projection;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod writer;

use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{catch, catchers};
use serde::Serialize;

use bus::NotificationBus;
use config::Config;
use error::Error;
use lifecycle::ProjectionHealth;
use store::Store;
use writer::EventWriter;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let config = Config::from_env();
    let repo_id = env::var("THRUM_REPO_ID").unwrap_or_else(|_| "default".to_string());
    let repo_path = env::var("THRUM_REPO_PATH").unwrap_or_else(|_| ".".to_string());
    rocket_with_config(config, &repo_id, &repo_path)
}

/// Builds a daemon rooted at a caller-chosen sync directory, everything
/// else defaulted. Used by the integration test harness so every test gets
/// its own isolated `.thrum`-shaped tree instead of racing on a shared one.
pub fn rocket_with_sync_dir(sync_dir: std::path::PathBuf) -> rocket::Rocket<rocket::Build> {
    let mut config = Config::default();
    config.sync_dir = sync_dir;
    rocket_with_config(config, "test-repo", "/test/repo")
}

/// Builds a fully wired `Rocket<Build>` for a given sync directory and repo
/// identity, without binding or launching it — kept separate from
/// `rocket()` (env-driven) so the test harness can pass explicit args.
pub fn rocket_with_config(config: Config, repo_id: &str, repo_path: &str) -> rocket::Rocket<rocket::Build> {
    let (store, writer, daemon) =
        lifecycle::startup(&config, repo_id, repo_path).expect("daemon startup failed");
    let bus = NotificationBus::new(config.notification_channel_capacity);
    lifecycle::announce_start(&writer, &store, &bus, &daemon).expect("daemon.start announce failed");

    let store = Arc::new(store);
    let writer = Arc::new(writer);
    let bus = Arc::new(bus);
    let projection_health = Arc::new(ProjectionHealth::default());
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    lifecycle::spawn_heartbeat(store.clone(), config.heartbeat_interval_secs, shutdown_flag.clone());
    lifecycle::spawn_stale_subscription_sweep(
        store.clone(),
        bus.clone(),
        config.stale_subscription_sweep_secs,
        shutdown_flag.clone(),
    );
    lifecycle::spawn_projection_health_probe(
        store.clone(),
        projection_health.clone(),
        config.projection_health_probe_secs,
        shutdown_flag.clone(),
    );

    let shutdown_writer: Arc<EventWriter> = writer.clone();
    let shutdown_flag_for_fairing = shutdown_flag.clone();

    rocket::build()
        .manage(store)
        .manage(writer)
        .manage(bus)
        .manage(daemon)
        .manage(projection_health)
        .manage(shutdown_flag)
        .register("/", catchers![not_found, internal_error])
        .mount(
            "/",
            rocket::routes![
                rpc::identity::identify,
                rpc::identity::register,
                rpc::session::start,
                rpc::session::end,
                rpc::session::list,
                rpc::agent::register,
                rpc::agent::list,
                rpc::agent::delete,
                rpc::agent::list_context,
                rpc::group::create,
                rpc::group::delete_group,
                rpc::group::list,
                rpc::group::info,
                rpc::group::add_member,
                rpc::group::remove_member,
                rpc::message::send,
                rpc::message::edit,
                rpc::message::delete,
                rpc::message::list,
                rpc::message::get,
                rpc::message::mark_read,
                rpc::message::archive,
                rpc::message::delete_by_agent,
                rpc::thread::create,
                rpc::thread::list,
                rpc::thread::get,
                rpc::subscription::subscribe,
                rpc::subscription::unsubscribe,
                rpc::subscription::list,
                rpc::subscription::wait,
                rpc::system::health,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_shutdown("thrum shutdown", move |_rocket| {
            Box::pin(async move {
                lifecycle::shutdown(&shutdown_writer, &shutdown_flag_for_fairing);
            })
        }))
}

#[derive(Serialize)]
struct CatcherBody {
    error: String,
    code: &'static str,
}

#[catch(404)]
fn not_found() -> Json<CatcherBody> {
    Json(CatcherBody {
        error: "no such route".to_string(),
        code: "not_found",
    })
}

#[catch(500)]
fn internal_error() -> Json<CatcherBody> {
    Json(CatcherBody {
        error: "internal error".to_string(),
        code: "internal",
    })
}

#[allow(unused_imports)]
use Error as _CrateError;
