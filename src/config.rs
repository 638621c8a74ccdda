//! Daemon configuration, read from the environment with typed defaults.
//!
//! Follows the `&&`-chained `if let Ok(...) = env::var(...)` idiom used for
//! rate-limit configuration: every field has a sane default and is
//! overridden only when the env var parses cleanly.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the append-only log, the projection db, and the
    /// local socket. Typically a dedicated git worktree shared with peers.
    pub sync_dir: PathBuf,
    pub bind_port: u16,
    /// Bounded capacity of each session's notification queue.
    pub notification_channel_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub stale_subscription_sweep_secs: u64,
    pub projection_health_probe_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sync_dir: PathBuf::from(".thrum"),
            bind_port: 7777,
            notification_channel_capacity: 256,
            heartbeat_interval_secs: 30,
            stale_subscription_sweep_secs: 60,
            projection_health_probe_secs: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("THRUM_SYNC_DIR") {
            if !dir.trim().is_empty() {
                config.sync_dir = PathBuf::from(dir);
            }
        }
        if let Ok(v) = std::env::var("THRUM_PORT") {
            if let Ok(port) = v.parse() {
                config.bind_port = port;
            }
        }
        if let Ok(v) = std::env::var("THRUM_NOTIFICATION_CAPACITY") {
            if let Ok(cap) = v.parse() {
                config.notification_channel_capacity = cap;
            }
        }
        if let Ok(v) = std::env::var("THRUM_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                config.heartbeat_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("THRUM_STALE_SUBSCRIPTION_SWEEP_SECS") {
            if let Ok(secs) = v.parse() {
                config.stale_subscription_sweep_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("THRUM_PROJECTION_HEALTH_PROBE_SECS") {
            if let Ok(secs) = v.parse() {
                config.projection_health_probe_secs = secs;
            }
        }

        config
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.sync_dir.join("events.jsonl")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.sync_dir.join("messages")
    }

    pub fn projection_db_path(&self) -> PathBuf {
        self.sync_dir.join("var").join("messages.db")
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.sync_dir.join("identities")
    }

    pub fn context_dir(&self) -> PathBuf {
        self.sync_dir.join("context")
    }
}
