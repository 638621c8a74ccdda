use rocket::http::{ContentType, Status};
use rocket::local::blocking::Client;

/// Wrapper around `Client` that auto-deletes its temp sync directory on
/// drop. Prevents `/tmp/thrum_test_*` accumulation across a full test run.
pub struct TestClient {
    client: Option<Client>,
    sync_dir: std::path::PathBuf,
    keep_dir: bool,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        if !self.keep_dir {
            let _ = std::fs::remove_dir_all(&self.sync_dir);
        }
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl TestClient {
    pub fn sync_dir(&self) -> &std::path::Path {
        &self.sync_dir
    }

    /// Drops the Rocket instance (closing the log writer and releasing the
    /// sqlite handle) but leaves the sync directory on disk, so a test can
    /// simulate a daemon restart against the same on-disk state by calling
    /// `test_client_at` with the returned path.
    pub fn shutdown_keep_dir(mut self) -> std::path::PathBuf {
        self.keep_dir = true;
        drop(self.client.take());
        self.sync_dir.clone()
    }
}

/// Builds a daemon rooted at a fresh, unique temp directory so parallel
/// tests never contend on the same sync dir or projection db.
pub fn test_client() -> TestClient {
    let sync_dir = std::env::temp_dir().join(format!("thrum_test_{}", uuid::Uuid::new_v4()));
    test_client_at(sync_dir)
}

/// Builds a daemon rooted at a caller-chosen directory. Used directly by
/// tests that reopen an existing sync dir to simulate a restart.
pub fn test_client_at(sync_dir: std::path::PathBuf) -> TestClient {
    let rocket = thrum_core::rocket_with_sync_dir(sync_dir.clone());
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        sync_dir,
        keep_dir: false,
    }
}

/// Registers an agent with the given role and returns its `agent_id`.
pub fn register_agent(client: &Client, role: &str) -> String {
    let res = client
        .post("/rpc/agent/register")
        .header(ContentType::JSON)
        .body(format!(r#"{{"role": "{role}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["agent_id"].as_str().unwrap().to_string()
}

/// Starts a session for `agent_id` and returns its `session_id`.
pub fn start_session(client: &Client, agent_id: &str) -> String {
    let res = client
        .post("/rpc/session/start")
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id": "{agent_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

/// Sends a message and returns the full decoded JSON response.
pub fn send_message(client: &Client, agent_id: &str, session_id: &str, content: &str, scopes: &str) -> serde_json::Value {
    let res = client
        .post("/rpc/message/send")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"agent_id": "{agent_id}", "session_id": "{session_id}", "content": "{content}", "scopes": {scopes}}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    res.into_json().unwrap()
}
