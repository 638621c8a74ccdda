//! One test per documented invariant (each test cites its invariant number,
//! not its prose, to avoid drifting out of sync with wording changes
//! elsewhere).

use rocket::http::{ContentType, Status};

use crate::common::{register_agent, send_message, start_session, test_client, test_client_at};

fn read_event_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    content.lines().filter(|l| !l.trim().is_empty()).map(|l| serde_json::from_str(l).unwrap()).collect()
}

/// Invariant 1: sequence values are the contiguous set {1..N}, no dupes.
#[test]
fn sequence_is_contiguous_with_no_duplicates() {
    let client = test_client();
    for i in 0..10 {
        register_agent(&client, &format!("role{i}"));
    }
    let events = read_event_lines(&client.sync_dir().join("events.jsonl"));
    let mut seqs: Vec<u64> = events.iter().map(|e| e["sequence"].as_u64().unwrap()).collect();
    seqs.sort_unstable();
    let unique: std::collections::HashSet<u64> = seqs.iter().copied().collect();
    assert_eq!(unique.len(), seqs.len(), "sequence values must not repeat");
    // daemon.start claims sequence 1, so agent.register events occupy 2..=N.
    let expected: Vec<u64> = (seqs[0]..=seqs[seqs.len() - 1]).collect();
    assert_eq!(seqs, expected);
}

/// Invariant 2: `origin_daemon` is non-empty on every record.
#[test]
fn origin_daemon_is_never_empty() {
    let client = test_client();
    register_agent(&client, "reviewer");
    let events = read_event_lines(&client.sync_dir().join("events.jsonl"));
    assert!(!events.is_empty());
    for event in &events {
        assert!(!event["origin_daemon"].as_str().unwrap().is_empty());
    }
}

/// Invariant 3: re-ingesting a batch that duplicates previously seen
/// `event_id`s is a no-op on the projection.
#[test]
fn reingesting_duplicate_event_ids_is_a_projection_noop() {
    use thrum_core::bus::NotificationBus;
    use thrum_core::log::LogWriter;
    use thrum_core::store::Store;
    use thrum_core::sync::InboundEvent;

    let store = Store::open_in_memory().unwrap();
    let dir = std::env::temp_dir().join(format!("thrum_inv3_{}", uuid::Uuid::new_v4()));
    let log = LogWriter::open(&dir).unwrap();
    let bus = NotificationBus::new(16);

    let inbound = InboundEvent {
        event_id: "evt_fixed123".to_string(),
        type_: "agent.register".to_string(),
        timestamp: thrum_core::ids::now_rfc3339(),
        origin_daemon: "d_remote".to_string(),
        sequence: 1,
        v: 1,
        body: serde_json::json!({
            "agent_id": "agent:reviewer:X",
            "kind": "agent",
            "role": "reviewer",
            "registered_at": thrum_core::ids::now_rfc3339(),
        }),
        author_agent_id: None,
    };

    let report1 = thrum_core::sync::ingest_batch(&store, &log, &bus, vec![inbound.clone()]).unwrap();
    assert_eq!(report1.accepted, 1);
    let count_after_first = store.list_agents(None, None).unwrap().len();

    let report2 = thrum_core::sync::ingest_batch(&store, &log, &bus, vec![inbound]).unwrap();
    assert_eq!(report2.accepted, 0);
    assert_eq!(report2.skipped_duplicate, 1);
    assert_eq!(store.list_agents(None, None).unwrap().len(), count_after_first);

    std::fs::remove_dir_all(&dir).ok();
}

/// Invariant 4: every concrete recipient of a `message.create` gets a
/// `read_markers` row, and marking read is idempotent.
#[test]
fn every_recipient_gets_a_read_marker_and_marking_read_is_idempotent() {
    let client = test_client();
    let author = register_agent(&client, "implementer");
    let reviewer = register_agent(&client, "reviewer");
    let author_session = start_session(&client, &author);

    let msg = send_message(&client, &author, &author_session, "please review", r#"[{"type": "role", "value": "reviewer"}]"#);
    let message_id = msg["message_id"].as_str().unwrap();
    assert_eq!(msg["recipient_count"], 1);

    // Marking read twice must not error and must not duplicate the marker.
    for _ in 0..2 {
        let res = client
            .post("/rpc/message/markRead")
            .header(ContentType::JSON)
            .body(format!(r#"{{"viewer_id": "{reviewer}", "message_ids": ["{message_id}"]}}"#))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let body: serde_json::Value = res.into_json().unwrap();
        assert_eq!(body["marked"], 1);
    }
}

/// Invariant 5: a message's creation, edits, and deletes for the same
/// `message_id` all route to the same author shard file, even across a
/// restart.
#[test]
fn message_family_events_stay_in_the_same_author_shard_across_restart() {
    let client = test_client();
    let author = register_agent(&client, "test");
    let session = start_session(&client, &author);
    let msg = send_message(&client, &author, &session, "original", "[]");
    let message_id = msg["message_id"].as_str().unwrap().to_string();

    let shard_name = thrum_core::ids::agent_id_to_name(&author);
    let shard_path = client.sync_dir().join("messages").join(format!("{shard_name}.jsonl"));

    let dir = client.shutdown_keep_dir();
    let client = test_client_at(dir);

    let res = client
        .post("/rpc/message/edit")
        .header(ContentType::JSON)
        .body(format!(r#"{{"message_id": "{message_id}", "content": "edited"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/rpc/message/delete")
        .header(ContentType::JSON)
        .body(format!(r#"{{"message_id": "{message_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let lines = read_event_lines(&shard_path);
    let types: Vec<&str> = lines.iter().map(|l| l["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["message.create", "message.edit", "message.delete"]);
    for line in &lines {
        assert_eq!(line["body"]["message_id"].as_str().unwrap_or_else(|| line["body"]["message_id"].as_str().unwrap()), message_id);
    }
}

/// Invariant 6: notifications to a single session arrive in sequence
/// order for events originating on this daemon.
#[test]
fn notifications_to_one_session_preserve_sequence_order() {
    let client = test_client();
    let author = register_agent(&client, "implementer");
    let watcher = register_agent(&client, "reviewer");
    let author_session = start_session(&client, &author);
    let watcher_session = start_session(&client, &watcher);

    let res = client
        .post("/rpc/subscribe")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("X-Session-Id", watcher_session.clone()))
        .body(r#"{"filter_type": "scope", "scope_type": "role", "scope_value": "reviewer"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    for i in 0..5 {
        send_message(&client, &author, &author_session, &format!("msg {i}"), r#"[{"type": "role", "value": "reviewer"}]"#);
    }

    let mut seen_sequences = Vec::new();
    loop {
        let res = client
            .get("/rpc/wait?timeout_ms=50")
            .header(rocket::http::Header::new("X-Session-Id", watcher_session.clone()))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let body: serde_json::Value = res.into_json().unwrap();
        if body["status"] == "timeout" {
            break;
        }
        seen_sequences.push(body["event"]["sequence"].as_u64().unwrap());
    }

    assert_eq!(seen_sequences.len(), 5);
    let mut sorted = seen_sequences.clone();
    sorted.sort_unstable();
    assert_eq!(seen_sequences, sorted, "notifications must arrive in sequence order");
}

/// Invariant 7: ending a session atomically deletes all of its
/// subscriptions.
#[test]
fn ending_a_session_deletes_its_subscriptions() {
    let client = test_client();
    let agent = register_agent(&client, "reviewer");
    let session = start_session(&client, &agent);

    let res = client
        .post("/rpc/subscribe")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("X-Session-Id", session.clone()))
        .body(r#"{"filter_type": "all"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.post(format!("/rpc/session/end?session_id={session}")).dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get("/rpc/subscriptions/list")
        .header(rocket::http::Header::new("X-Session-Id", session.clone()))
        .dispatch();
    // The session has ended; SessionContext resolution now fails since the
    // session row is no longer active.
    assert_eq!(res.status(), Status::Unauthorized);
}

/// Invariant 8: the preseeded `everyone` group exists at startup and
/// cannot be deleted.
#[test]
fn everyone_group_is_preseeded_and_undeletable() {
    let client = test_client();
    let res = client.get("/rpc/group/info?name=everyone").dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.delete("/rpc/group/delete?name=everyone").dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

/// `message.list`'s `scope` and `ref_` filters (§6) match on the
/// `{type,value}` pair, not a substring of either half alone, and
/// `for_agent` narrows to actual dispatch recipients regardless of read
/// state.
#[test]
fn message_list_filters_by_scope_ref_and_recipient() {
    let client = test_client();
    let author = register_agent(&client, "caller");
    let author_session = start_session(&client, &author);
    let viewer = register_agent(&client, "reviewer");

    let scoped = send_message(
        &client,
        &author,
        &author_session,
        "touches project x",
        &format!(r#"[{{"type": "to", "value": "{viewer}"}}, {{"type": "project", "value": "x"}}]"#),
    );
    let other = send_message(
        &client,
        &author,
        &author_session,
        "touches project y",
        r#"[{"type": "project", "value": "y"}]"#,
    );
    let scoped_id = scoped["message_id"].as_str().unwrap();
    let other_id = other["message_id"].as_str().unwrap();

    let res = client.get("/rpc/message/list?scope=project:x").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let ids: Vec<&str> = body["messages"].as_array().unwrap().iter().map(|m| m["message_id"].as_str().unwrap()).collect();
    assert!(ids.contains(&scoped_id));
    assert!(!ids.contains(&other_id));

    // A type/value pair that never co-occurs in one scope entry must not
    // match even though each half appears somewhere in the stored row.
    let res = client.get("/rpc/message/list?scope=project:z").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["messages"].as_array().unwrap().is_empty());

    let res = client
        .get(format!("/rpc/message/list?for_agent={viewer}"))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let ids: Vec<&str> = body["messages"].as_array().unwrap().iter().map(|m| m["message_id"].as_str().unwrap()).collect();
    assert!(ids.contains(&scoped_id), "viewer was an explicit `to:` recipient");
    assert!(!ids.contains(&other_id), "viewer was never dispatched the unscoped-to-them message");
}

/// `agent.register` seeds `context/<name>.md` and `_preamble.md` as empty
/// stubs without clobbering either if an agent (or its tooling) has since
/// hand-edited them, and `agent.listContext` reads branch/task/intent back
/// out of the frontmatter block.
#[test]
fn agent_context_round_trips_through_the_shared_context_file() {
    let client = test_client();
    let agent = register_agent(&client, "implementer");
    let name = thrum_core::ids::agent_id_to_name(&agent);

    let context_path = client.sync_dir().join("context").join(format!("{name}.md"));
    assert!(context_path.exists(), "agent.register must seed the context stub");

    let res = client.get("/rpc/agent/listContext").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let entry = body["contexts"].as_array().unwrap().iter().find(|c| c["agent_id"] == agent).unwrap();
    assert!(entry["branch"].is_null());
    assert!(entry["task"].is_null());
    assert!(entry["intent"].is_null());

    std::fs::write(
        &context_path,
        "---\nbranch: feature/context-rpc\ntask: wire up listContext\nintent: fix reviewer finding\n---\n",
    )
    .unwrap();

    // Re-registering the same agent must not overwrite the file it just hand-edited.
    let res = client
        .post("/rpc/agent/register")
        .header(ContentType::JSON)
        .body(format!(r#"{{"role": "implementer", "agent_id": "{agent}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get("/rpc/agent/listContext").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let entry = body["contexts"].as_array().unwrap().iter().find(|c| c["agent_id"] == agent).unwrap();
    assert_eq!(entry["branch"], "feature/context-rpc");
    assert_eq!(entry["task"], "wire up listContext");
    assert_eq!(entry["intent"], "fix reviewer finding");
}
