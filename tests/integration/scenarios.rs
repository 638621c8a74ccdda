//! One test per concrete scenario (literal input -> expected effect),
//! distinct from `invariants.rs`'s property-style tests.

use rocket::http::{ContentType, Status};

use crate::common::{register_agent, send_message, start_session, test_client, test_client_at};

fn read_event_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    content.lines().filter(|l| !l.trim().is_empty()).map(|l| serde_json::from_str(l).unwrap()).collect()
}

/// Scenario 1: a fresh daemon submitting 10 `agent.register` calls assigns
/// the 10 trailing sequence numbers contiguously, right after `daemon.start`.
#[test]
fn ten_agent_registrations_get_contiguous_sequence_numbers() {
    let client = test_client();
    for i in 0..10 {
        register_agent(&client, &format!("role{i}"));
    }
    let events = read_event_lines(&client.sync_dir().join("events.jsonl"));
    let mut seqs: Vec<u64> = events.iter().map(|e| e["sequence"].as_u64().unwrap()).collect();
    seqs.sort_unstable();
    let register_seqs = &seqs[seqs.len() - 10..];
    let expected: Vec<u64> = ((register_seqs[0])..=(register_seqs[9])).collect();
    assert_eq!(register_seqs, expected.as_slice());
}

/// Scenario 2: sequence numbering survives a restart — write 5 events, shut
/// down, restart, write one more, expect the max sequence to be exactly 6
/// past what it was when the daemon first started (daemon.start + 5 agents,
/// then a restart's own daemon.start + 1 more agent).
#[test]
fn sequence_persists_across_restart() {
    let client = test_client();
    for i in 0..5 {
        register_agent(&client, &format!("role{i}"));
    }
    let before_restart_max = read_event_lines(&client.sync_dir().join("events.jsonl"))
        .iter()
        .map(|e| e["sequence"].as_u64().unwrap())
        .max()
        .unwrap();

    let dir = client.shutdown_keep_dir();
    let client = test_client_at(dir);
    register_agent(&client, "late-comer");

    let after_restart_max = read_event_lines(&client.sync_dir().join("events.jsonl"))
        .iter()
        .map(|e| e["sequence"].as_u64().unwrap())
        .max()
        .unwrap();

    // The restart's own `daemon.start` takes one sequence number, then the
    // new registration takes the next, so the max grows by exactly 2.
    assert_eq!(after_restart_max, before_restart_max + 2);
}

/// Scenario 3: ingesting an event with a foreign `origin_daemon` preserves
/// it verbatim in the projected `events` row rather than relabeling it to
/// the local daemon's own id.
#[test]
fn origin_is_preserved_on_ingest() {
    use thrum_core::bus::NotificationBus;
    use thrum_core::log::LogWriter;
    use thrum_core::store::Store;
    use thrum_core::sync::InboundEvent;

    let store = Store::open_in_memory().unwrap();
    let dir = std::env::temp_dir().join(format!("thrum_scenario3_{}", uuid::Uuid::new_v4()));
    let log = LogWriter::open(&dir).unwrap();
    let bus = NotificationBus::new(16);

    let inbound = InboundEvent {
        event_id: "evt_peer_1".to_string(),
        type_: "agent.register".to_string(),
        timestamp: thrum_core::ids::now_rfc3339(),
        origin_daemon: "d_remote_peer".to_string(),
        sequence: 1,
        v: 1,
        body: serde_json::json!({
            "agent_id": "agent:reviewer:PEER1",
            "kind": "agent",
            "role": "reviewer",
            "registered_at": thrum_core::ids::now_rfc3339(),
        }),
        author_agent_id: None,
    };

    thrum_core::sync::ingest_batch(&store, &log, &bus, vec![inbound]).unwrap();

    assert!(store.event_exists("evt_peer_1").unwrap());
    assert_eq!(store.event_origin("evt_peer_1").unwrap().as_deref(), Some("d_remote_peer"));

    std::fs::remove_dir_all(&dir).ok();
}

/// Scenario 4: a message's create/edit/delete all land in the author's
/// shard file, in order.
#[test]
fn message_create_edit_delete_land_in_the_author_shard_in_order() {
    let client = test_client();
    let author = register_agent(&client, "test");
    let session = start_session(&client, &author);
    let msg = send_message(&client, &author, &session, "original", "[]");
    let message_id = msg["message_id"].as_str().unwrap().to_string();

    let shard_name = thrum_core::ids::agent_id_to_name(&author);
    let shard_path = client.sync_dir().join("messages").join(format!("{shard_name}.jsonl"));
    assert!(shard_path.exists());

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
}

/// Scenario 5: a message scoped `group:backend` reaches the group's static
/// member plus every agent matching the group's role member, each getting a
/// pending read marker.
#[test]
fn dispatch_to_group_reaches_static_and_role_members() {
    let client = test_client();
    let impl_1 = register_agent(&client, "standalone");
    let res = client
        .post("/rpc/group/create")
        .header(ContentType::JSON)
        .body(r#"{"name": "backend", "created_by": "tester"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/rpc/group/member/add")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"group_name": "backend", "member_type": "agent", "member_value": "{impl_1}", "added_by": "tester"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/rpc/group/member/add")
        .header(ContentType::JSON)
        .body(r#"{"group_name": "backend", "member_type": "role", "member_value": "implementer", "added_by": "tester"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let implementer_1 = register_agent(&client, "implementer");
    let implementer_2 = register_agent(&client, "implementer");

    let sender = register_agent(&client, "caller");
    let sender_session = start_session(&client, &sender);
    let msg = send_message(&client, &sender, &sender_session, "ship it", r#"[{"type": "group", "value": "backend"}]"#);
    let message_id = msg["message_id"].as_str().unwrap();
    assert_eq!(msg["recipient_count"], 3);

    for viewer in [&impl_1, &implementer_1, &implementer_2] {
        let res = client
            .get(format!("/rpc/message/list?for_agent={viewer}&unread_for_agent={viewer}"))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let body: serde_json::Value = res.into_json().unwrap();
        let ids: Vec<&str> = body["messages"].as_array().unwrap().iter().map(|m| m["message_id"].as_str().unwrap()).collect();
        assert!(ids.contains(&message_id), "{viewer} should have an unread read-marker for the dispatched message");
    }
}

/// Scenario 6: role-scope expansion is a snapshot at send time — an agent
/// that registers with the matching role after the send has no read-marker
/// for that earlier message.
#[test]
fn role_scope_is_snapshotted_not_live() {
    let client = test_client();
    let implementer_1 = register_agent(&client, "implementer");

    let sender = register_agent(&client, "caller");
    let sender_session = start_session(&client, &sender);
    let msg = send_message(&client, &sender, &sender_session, "ship it", r#"[{"type": "role", "value": "implementer"}]"#);
    let message_id = msg["message_id"].as_str().unwrap();
    assert_eq!(msg["recipient_count"], 1);

    let late_implementer = register_agent(&client, "implementer");

    let res = client
        .get(format!(
            "/rpc/message/list?for_agent={late_implementer}&unread_for_agent={late_implementer}"
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let ids: Vec<&str> = body["messages"].as_array().unwrap().iter().map(|m| m["message_id"].as_str().unwrap()).collect();
    assert!(!ids.contains(&message_id), "an implementer registered after the send must not see it as unread");

    let res = client
        .get(format!("/rpc/message/list?for_agent={implementer_1}&unread_for_agent={implementer_1}"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let ids: Vec<&str> = body["messages"].as_array().unwrap().iter().map(|m| m["message_id"].as_str().unwrap()).collect();
    assert!(ids.contains(&message_id), "the implementer registered before the send must have the marker");
}
