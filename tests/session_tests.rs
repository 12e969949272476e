//! Live-session tests: lifecycle, controller arbitration, output
//! fan-out with journal mirroring, and teardown.

mod common;

use std::sync::Arc;

use conductor::core::ExitStatus;
use conductor::sessions::live::MockLiveSession;

use common::{drain, harness, settle};

/// Start a live session for a fresh conversation backed by a mock PTY.
async fn start_session(h: &common::TestHarness) -> (String, Arc<MockLiveSession>) {
    let directory = h.seed_directory("/tmp/h").await;
    let conversation = h.seed_conversation(&directory, "thread").await;

    let live = Arc::new(MockLiveSession::new());
    h.launcher.push(Arc::clone(&live)).await;

    let response = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "pty.start",
                "conversationId": conversation,
            }),
        )
        .await
        .expect("pty.start");
    assert_eq!(response["live"], serde_json::json!(true));
    assert_eq!(response["status"], serde_json::json!("running"));

    (conversation, live)
}

#[tokio::test]
async fn claim_renew_takeover_and_release() {
    let h = harness().await;
    let (session, _live) = start_session(&h).await;

    // Connection A claims.
    let claimed = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "session.claim",
                "sessionId": session,
                "controllerId": "A1",
                "controllerType": "human",
            }),
        )
        .await
        .expect("claim");
    assert_eq!(claimed["action"], serde_json::json!("claimed"));

    // Connection B without takeover is rejected.
    let err = h
        .dispatch(
            "connection-b",
            serde_json::json!({
                "type": "session.claim",
                "sessionId": session,
                "controllerId": "B1",
            }),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already claimed"));

    // Connection B with takeover wins and sees the previous controller.
    let taken = h
        .dispatch(
            "connection-b",
            serde_json::json!({
                "type": "session.claim",
                "sessionId": session,
                "controllerId": "B1",
                "takeover": true,
            }),
        )
        .await
        .expect("takeover");
    assert_eq!(taken["action"], serde_json::json!("taken-over"));
    assert_eq!(
        taken["previousController"]["controllerId"],
        serde_json::json!("A1")
    );
    assert_eq!(taken["controller"]["controllerId"], serde_json::json!("B1"));

    // Only the claiming connection may release.
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.release", "sessionId": session}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already claimed"));

    let released = h
        .dispatch(
            "connection-b",
            serde_json::json!({"type": "session.release", "sessionId": session}),
        )
        .await
        .expect("release");
    assert_eq!(released["action"], serde_json::json!("released"));
}

#[tokio::test]
async fn respond_and_interrupt_require_control_and_write_bytes() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;

    h.dispatch(
        "connection-a",
        serde_json::json!({
            "type": "session.claim",
            "sessionId": session,
            "controllerId": "A1",
        }),
    )
    .await
    .expect("claim");

    // Another connection cannot mutate while claimed.
    let err = h
        .dispatch(
            "connection-b",
            serde_json::json!({
                "type": "session.respond",
                "sessionId": session,
                "text": "hello",
            }),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already claimed"));

    // The controller writes text and the session runs.
    let responded = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "session.respond",
                "sessionId": session,
                "text": "continue\n",
            }),
        )
        .await
        .expect("respond");
    assert_eq!(responded["status"], serde_json::json!("running"));

    // Interrupt writes a single ETX and completes the session.
    let interrupted = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "session.interrupt",
                "sessionId": session,
            }),
        )
        .await
        .expect("interrupt");
    assert_eq!(interrupted["status"], serde_json::json!("completed"));

    let writes = live.writes().await;
    assert_eq!(writes, vec![b"continue\n".to_vec(), vec![0x03]]);
}

#[tokio::test]
async fn output_fans_out_and_mirrors_into_the_journal_once() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;
    let mut rx = h.connect("connection-a").await;

    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "pty.attach", "sessionId": session}),
    )
    .await
    .expect("attach");

    live.push_output(b"one").await;
    live.push_output(b"two").await;
    settle().await;

    let envelopes = drain(&mut rx);
    let outputs: Vec<&serde_json::Value> = envelopes
        .iter()
        .filter(|e| e["type"] == "pty.output")
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0]["cursor"], serde_json::json!(1));
    assert_eq!(outputs[1]["cursor"], serde_json::json!(2));

    // The journal saw each chunk exactly once despite two attachments
    // (the internal observer plus connection A).
    let status = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.status", "sessionId": session}),
        )
        .await
        .expect("status");
    assert_eq!(status["lastOutputCursor"], serde_json::json!(2));

    // Attachment count: internal observer + connection A.
    assert_eq!(live.attachment_count().await, 2);

    // Re-attaching the same connection replaces its attachment.
    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "pty.attach", "sessionId": session, "sinceCursor": 0}),
    )
    .await
    .expect("re-attach");
    assert_eq!(live.attachment_count().await, 2);
}

#[tokio::test]
async fn attach_replays_from_the_requested_cursor() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;
    let mut rx = h.connect("connection-a").await;

    live.push_output(b"one").await;
    live.push_output(b"two").await;
    live.push_output(b"three").await;
    settle().await;

    let attach = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "pty.attach",
                "sessionId": session,
                "sinceCursor": 1,
            }),
        )
        .await
        .expect("attach");
    assert_eq!(attach["cursor"], serde_json::json!(3));
    settle().await;

    let cursors: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter(|e| e["type"] == "pty.output")
        .map(|e| e["cursor"].as_u64().expect("cursor"))
        .collect();
    assert_eq!(cursors, vec![2, 3]);
}

#[tokio::test]
async fn exit_clears_the_live_handle_and_notifies() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;
    let mut rx = h.connect("connection-a").await;

    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "pty.subscribe-events", "sessionId": session}),
    )
    .await
    .expect("subscribe events");

    live.push_exit(ExitStatus {
        code: Some(0),
        signal: None,
    })
    .await;
    settle().await;

    let envelopes = drain(&mut rx);
    let exit = envelopes
        .iter()
        .find(|e| e["type"] == "pty.exit")
        .expect("pty.exit delivered");
    assert_eq!(exit["exit"]["code"], serde_json::json!(0));

    let status = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.status", "sessionId": session}),
        )
        .await
        .expect("status");
    assert_eq!(status["live"], serde_json::json!(false));
    assert_eq!(status["status"], serde_json::json!("exited"));

    // The conversation's runtime projection followed.
    let conversation = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "conversation.list"}),
        )
        .await
        .expect("list conversations");
    let runtime = &conversation["conversations"][0]["runtime"];
    assert_eq!(runtime["live"], serde_json::json!(false));
    assert_eq!(runtime["status"], serde_json::json!("exited"));
    assert_eq!(runtime["lastExit"]["code"], serde_json::json!(0));
}

#[tokio::test]
async fn snapshot_caches_and_marks_stale_after_exit() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;

    live.set_frame(conductor::sessions::live::SnapshotFrame {
        rows: 4,
        cols: 80,
        lines: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        cursor_row: 3,
        cursor_col: 0,
        captured_at: chrono::Utc::now(),
    })
    .await;

    let fresh = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.snapshot", "sessionId": session}),
        )
        .await
        .expect("snapshot");
    assert_eq!(fresh["snapshot"]["stale"], serde_json::json!(false));
    assert_eq!(fresh["snapshot"]["lines"].as_array().map(Vec::len), Some(4));

    // Tail reduction keeps the last rows.
    let tail = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "session.snapshot",
                "sessionId": session,
                "tailLines": 2,
            }),
        )
        .await
        .expect("tail snapshot");
    assert_eq!(
        tail["snapshot"]["lines"],
        serde_json::json!(["c", "d"])
    );

    live.push_exit(ExitStatus {
        code: Some(1),
        signal: None,
    })
    .await;
    settle().await;

    let cached = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.snapshot", "sessionId": session}),
        )
        .await
        .expect("stale snapshot");
    assert_eq!(cached["snapshot"]["stale"], serde_json::json!(true));
}

#[tokio::test]
async fn remove_destroys_in_memory_state_only() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;

    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "session.remove", "sessionId": session}),
    )
    .await
    .expect("remove");

    assert!(live.is_closed().await);

    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.status", "sessionId": session}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "session not found");

    // The conversation row survives.
    let conversations = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "conversation.list"}),
        )
        .await
        .expect("list conversations");
    assert_eq!(
        conversations["conversations"].as_array().map(Vec::len),
        Some(1)
    );
}

#[tokio::test]
async fn attention_list_surfaces_needs_input_sessions() {
    let h = harness().await;
    let (_session, _live) = start_session(&h).await;

    // Nothing needs input yet.
    let attention = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "attention.list"}),
        )
        .await
        .expect("attention list");
    assert_eq!(attention["sessions"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn disconnect_detaches_and_keeps_the_claim() {
    let h = harness().await;
    let (session, live) = start_session(&h).await;
    let _rx = h.connect("connection-a").await;

    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "pty.attach", "sessionId": session}),
    )
    .await
    .expect("attach");
    h.dispatch(
        "connection-a",
        serde_json::json!({
            "type": "session.claim",
            "sessionId": session,
            "controllerId": "A1",
        }),
    )
    .await
    .expect("claim");
    assert_eq!(live.attachment_count().await, 2);

    h.dispatcher.disconnect("connection-a").await;
    assert_eq!(live.attachment_count().await, 1, "client attachment gone");

    // The claim survives the disconnect; takeover is the recovery path.
    let err = h
        .dispatch(
            "connection-b",
            serde_json::json!({
                "type": "session.claim",
                "sessionId": session,
                "controllerId": "B1",
            }),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already claimed"));
}
