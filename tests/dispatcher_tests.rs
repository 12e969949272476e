//! Dispatcher-level tests: command routing, observed events, and
//! subscription replay semantics.

mod common;

use conductor::core::{EventScope, ObservedEvent, RuntimeStatus, Scope};

use common::{drain, harness};

#[tokio::test]
async fn state_changing_commands_emit_observed_events() {
    let h = harness().await;
    let mut rx = h.connect("connection-a").await;

    // Subscribe from the start, everything in scope.
    let subscribed = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "stream.subscribe", "tenantId": "tenant-local"}),
        )
        .await
        .expect("subscribe");
    assert_eq!(subscribed["cursor"], serde_json::json!(0));

    let directory = h.seed_directory("/tmp/h").await;
    let conversation = h.seed_conversation(&directory, "thread").await;
    h.dispatch(
        "connection-a",
        serde_json::json!({
            "type": "conversation.update",
            "id": conversation,
            "title": "renamed",
        }),
    )
    .await
    .expect("update");

    let kinds: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter(|e| e["type"] == "stream.event")
        .map(|e| e["event"]["type"].as_str().expect("kind").to_owned())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "directory-upserted",
            "conversation-created",
            "conversation-updated"
        ]
    );
}

#[tokio::test]
async fn replay_skips_output_unless_opted_in() {
    let h = harness().await;
    let scope = Scope::local();

    // Journal entries 1..=10 with session output at 7 and 9.
    for cursor in 1..=10u64 {
        let event = if cursor == 7 || cursor == 9 {
            ObservedEvent::SessionOutput {
                session_id: "conversation-1".to_owned(),
                cursor,
                chunk_base64: "aGk=".to_owned(),
            }
        } else {
            ObservedEvent::SessionStatus {
                session_id: "conversation-1".to_owned(),
                status: RuntimeStatus::Running,
                attention_reason: None,
            }
        };
        h.dispatcher
            .publish_event(
                EventScope::conversation(&scope, None, "conversation-1"),
                event,
            )
            .await;
    }

    let mut rx = h.connect("connection-a").await;
    let subscribed = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "stream.subscribe",
                "tenantId": "tenant-local",
                "includeOutput": false,
                "afterCursor": 5,
            }),
        )
        .await
        .expect("subscribe");
    assert_eq!(subscribed["cursor"], serde_json::json!(10));

    let cursors: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter(|e| e["type"] == "stream.event")
        .map(|e| e["cursor"].as_u64().expect("cursor"))
        .collect();
    assert_eq!(cursors, vec![6, 8, 10]);
}

#[tokio::test]
async fn live_feed_respects_the_filter_after_replay() {
    let h = harness().await;
    let scope = Scope::local();

    let mut rx = h.connect("connection-a").await;
    let subscribed = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "stream.subscribe",
                "conversationId": "conversation-1",
                "includeOutput": true,
            }),
        )
        .await
        .expect("subscribe");
    let subscription_id = subscribed["subscriptionId"].as_str().expect("id").to_owned();

    h.dispatcher
        .publish_event(
            EventScope::conversation(&scope, None, "conversation-1"),
            ObservedEvent::SessionOutput {
                session_id: "conversation-1".to_owned(),
                cursor: 1,
                chunk_base64: "aGk=".to_owned(),
            },
        )
        .await;
    h.dispatcher
        .publish_event(
            EventScope::conversation(&scope, None, "conversation-2"),
            ObservedEvent::SessionStatus {
                session_id: "conversation-2".to_owned(),
                status: RuntimeStatus::Running,
                attention_reason: None,
            },
        )
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1, "only the matching conversation delivers");
    assert_eq!(events[0]["subscriptionId"], serde_json::json!(subscription_id));
    assert_eq!(events[0]["cursor"], serde_json::json!(1));

    // Unsubscribe stops delivery.
    let unsubscribed = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "stream.unsubscribe",
                "subscriptionId": subscription_id,
            }),
        )
        .await
        .expect("unsubscribe");
    assert_eq!(unsubscribed["unsubscribed"], serde_json::json!(true));

    h.dispatcher
        .publish_event(
            EventScope::conversation(&scope, None, "conversation-1"),
            ObservedEvent::SessionOutput {
                session_id: "conversation-1".to_owned(),
                cursor: 2,
                chunk_base64: "aGk=".to_owned(),
            },
        )
        .await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn unknown_command_kinds_fail_loudly() {
    let h = harness().await;
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "directory.rename", "id": "directory-1"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unsupported command type: directory.rename");
}

#[tokio::test]
async fn conversation_delete_destroys_the_session_with_the_same_id() {
    let h = harness().await;
    let directory = h.seed_directory("/tmp/h").await;
    let conversation = h.seed_conversation(&directory, "thread").await;

    let live = std::sync::Arc::new(conductor::sessions::live::MockLiveSession::new());
    h.launcher.push(std::sync::Arc::clone(&live)).await;
    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "pty.start", "conversationId": conversation}),
    )
    .await
    .expect("start");

    h.dispatch(
        "connection-a",
        serde_json::json!({"type": "conversation.delete", "id": conversation}),
    )
    .await
    .expect("delete");

    assert!(live.is_closed().await);
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "session.status", "sessionId": conversation}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "session not found");
}

#[tokio::test]
async fn project_status_aggregates_the_project_view() {
    let h = harness().await;
    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, "main", 0, Some(&repository)).await;

    let status = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "project.status", "directoryId": directory}),
        )
        .await
        .expect("project status");

    assert_eq!(status["availability"], serde_json::json!("ready"));
    assert_eq!(status["automation"]["enabled"], serde_json::json!(true));
    assert_eq!(status["liveThreadCount"], serde_json::json!(0));
    assert_eq!(status["git"]["branch"], serde_json::json!("main"));
    assert_eq!(
        status["settings"]["taskFocusMode"],
        serde_json::json!("balanced")
    );
}

#[tokio::test]
async fn scope_isolation_holds_across_tenants() {
    let h = harness().await;

    h.dispatch(
        "connection-a",
        serde_json::json!({
            "type": "directory.upsert",
            "tenantId": "tenant-a",
            "path": "/tmp/a",
        }),
    )
    .await
    .expect("tenant-a directory");

    let listed = h
        .dispatch(
            "connection-a",
            serde_json::json!({"type": "directory.list", "tenantId": "tenant-b"}),
        )
        .await
        .expect("tenant-b list");
    assert_eq!(listed["directories"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn linear_import_creates_a_scoped_task() {
    let h = harness().await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;

    h.linear
        .insert(conductor::linear::LinearIssue {
            id: "issue-uuid-1".to_owned(),
            identifier: "ENG-42".to_owned(),
            title: "Fix the flaky test".to_owned(),
            description: "It flakes.".to_owned(),
            priority: Some(2),
            ..conductor::linear::LinearIssue::default()
        })
        .await;

    // Scope is required.
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "linear.issue.import",
                "url": "https://acme.linear.app/eng/issue/eng-42/fix-the-flaky-test",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "task scope required: repositoryId or projectId");

    let imported = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "linear.issue.import",
                "url": "https://acme.linear.app/eng/issue/eng-42/fix-the-flaky-test",
                "repositoryId": repository,
            }),
        )
        .await
        .expect("import");

    assert_eq!(imported["title"], serde_json::json!("Fix the flaky test"));
    assert_eq!(imported["scopeKind"], serde_json::json!("repository"));
    assert_eq!(imported["linear"]["identifier"], serde_json::json!("ENG-42"));
    assert_eq!(imported["linear"]["priority"], serde_json::json!(2));

    // Unknown issues surface the identifier in the error.
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "linear.issue.import",
                "identifier": "eng-999",
                "repositoryId": repository,
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "linear issue not found: ENG-999");
}
