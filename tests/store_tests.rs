//! Store-level tests: uniqueness, scope checks, the task state machine,
//! reorder semantics, and legacy value acceptance.

mod common;

use conductor::core::{Scope, TaskStatus};
use conductor::store::{
    ClaimTaskParams, CreateConversationParams, CreateTaskParams, UpsertDirectoryParams,
    UpsertRepositoryParams,
};

use common::test_store;

fn scope() -> Scope {
    Scope::local()
}

async fn seed_directory(store: &conductor::store::SqliteStore, path: &str) -> String {
    store
        .upsert_directory(UpsertDirectoryParams {
            id: None,
            scope: scope(),
            path: path.to_owned(),
        })
        .await
        .expect("seed directory")
        .id
}

async fn seed_task(
    store: &conductor::store::SqliteStore,
    title: &str,
    status: TaskStatus,
) -> String {
    store
        .create_task(CreateTaskParams {
            id: None,
            scope: scope(),
            repository_id: None,
            project_id: None,
            title: title.to_owned(),
            body: String::new(),
            status: Some(status).filter(|s| *s != TaskStatus::Draft),
            linear: None,
        })
        .await
        .expect("seed task")
        .id
}

#[tokio::test]
async fn directory_upsert_is_unique_by_scope_and_path() {
    let store = test_store().await;

    let first = seed_directory(&store, "/tmp/project").await;
    let second = seed_directory(&store, "/tmp/project").await;
    assert_eq!(first, second, "same path resolves to the same row");

    // A different explicit id for the same active path conflicts.
    let err = store
        .upsert_directory(UpsertDirectoryParams {
            id: Some("directory-other".to_owned()),
            scope: scope(),
            path: "/tmp/project".to_owned(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "directory already exists");

    // Archiving frees the path for a new row.
    store
        .archive_directory(&scope(), &first)
        .await
        .expect("archive");
    let third = seed_directory(&store, "/tmp/project").await;
    assert_ne!(first, third);
}

#[tokio::test]
async fn directory_upsert_rejects_scope_change() {
    let store = test_store().await;
    let id = seed_directory(&store, "/tmp/project").await;

    let err = store
        .upsert_directory(UpsertDirectoryParams {
            id: Some(id),
            scope: Scope::new("tenant-other", "user-other", "workspace-other"),
            path: "/tmp/project".to_owned(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "directory scope mismatch");
}

#[tokio::test]
async fn repository_upsert_restores_archived_rows_by_url() {
    let store = test_store().await;

    let repo = store
        .upsert_repository(UpsertRepositoryParams {
            id: None,
            scope: scope(),
            name: "harness".to_owned(),
            remote_url: "https://github.com/acme/harness.git".to_owned(),
            default_branch: None,
            metadata: None,
        })
        .await
        .expect("create repository");
    assert_eq!(repo.default_branch, "main");

    store
        .archive_repository(&scope(), &repo.id)
        .await
        .expect("archive");

    let restored = store
        .upsert_repository(UpsertRepositoryParams {
            id: None,
            scope: scope(),
            name: "harness-renamed".to_owned(),
            remote_url: "https://github.com/acme/harness.git".to_owned(),
            default_branch: Some("trunk".to_owned()),
            metadata: None,
        })
        .await
        .expect("restore repository");

    assert_eq!(restored.id, repo.id, "archived row restored, not duplicated");
    assert!(restored.is_active());
    assert_eq!(restored.name, "harness-renamed");
    assert_eq!(restored.default_branch, "trunk");
}

#[tokio::test]
async fn conversation_requires_active_scope_matched_directory() {
    let store = test_store().await;
    let directory_id = seed_directory(&store, "/tmp/project").await;

    let err = store
        .create_conversation(CreateConversationParams {
            id: None,
            scope: Scope::new("tenant-other", "user-local", "workspace-local"),
            directory_id: directory_id.clone(),
            title: "thread".to_owned(),
            agent: conductor::core::AgentKind::Claude,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "conversation directory scope mismatch");

    store
        .archive_directory(&scope(), &directory_id)
        .await
        .expect("archive");

    let err = store
        .create_conversation(CreateConversationParams {
            id: None,
            scope: scope(),
            directory_id,
            title: "thread".to_owned(),
            agent: conductor::core::AgentKind::Claude,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "directory not found");
}

#[tokio::test]
async fn task_claim_follows_the_state_machine() {
    let store = test_store().await;

    let draft = seed_task(&store, "draft task", TaskStatus::Draft).await;
    let err = store
        .claim_task(ClaimTaskParams {
            scope: scope(),
            task_id: draft.clone(),
            controller_id: "controller-1".to_owned(),
            directory_id: None,
            branch_name: None,
            base_branch: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot claim draft task");

    let ready = seed_task(&store, "ready task", TaskStatus::Ready).await;
    let claimed = store
        .claim_task(ClaimTaskParams {
            scope: scope(),
            task_id: ready.clone(),
            controller_id: "controller-1".to_owned(),
            directory_id: None,
            branch_name: Some("main".to_owned()),
            base_branch: Some("main".to_owned()),
        })
        .await
        .expect("claim");
    assert_eq!(claimed.status, TaskStatus::InProgress);
    let claim = claimed.claim.expect("claim state present iff in-progress");
    assert_eq!(claim.controller_id, "controller-1");
    assert_eq!(claim.branch_name.as_deref(), Some("main"));

    // Idempotent re-claim for the same controller.
    let again = store
        .claim_task(ClaimTaskParams {
            scope: scope(),
            task_id: ready.clone(),
            controller_id: "controller-1".to_owned(),
            directory_id: None,
            branch_name: None,
            base_branch: None,
        })
        .await
        .expect("re-claim");
    assert_eq!(again.status, TaskStatus::InProgress);

    // Another controller loses deterministically.
    let err = store
        .claim_task(ClaimTaskParams {
            scope: scope(),
            task_id: ready.clone(),
            controller_id: "controller-2".to_owned(),
            directory_id: None,
            branch_name: None,
            base_branch: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "task already claimed: controller-1");

    // Complete stamps completed_at and clears the claim.
    let completed = store.complete_task(&scope(), &ready).await.expect("complete");
    assert_eq!(completed.status, TaskStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert!(completed.claim.is_none());

    let err = store
        .claim_task(ClaimTaskParams {
            scope: scope(),
            task_id: ready.clone(),
            controller_id: "controller-2".to_owned(),
            directory_id: None,
            branch_name: None,
            base_branch: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot claim completed task");

    // Ready clears completion again.
    let reopened = store.ready_task(&scope(), &ready).await.expect("ready");
    assert_eq!(reopened.status, TaskStatus::Ready);
    assert!(reopened.completed_at.is_none());
    assert!(reopened.claim.is_none());
}

#[tokio::test]
async fn claim_directory_must_be_active_and_scope_matched() {
    let store = test_store().await;
    let task = seed_task(&store, "task", TaskStatus::Ready).await;
    let directory = seed_directory(&store, "/tmp/project").await;

    store
        .archive_directory(&scope(), &directory)
        .await
        .expect("archive");

    let err = store
        .claim_task(ClaimTaskParams {
            scope: scope(),
            task_id: task,
            controller_id: "controller-1".to_owned(),
            directory_id: Some(directory),
            branch_name: None,
            base_branch: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "directory not found");
}

#[tokio::test]
async fn order_indexes_append_per_scope() {
    let store = test_store().await;

    let a = seed_task(&store, "a", TaskStatus::Ready).await;
    let b = seed_task(&store, "b", TaskStatus::Ready).await;

    let task_a = store.require_task(&scope(), &a).await.expect("a");
    let task_b = store.require_task(&scope(), &b).await.expect("b");
    assert_eq!(task_a.order_index, 0);
    assert_eq!(task_b.order_index, 1);
}

#[tokio::test]
async fn reorder_preserves_the_task_set() {
    let store = test_store().await;

    let a = seed_task(&store, "a", TaskStatus::Ready).await;
    let b = seed_task(&store, "b", TaskStatus::Ready).await;
    let c = seed_task(&store, "c", TaskStatus::Ready).await;
    let d = seed_task(&store, "d", TaskStatus::Ready).await;

    let reordered = store
        .reorder_tasks(&scope(), None, None, &[c.clone(), a.clone()])
        .await
        .expect("reorder");

    let order: Vec<&str> = reordered.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(order, vec![c.as_str(), a.as_str(), b.as_str(), d.as_str()]);
    for (position, task) in reordered.iter().enumerate() {
        assert_eq!(task.order_index, position as i64);
    }

    // Duplicates are rejected.
    let err = store
        .reorder_tasks(&scope(), None, None, &[a.clone(), a.clone()])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "orderedTaskIds contains duplicate ids");

    // Blank entries are trimmed rather than rejected.
    let reordered = store
        .reorder_tasks(&scope(), None, None, &[String::new(), d.clone()])
        .await
        .expect("reorder with blanks");
    assert_eq!(reordered[0].id, d);

    // Unknown ids are rejected.
    let err = store
        .reorder_tasks(&scope(), None, None, &["task-missing".to_owned()])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "task not found");
}

#[tokio::test]
async fn task_links_enforce_scope_and_liveness() {
    let store = test_store().await;
    let directory = seed_directory(&store, "/tmp/project").await;

    // Project link derives project scope kind.
    let task = store
        .create_task(CreateTaskParams {
            id: None,
            scope: scope(),
            repository_id: None,
            project_id: Some(directory.clone()),
            title: "scoped".to_owned(),
            body: String::new(),
            status: None,
            linear: None,
        })
        .await
        .expect("create");
    assert_eq!(task.scope_kind, conductor::core::TaskScopeKind::Project);

    // A missing repository link fails.
    let err = store
        .create_task(CreateTaskParams {
            id: None,
            scope: scope(),
            repository_id: Some("repository-missing".to_owned()),
            project_id: None,
            title: "bad".to_owned(),
            body: String::new(),
            status: None,
            linear: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "repository not found");
}

#[tokio::test]
async fn explicit_task_id_conflicts_are_rejected() {
    let store = test_store().await;

    store
        .create_task(CreateTaskParams {
            id: Some("task-fixed".to_owned()),
            scope: scope(),
            repository_id: None,
            project_id: None,
            title: "one".to_owned(),
            body: String::new(),
            status: None,
            linear: None,
        })
        .await
        .expect("create");

    let err = store
        .create_task(CreateTaskParams {
            id: Some("task-fixed".to_owned()),
            scope: scope(),
            repository_id: None,
            project_id: None,
            title: "two".to_owned(),
            body: String::new(),
            status: None,
            linear: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "task already exists");
}

#[tokio::test]
async fn legacy_rows_read_back_normalized() {
    let store = test_store().await;
    let pool = store.pool();
    let now = chrono::Utc::now().to_rfc3339();

    // A row persisted by an older build: status 'queued', no scope kind,
    // malformed linear JSON.
    sqlx::query(
        r"
        INSERT INTO tasks (
            task_id, tenant_id, user_id, workspace_id,
            title, body, status, order_index, linear_json, created_at, updated_at
        ) VALUES ('task-legacy', 'tenant-local', 'user-local', 'workspace-local',
                  'legacy', '', 'queued', 0, 'not json', ?, ?)
        ",
    )
    .bind(&now)
    .bind(&now)
    .execute(&pool)
    .await
    .expect("insert legacy row");

    let task = store
        .require_task(&Scope::local(), "task-legacy")
        .await
        .expect("read legacy row");

    assert_eq!(task.status, TaskStatus::Ready, "queued reads as ready");
    assert_eq!(task.scope_kind, conductor::core::TaskScopeKind::Global);
    assert_eq!(
        task.linear,
        Some(conductor::core::LinearFields::default()),
        "malformed linear JSON degrades to the default record"
    );
}

#[tokio::test]
async fn telemetry_requires_an_existing_conversation() {
    let store = test_store().await;

    let err = store
        .record_telemetry(
            &scope(),
            "conversation-missing",
            conductor::core::TelemetrySource::Hook,
            "tool-use",
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "conversation not found");

    let directory = seed_directory(&store, "/tmp/project").await;
    let conversation = store
        .create_conversation(CreateConversationParams {
            id: None,
            scope: scope(),
            directory_id: directory,
            title: "thread".to_owned(),
            agent: conductor::core::AgentKind::Codex,
        })
        .await
        .expect("create conversation");

    let record = store
        .record_telemetry(
            &scope(),
            &conversation.id,
            conductor::core::TelemetrySource::Adapter,
            "token-usage",
            serde_json::json!({"inputTokens": 10}),
        )
        .await
        .expect("record telemetry");
    assert_eq!(record.kind, "token-usage");

    let records = store
        .list_telemetry(&scope(), &conversation.id)
        .await
        .expect("list telemetry");
    assert_eq!(records.len(), 1);
}
