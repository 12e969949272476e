//! Scheduler tests through the dispatcher: gate ladder outcomes, pinned
//! branches, focus modes, and repository-wide pulls.

mod common;

use common::harness;

async fn seed_ready_task(
    h: &common::TestHarness,
    title: &str,
    project_id: Option<&str>,
    repository_id: Option<&str>,
) -> String {
    let response = h
        .dispatch(
            "connection-seed",
            serde_json::json!({
                "type": "task.create",
                "title": title,
                "projectId": project_id,
                "repositoryId": repository_id,
                "status": "ready",
            }),
        )
        .await
        .expect("seed task");
    response["id"].as_str().expect("task id").to_owned()
}

#[tokio::test]
async fn pull_claims_with_pinned_branch_and_then_blocks_occupied() {
    let h = harness().await;

    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, "main", 0, Some(&repository)).await;

    h.dispatch(
        "connection-seed",
        serde_json::json!({
            "type": "project.settings-update",
            "directoryId": directory,
            "pinnedBranch": "main",
        }),
    )
    .await
    .expect("pin branch");

    let task = seed_ready_task(&h, "implement feature", Some(&directory), None).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");

    assert_eq!(pulled["task"]["id"], serde_json::json!(task));
    assert_eq!(pulled["task"]["status"], serde_json::json!("in-progress"));
    assert_eq!(
        pulled["task"]["claim"]["controllerId"],
        serde_json::json!("controller-1")
    );
    assert_eq!(pulled["task"]["claim"]["branchName"], serde_json::json!("main"));
    assert_eq!(pulled["task"]["claim"]["baseBranch"], serde_json::json!("main"));

    // The claimed task occupies the project for the next worker.
    let second = h
        .dispatch(
            "connection-b",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-2",
            }),
        )
        .await
        .expect("second pull");

    assert_eq!(second["task"], serde_json::Value::Null);
    assert_eq!(second["availability"], serde_json::json!("blocked-occupied"));
}

#[tokio::test]
async fn dirty_projects_do_not_schedule() {
    let h = harness().await;

    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, "main", 3, Some(&repository)).await;
    seed_ready_task(&h, "task", Some(&directory), None).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");

    assert_eq!(pulled["task"], serde_json::Value::Null);
    assert_eq!(pulled["availability"], serde_json::json!("blocked-dirty"));
    assert_eq!(
        pulled["reason"],
        serde_json::json!("project has pending git changes")
    );
}

#[tokio::test]
async fn untracked_and_disabled_gates_fire_in_order() {
    let h = harness().await;
    let directory = h.seed_directory("/tmp/h").await;
    seed_ready_task(&h, "task", Some(&directory), None).await;

    // No git status cached at all.
    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");
    assert_eq!(pulled["availability"], serde_json::json!("blocked-untracked"));

    // Disabling automation takes priority over everything.
    h.dispatch(
        "connection-seed",
        serde_json::json!({
            "type": "automation.policy-set",
            "scopeLevel": "project",
            "scopeId": directory,
            "automationEnabled": false,
        }),
    )
    .await
    .expect("disable automation");

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");
    assert_eq!(pulled["availability"], serde_json::json!("blocked-disabled"));
}

#[tokio::test]
async fn pinned_branch_mismatch_blocks() {
    let h = harness().await;

    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, "feature/x", 0, Some(&repository))
        .await;

    h.dispatch(
        "connection-seed",
        serde_json::json!({
            "type": "project.settings-update",
            "directoryId": directory,
            "pinnedBranch": "main",
        }),
    )
    .await
    .expect("pin branch");

    seed_ready_task(&h, "task", Some(&directory), None).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");
    assert_eq!(
        pulled["availability"],
        serde_json::json!("blocked-pinned-branch")
    );
}

#[tokio::test]
async fn project_tasks_win_over_repository_and_global() {
    let h = harness().await;

    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, "main", 0, Some(&repository)).await;

    let global = seed_ready_task(&h, "global", None, None).await;
    let repo_task = seed_ready_task(&h, "repo", None, Some(&repository)).await;
    let project = seed_ready_task(&h, "project", Some(&directory), None).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");
    assert_eq!(pulled["task"]["id"], serde_json::json!(project));

    // Quiet the unused bindings while keeping the seeded order explicit.
    let _ = (global, repo_task);
}

#[tokio::test]
async fn own_only_focus_skips_repository_and_global_tasks() {
    let h = harness().await;

    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, "main", 0, Some(&repository)).await;

    h.dispatch(
        "connection-seed",
        serde_json::json!({
            "type": "project.settings-update",
            "directoryId": directory,
            "taskFocusMode": "own-only",
        }),
    )
    .await
    .expect("set focus");

    seed_ready_task(&h, "global", None, None).await;
    seed_ready_task(&h, "repo", None, Some(&repository)).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "directoryId": directory,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");

    assert_eq!(pulled["task"], serde_json::Value::Null);
    assert_eq!(pulled["availability"], serde_json::json!("ready"));
    assert_eq!(pulled["reason"], serde_json::json!("no ready tasks for project"));
}

#[tokio::test]
async fn repository_pull_walks_directories_in_creation_order() {
    let h = harness().await;

    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;

    // First directory is dirty; second is clean and should claim.
    let first = h.seed_directory("/tmp/one").await;
    let second = h.seed_directory("/tmp/two").await;
    h.set_git_status(&first, "main", 2, Some(&repository)).await;
    h.set_git_status(&second, "main", 0, Some(&repository)).await;

    let task = seed_ready_task(&h, "repo task", None, Some(&repository)).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "repositoryId": repository,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");

    assert_eq!(pulled["task"]["id"], serde_json::json!(task));
    assert_eq!(pulled["directoryId"], serde_json::json!(second));
    assert_eq!(
        pulled["task"]["claim"]["directoryId"],
        serde_json::json!(second)
    );
}

#[tokio::test]
async fn repository_pull_reports_the_first_directory_block() {
    let h = harness().await;

    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    let directory = h.seed_directory("/tmp/one").await;
    h.set_git_status(&directory, "main", 2, Some(&repository)).await;

    let pulled = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "repositoryId": repository,
                "controllerId": "controller-1",
            }),
        )
        .await
        .expect("pull");

    assert_eq!(pulled["task"], serde_json::Value::Null);
    assert_eq!(pulled["availability"], serde_json::json!("blocked-dirty"));
    assert_eq!(pulled["directoryId"], serde_json::json!(directory));
}

#[tokio::test]
async fn pull_requires_a_target() {
    let h = harness().await;
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "task.pull",
                "controllerId": "controller-1",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "task pull requires directoryId or repositoryId"
    );
}
