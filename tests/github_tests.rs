//! GitHub tests: PR-create idempotence and the per-branch sync loop.

mod common;

use std::sync::Arc;

use conductor::core::{PullRequestState, Scope};
use conductor::github::sync::GitHubSync;
use conductor::github::{MockGitHubApi, RemoteJob, RemotePullRequest};
use conductor::store::UpsertPullRequestParams;

use common::{harness, TestHarness};

fn remote_pr(number: i64, branch: &str, sha: &str) -> RemotePullRequest {
    RemotePullRequest {
        number,
        title: format!("PR {number}"),
        url: format!("https://github.com/acme/h/pull/{number}"),
        author: Some("octocat".to_owned()),
        head_branch: branch.to_owned(),
        head_sha: sha.to_owned(),
        base_branch: "main".to_owned(),
        draft: false,
        open: true,
    }
}

fn job(id: &str, status: &str, conclusion: Option<&str>) -> RemoteJob {
    RemoteJob {
        provider: "check-run".to_owned(),
        external_id: id.to_owned(),
        name: format!("job-{id}"),
        status: status.to_owned(),
        conclusion: conclusion.map(str::to_owned),
        url: None,
        started_at: None,
        completed_at: None,
    }
}

/// Directory + github repository + tracked branch in the cache.
async fn seed_project(h: &TestHarness, branch: &str) -> (String, String) {
    let directory = h.seed_directory("/tmp/h").await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.set_git_status(&directory, branch, 0, Some(&repository)).await;
    (directory, repository)
}

#[tokio::test]
async fn pr_create_returns_the_existing_open_record_without_http() {
    let h = harness().await;
    let (directory, repository) = seed_project(&h, "feature/x").await;

    // Pre-insert an open PR record for (repository, feature/x).
    h.store
        .upsert_github_pull_request(UpsertPullRequestParams {
            scope: Scope::local(),
            repository_id: repository.clone(),
            directory_id: Some(directory.clone()),
            number: 7,
            title: "existing".to_owned(),
            url: "https://github.com/acme/h/pull/7".to_owned(),
            author: None,
            head_branch: "feature/x".to_owned(),
            base_branch: "main".to_owned(),
            head_sha: "abc123".to_owned(),
            state: PullRequestState::Open,
            draft: false,
        })
        .await
        .expect("pre-insert PR");

    let response = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "github.pr-create",
                "directoryId": directory,
                "headBranch": "feature/x",
            }),
        )
        .await
        .expect("pr-create");

    assert_eq!(response["created"], serde_json::json!(false));
    assert_eq!(response["existing"], serde_json::json!(true));
    assert_eq!(response["pr"]["number"], serde_json::json!(7));
    assert_eq!(h.github.create_calls().await, 0, "no external HTTP issued");
}

#[tokio::test]
async fn pr_create_goes_out_when_no_record_exists() {
    let h = harness().await;
    let (directory, _repository) = seed_project(&h, "feature/y").await;

    let response = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "github.pr-create",
                "directoryId": directory,
                "title": "Add y",
            }),
        )
        .await
        .expect("pr-create");

    assert_eq!(response["created"], serde_json::json!(true));
    assert_eq!(response["existing"], serde_json::json!(false));
    assert_eq!(response["pr"]["headBranch"], serde_json::json!("feature/y"));
    assert_eq!(response["pr"]["baseBranch"], serde_json::json!("main"));
    assert_eq!(h.github.create_calls().await, 1);

    let created = h.github.created().await;
    assert_eq!(created[0].title, "Add y");
}

#[tokio::test]
async fn pr_create_requires_a_tracked_branch_and_repository() {
    let h = harness().await;
    let directory = h.seed_directory("/tmp/h").await;

    // No cache entry at all: no tracked repository.
    let err = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "github.pr-create",
                "directoryId": directory,
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "project has no tracked github repository");
}

#[tokio::test]
async fn sync_upserts_open_prs_with_jobs_and_rollup() {
    let h = harness().await;
    let (directory, repository) = seed_project(&h, "feature/x").await;

    h.github
        .set_open_pr("acme", "h", "feature/x", remote_pr(12, "feature/x", "sha-12"))
        .await;
    h.github
        .set_jobs(
            "sha-12",
            vec![
                job("1", "completed", Some("success")),
                job("2", "in_progress", None),
            ],
        )
        .await;

    let sync = Arc::new(GitHubSync::new(
        Arc::clone(&h.dispatcher),
        Arc::clone(&h.github) as Arc<dyn conductor::github::GitHubApi>,
    ));
    sync.poll().await;

    let pr = h
        .store
        .find_open_pr_for_branch(&Scope::local(), &repository, "feature/x")
        .await
        .expect("query")
        .expect("PR recorded");
    assert_eq!(pr.number, 12);
    assert_eq!(pr.ci_rollup, conductor::core::CiRollup::Pending);

    let jobs = h.store.list_github_pr_jobs(&pr.id).await.expect("jobs");
    assert_eq!(jobs.len(), 2);

    let state = h
        .store
        .get_github_sync_state(&Scope::local(), &repository, Some(&directory), "feature/x")
        .await
        .expect("query state")
        .expect("state recorded");
    assert!(state.last_success_at.is_some());
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn sync_closes_records_whose_remote_pr_vanished() {
    let h = harness().await;
    let (_directory, repository) = seed_project(&h, "feature/x").await;

    h.github
        .set_open_pr("acme", "h", "feature/x", remote_pr(12, "feature/x", "sha-12"))
        .await;

    let sync = Arc::new(GitHubSync::new(
        Arc::clone(&h.dispatcher),
        Arc::clone(&h.github) as Arc<dyn conductor::github::GitHubApi>,
    ));
    sync.poll().await;

    // The PR merges (vanishes from the head branch); the record closes.
    h.github.clear_open_pr("acme", "h", "feature/x").await;
    sync.poll().await;

    let open = h
        .store
        .find_open_pr_for_branch(&Scope::local(), &repository, "feature/x")
        .await
        .expect("query");
    assert!(open.is_none(), "record marked closed");

    let all = h
        .store
        .list_github_pull_requests(&Scope::local(), Some(&repository))
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, PullRequestState::Closed);
}

#[tokio::test]
async fn jobs_replace_wholesale_and_rollup_tracks_failures() {
    let h = harness().await;
    let (_directory, repository) = seed_project(&h, "feature/x").await;

    h.github
        .set_open_pr("acme", "h", "feature/x", remote_pr(12, "feature/x", "sha-12"))
        .await;
    h.github
        .set_jobs("sha-12", vec![job("1", "in_progress", None)])
        .await;

    let sync = Arc::new(GitHubSync::new(
        Arc::clone(&h.dispatcher),
        Arc::clone(&h.github) as Arc<dyn conductor::github::GitHubApi>,
    ));
    sync.poll().await;

    // Next tick: the job finished red.
    h.github
        .set_jobs("sha-12", vec![job("1", "completed", Some("failure"))])
        .await;
    sync.poll().await;

    let pr = h
        .store
        .find_open_pr_for_branch(&Scope::local(), &repository, "feature/x")
        .await
        .expect("query")
        .expect("PR recorded");
    assert_eq!(pr.ci_rollup, conductor::core::CiRollup::Failure);

    let jobs = h.store.list_github_pr_jobs(&pr.id).await.expect("jobs");
    assert_eq!(jobs.len(), 1, "jobs replaced, not appended");
    assert_eq!(jobs[0].conclusion.as_deref(), Some("failure"));
}

#[tokio::test]
async fn my_prs_url_uses_the_viewer_login() {
    let h = harness().await;
    let repository = h
        .seed_repository("h", "https://github.com/acme/h.git")
        .await;
    h.github.set_viewer("octocat").await;

    let response = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "github.repo-my-prs-url",
                "id": repository,
            }),
        )
        .await
        .expect("my-prs-url");

    let url = response["url"].as_str().expect("url");
    assert!(url.starts_with("https://github.com/acme/h/pulls?q="));
    assert!(url.contains("octocat"));
}

#[tokio::test]
async fn project_pr_reads_the_reconciled_record() {
    let h = harness().await;
    let (directory, _repository) = seed_project(&h, "feature/x").await;

    h.github
        .set_open_pr("acme", "h", "feature/x", remote_pr(12, "feature/x", "sha-12"))
        .await;
    let sync = Arc::new(GitHubSync::new(
        Arc::clone(&h.dispatcher),
        Arc::clone(&h.github) as Arc<dyn conductor::github::GitHubApi>,
    ));
    sync.poll().await;

    let response = h
        .dispatch(
            "connection-a",
            serde_json::json!({
                "type": "github.project-pr",
                "directoryId": directory,
            }),
        )
        .await
        .expect("project-pr");

    assert_eq!(response["branch"], serde_json::json!("feature/x"));
    assert_eq!(response["pr"]["number"], serde_json::json!(12));
}
