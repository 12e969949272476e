//! Shared test scaffolding: an in-memory store, a dispatcher wired with
//! mocks, and JSON-level dispatch helpers.

#![allow(dead_code)]

use std::sync::Arc;

use conductor::api::protocol::{Command, Envelope};
use conductor::config::Config;
use conductor::core::{ControlError, Scope};
use conductor::dispatcher::{Dispatcher, MockSessionLauncher};
use conductor::github::MockGitHubApi;
use conductor::gitstatus::GitStatusEntry;
use conductor::linear::MockLinearApi;
use conductor::store::SqliteStore;
use tokio::sync::mpsc;

/// A dispatcher with every external collaborator mocked.
pub struct TestHarness {
    pub store: Arc<SqliteStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub launcher: Arc<MockSessionLauncher>,
    pub github: Arc<MockGitHubApi>,
    pub linear: Arc<MockLinearApi>,
}

/// Fresh in-memory store.
pub async fn test_store() -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::open_in_memory()
            .await
            .expect("open in-memory store"),
    )
}

/// Config with both integrations enabled and tight poll intervals.
pub fn test_config() -> Config {
    Config::default()
}

/// Build a harness around a fresh store.
pub async fn harness() -> TestHarness {
    let store = test_store().await;
    let launcher = Arc::new(MockSessionLauncher::new());
    let github = Arc::new(MockGitHubApi::new());
    let linear = Arc::new(MockLinearApi::new());

    let dispatcher = Dispatcher::builder(Arc::clone(&store), test_config())
        .github(Arc::clone(&github) as _)
        .linear(Arc::clone(&linear) as _)
        .launcher(Arc::clone(&launcher) as _)
        .build();

    TestHarness {
        store,
        dispatcher,
        launcher,
        github,
        linear,
    }
}

impl TestHarness {
    /// Register a connection and return its outbound channel.
    pub async fn connect(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.dispatcher.register_connection(connection_id, tx).await;
        rx
    }

    /// Dispatch a JSON command frame, returning the plain response
    /// record.
    pub async fn dispatch(
        &self,
        connection_id: &str,
        frame: serde_json::Value,
    ) -> Result<serde_json::Value, ControlError> {
        let command = Command::parse(frame)?;
        let response = self.dispatcher.dispatch(connection_id, command).await?;
        Ok(serde_json::to_value(&response).expect("serialize response"))
    }

    /// Seed the git-status cache for a directory.
    pub async fn set_git_status(
        &self,
        directory_id: &str,
        branch: &str,
        changed_files: u32,
        repository_id: Option<&str>,
    ) {
        self.dispatcher
            .update_git_status(
                directory_id,
                GitStatusEntry {
                    branch: Some(branch.to_owned()),
                    changed_files,
                    repository_id: repository_id.map(str::to_owned),
                    remote_url: None,
                    refreshed_at: chrono::Utc::now(),
                },
            )
            .await;
    }

    /// Create a directory and return its id.
    pub async fn seed_directory(&self, path: &str) -> String {
        let response = self
            .dispatch(
                "connection-seed",
                serde_json::json!({"type": "directory.upsert", "path": path}),
            )
            .await
            .expect("seed directory");
        response["id"].as_str().expect("directory id").to_owned()
    }

    /// Create a repository and return its id.
    pub async fn seed_repository(&self, name: &str, remote_url: &str) -> String {
        let response = self
            .dispatch(
                "connection-seed",
                serde_json::json!({
                    "type": "repository.upsert",
                    "name": name,
                    "remoteUrl": remote_url,
                }),
            )
            .await
            .expect("seed repository");
        response["id"].as_str().expect("repository id").to_owned()
    }

    /// Create a conversation under a directory and return its id.
    pub async fn seed_conversation(&self, directory_id: &str, title: &str) -> String {
        let response = self
            .dispatch(
                "connection-seed",
                serde_json::json!({
                    "type": "conversation.create",
                    "directoryId": directory_id,
                    "title": title,
                    "agent": "claude",
                }),
            )
            .await
            .expect("seed conversation");
        response["id"].as_str().expect("conversation id").to_owned()
    }
}

/// The default local scope.
pub fn local_scope() -> Scope {
    Scope::local()
}

/// Drain currently queued envelopes without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(serde_json::to_value(&envelope).expect("serialize envelope"));
    }
    out
}

/// Wait until the pump has drained pending signals.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}
