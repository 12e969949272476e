//! The command dispatcher: single owner of all in-memory state.
//!
//! Every client command funnels through [`Dispatcher::dispatch`], which
//! executes it against the store, mutates the session registry, journal,
//! and git-status cache under one lock, and publishes observed events to
//! matching subscriptions. Background pollers reach these maps only
//! through dispatcher methods.

mod conversations;
mod directories;
mod github;
mod repositories;
mod sessions;
mod streams;
mod tasks;

pub use sessions::{MockSessionLauncher, PtySessionLauncher, SessionLauncher};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::api::protocol::{Command, Envelope, Response};
use crate::config::Config;
use crate::core::{ControlError, ControlResult, Conversation, EventScope, ObservedEvent};
use crate::gitstatus::{self, GitStatusCache, GitStatusEntry};
use crate::github::client::GitHubApi;
use crate::journal::{JournalEntry, ObservedFilter, ObservedJournal, matches_observed_filter};
use crate::linear::LinearApi;
use crate::sessions::live::OutputChunk;
use crate::sessions::{ConnectionId, SessionRegistry};
use crate::store::SqliteStore;

/// External title derivation (LLM-backed in production).
#[async_trait]
pub trait TitleProvider: Send + Sync {
    /// Derive a fresh title for a conversation, or `None` to leave it
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Fails when the external provider fails.
    async fn derive_title(&self, conversation: &Conversation) -> ControlResult<Option<String>>;
}

/// Title provider that never changes anything (the disabled default).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTitleProvider;

#[async_trait]
impl TitleProvider for NoopTitleProvider {
    async fn derive_title(&self, _conversation: &Conversation) -> ControlResult<Option<String>> {
        Ok(None)
    }
}

/// One registered stream subscription.
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    /// Subscription id.
    pub id: String,

    /// Owning connection.
    pub connection_id: ConnectionId,

    /// Conjunctive filter.
    pub filter: ObservedFilter,
}

/// Signals from PTY attachment callbacks into the dispatcher's pump.
#[derive(Debug)]
pub(crate) enum SessionSignal {
    /// An output chunk arrived.
    Output {
        /// Session id.
        session_id: String,
        /// Connection the attachment belongs to; `None` for the internal
        /// journal observer.
        connection_id: Option<ConnectionId>,
        /// The chunk.
        chunk: OutputChunk,
    },

    /// The session process exited.
    Exit {
        /// Session id.
        session_id: String,
        /// Exit details.
        exit: crate::core::ExitStatus,
    },
}

/// All in-memory state, owned by the dispatcher behind one lock.
pub(crate) struct DispatchState {
    pub(crate) journal: ObservedJournal,
    pub(crate) subscriptions: HashMap<String, StreamSubscription>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) git_status: GitStatusCache,
    pub(crate) connections: HashMap<ConnectionId, mpsc::UnboundedSender<Envelope>>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            journal: ObservedJournal::new(),
            subscriptions: HashMap::new(),
            sessions: SessionRegistry::new(),
            git_status: GitStatusCache::new(),
            connections: HashMap::new(),
        }
    }

    /// Append to the journal and fan the entry out to matching
    /// subscriptions.
    pub(crate) fn publish(&mut self, scope: EventScope, event: ObservedEvent) {
        let entry: JournalEntry = self.journal.publish(scope, event).clone();

        for subscription in self.subscriptions.values() {
            if !matches_observed_filter(&subscription.filter, &entry) {
                continue;
            }
            if let Some(sender) = self.connections.get(&subscription.connection_id) {
                let _ = sender.send(Envelope::StreamEvent {
                    subscription_id: subscription.id.clone(),
                    cursor: entry.cursor,
                    event: entry.event.clone(),
                });
            }
        }
    }

    /// Push an envelope to one connection, ignoring closed senders.
    pub(crate) fn send_to(&self, connection_id: &str, envelope: Envelope) {
        if let Some(sender) = self.connections.get(connection_id) {
            let _ = sender.send(envelope);
        }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    store: Arc<SqliteStore>,
    config: Config,
    github: Option<Arc<dyn GitHubApi>>,
    linear: Option<Arc<dyn LinearApi>>,
    title_provider: Arc<dyn TitleProvider>,
    launcher: Arc<dyn SessionLauncher>,
}

impl DispatcherBuilder {
    /// Override the GitHub API client.
    #[must_use]
    pub fn github(mut self, api: Arc<dyn GitHubApi>) -> Self {
        self.github = Some(api);
        self
    }

    /// Override the Linear API client.
    #[must_use]
    pub fn linear(mut self, api: Arc<dyn LinearApi>) -> Self {
        self.linear = Some(api);
        self
    }

    /// Override the title provider.
    #[must_use]
    pub fn title_provider(mut self, provider: Arc<dyn TitleProvider>) -> Self {
        self.title_provider = provider;
        self
    }

    /// Override the session launcher.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn SessionLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Build the dispatcher and start its signal pump.
    #[must_use]
    pub fn build(self) -> Arc<Dispatcher> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Dispatcher {
            store: self.store,
            config: self.config,
            github: self.github,
            linear: self.linear,
            title_provider: self.title_provider,
            launcher: self.launcher,
            state: Arc::new(Mutex::new(DispatchState::new())),
            signal_tx,
        });

        tokio::spawn(Dispatcher::run_signal_pump(
            Arc::clone(&dispatcher),
            signal_rx,
        ));

        dispatcher
    }
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder").finish_non_exhaustive()
    }
}

/// The command dispatcher.
pub struct Dispatcher {
    store: Arc<SqliteStore>,
    config: Config,
    github: Option<Arc<dyn GitHubApi>>,
    linear: Option<Arc<dyn LinearApi>>,
    title_provider: Arc<dyn TitleProvider>,
    launcher: Arc<dyn SessionLauncher>,
    state: Arc<Mutex<DispatchState>>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Start building a dispatcher.
    #[must_use]
    pub fn builder(store: Arc<SqliteStore>, config: Config) -> DispatcherBuilder {
        DispatcherBuilder {
            store,
            config,
            github: None,
            linear: None,
            title_provider: Arc::new(NoopTitleProvider),
            launcher: Arc::new(PtySessionLauncher),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The daemon configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a connection's outbound channel.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        sender: mpsc::UnboundedSender<Envelope>,
    ) {
        self.state
            .lock()
            .await
            .connections
            .insert(connection_id.to_owned(), sender);
    }

    /// Tear down everything a connection owned: subscriptions, output
    /// attachments, and event subscriptions. The session controller, if
    /// held, stays claimed (takeover is the recovery path).
    pub async fn disconnect(&self, connection_id: &str) {
        let mut state = self.state.lock().await;

        state.connections.remove(connection_id);
        state
            .subscriptions
            .retain(|_, sub| sub.connection_id != connection_id);

        let mut detachments = Vec::new();
        for session in state.sessions.iter_mut() {
            session.subscribers.remove(connection_id);
            if let Some(attachment_id) = session.attachments.remove(connection_id) {
                if let Some(live) = session.live.clone() {
                    detachments.push((live, attachment_id));
                }
            }
        }

        for (live, attachment_id) in detachments {
            live.detach(&attachment_id).await;
        }
    }

    /// Execute one command for one connection.
    ///
    /// # Errors
    ///
    /// Surfaces the structured failure for the command.
    pub async fn dispatch(
        &self,
        connection_id: &str,
        command: Command,
    ) -> ControlResult<Response> {
        match command {
            Command::DirectoryUpsert(params) => self.directory_upsert(params).await,
            Command::DirectoryList(params) => self.directory_list(params).await,
            Command::DirectoryArchive(params) => self.directory_archive(params).await,
            Command::DirectoryGitStatus(params) => self.directory_git_status(params).await,
            Command::ProjectSettingsGet(params) => self.project_settings_get(params).await,
            Command::ProjectSettingsUpdate(params) => self.project_settings_update(params).await,
            Command::AutomationPolicyGet(params) => self.automation_policy_get(params).await,
            Command::AutomationPolicySet(params) => self.automation_policy_set(params).await,
            Command::ConversationCreate(params) => self.conversation_create(params).await,
            Command::ConversationList(params) => self.conversation_list(params).await,
            Command::ConversationUpdate(params) => self.conversation_update(params).await,
            Command::ConversationArchive(params) => self.conversation_archive(params).await,
            Command::ConversationDelete(params) => self.conversation_delete(params).await,
            Command::ConversationTitleRefresh(params) => {
                self.conversation_title_refresh(params).await
            }
            Command::RepositoryUpsert(params) => self.repository_upsert(params).await,
            Command::RepositoryGet(params) => self.repository_get(params).await,
            Command::RepositoryList(params) => self.repository_list(params).await,
            Command::RepositoryUpdate(params) => self.repository_update(params).await,
            Command::RepositoryArchive(params) => self.repository_archive(params).await,
            Command::TaskCreate(params) => self.task_create(params).await,
            Command::TaskGet(params) => self.task_get(params).await,
            Command::TaskList(params) => self.task_list(params).await,
            Command::TaskUpdate(params) => self.task_update(params).await,
            Command::TaskDelete(params) => self.task_delete(params).await,
            Command::TaskClaim(params) => self.task_claim(params).await,
            Command::TaskComplete(params) => self.task_complete(params).await,
            Command::TaskReady(params) | Command::TaskQueue(params) => {
                self.task_ready(params).await
            }
            Command::TaskDraft(params) => self.task_draft(params).await,
            Command::TaskReorder(params) => self.task_reorder(params).await,
            Command::TaskPull(params) => self.task_pull(params).await,
            Command::ProjectStatus(params) => self.project_status(params).await,
            Command::StreamSubscribe(params) => self.stream_subscribe(connection_id, params).await,
            Command::StreamUnsubscribe(params) => {
                self.stream_unsubscribe(connection_id, params).await
            }
            Command::SessionList(params) => self.session_list(params).await,
            Command::SessionStatus(params) => self.session_status(params).await,
            Command::SessionSnapshot(params) => self.session_snapshot(params).await,
            Command::SessionClaim(params) => self.session_claim(connection_id, params).await,
            Command::SessionRelease(params) => self.session_release(connection_id, params).await,
            Command::SessionRespond(params) => self.session_respond(connection_id, params).await,
            Command::SessionInterrupt(params) => {
                self.session_interrupt(connection_id, params).await
            }
            Command::SessionRemove(params) | Command::PtyClose(params) => {
                self.session_remove(connection_id, params).await
            }
            Command::PtyStart(params) => self.pty_start(params).await,
            Command::PtyAttach(params) => self.pty_attach(connection_id, params).await,
            Command::PtyDetach(params) => self.pty_detach(connection_id, params).await,
            Command::PtySubscribeEvents(params) => {
                self.pty_subscribe_events(connection_id, params).await
            }
            Command::PtyUnsubscribeEvents(params) => {
                self.pty_unsubscribe_events(connection_id, params).await
            }
            Command::AttentionList(params) => self.attention_list(params).await,
            Command::AgentToolsStatus(params) => self.agent_tools_status(params).await,
            Command::GithubProjectPr(params) => self.github_project_pr(params).await,
            Command::GithubPrList(params) => self.github_pr_list(params).await,
            Command::GithubPrCreate(params) => self.github_pr_create(params).await,
            Command::GithubPrJobsList(params) => self.github_pr_jobs_list(params).await,
            Command::GithubRepoMyPrsUrl(params) => self.github_repo_my_prs_url(params).await,
            Command::LinearIssueImport(params) => self.linear_issue_import(params).await,
            Command::TelemetryRecord(params) => self.telemetry_record(params).await,
            Command::TelemetryList(params) => self.telemetry_list(params).await,
        }
    }

    /// Publish one observed event (used by background loops).
    pub async fn publish_event(&self, scope: EventScope, event: ObservedEvent) {
        self.state.lock().await.publish(scope, event);
    }

    /// Push an envelope to one connection (used by the server shell).
    pub async fn send_envelope(&self, connection_id: &str, envelope: Envelope) {
        self.state.lock().await.send_to(connection_id, envelope);
    }

    /// Snapshot of the git-status cache (used by the sync loop).
    pub async fn git_status_snapshot(&self) -> HashMap<String, GitStatusEntry> {
        self.state.lock().await.git_status.snapshot()
    }

    /// Replace a directory's git-status cache entry.
    pub async fn update_git_status(&self, directory_id: &str, entry: GitStatusEntry) {
        self.state
            .lock()
            .await
            .git_status
            .insert(directory_id.to_owned(), entry);
    }

    /// Refresh the git-status cache for every active directory.
    ///
    /// Per-directory failures are logged and skipped.
    pub async fn refresh_all_git_status(&self) {
        let directories = match self.store.list_all_active_directories().await {
            Ok(directories) => directories,
            Err(err) => {
                tracing::warn!(error = %err, "git status refresh: listing directories failed");
                return;
            }
        };

        for directory in directories {
            if let Err(err) = self.refresh_directory_git_status(&directory).await {
                tracing::debug!(
                    directory_id = %directory.id,
                    error = %err,
                    "git status refresh failed"
                );
            }
        }
    }

    /// Probe one directory and update the cache.
    ///
    /// # Errors
    ///
    /// Fails when the probe fails; the cache keeps its previous entry.
    pub async fn refresh_directory_git_status(
        &self,
        directory: &crate::core::Directory,
    ) -> ControlResult<()> {
        let probe = gitstatus::probe_directory(&directory.path)
            .await
            .map_err(|e| ControlError::internal(format!("git probe: {e}")))?;

        let repository_id = match probe.remote_url.as_deref() {
            Some(url) => self
                .store
                .find_repository_by_remote_url(&directory.scope, url)
                .await?
                .map(|repo| repo.id),
            None => None,
        };

        self.update_git_status(
            &directory.id,
            GitStatusEntry {
                branch: probe.branch,
                changed_files: probe.changed_files,
                repository_id,
                remote_url: probe.remote_url,
                refreshed_at: chrono::Utc::now(),
            },
        )
        .await;

        Ok(())
    }

    /// Probe a directory in the background and prime the cache.
    pub(crate) fn spawn_git_status_refresh(&self, directory: crate::core::Directory) {
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let probe = match gitstatus::probe_directory(&directory.path).await {
                Ok(probe) => probe,
                Err(err) => {
                    tracing::debug!(
                        directory_id = %directory.id,
                        error = %err,
                        "initial git status refresh failed"
                    );
                    return;
                }
            };

            let repository_id = match probe.remote_url.as_deref() {
                Some(url) => store
                    .find_repository_by_remote_url(&directory.scope, url)
                    .await
                    .ok()
                    .flatten()
                    .map(|repo| repo.id),
                None => None,
            };

            state.lock().await.git_status.insert(
                directory.id.clone(),
                GitStatusEntry {
                    branch: probe.branch,
                    changed_files: probe.changed_files,
                    repository_id,
                    remote_url: probe.remote_url,
                    refreshed_at: chrono::Utc::now(),
                },
            );
        });
    }

    /// Run the git-status poller until the process exits.
    pub async fn run_git_status_poller(self: Arc<Self>) {
        let interval =
            std::time::Duration::from_secs(self.config.git_status_poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.refresh_all_git_status().await;
        }
    }

    pub(crate) fn signal_sender(&self) -> mpsc::UnboundedSender<SessionSignal> {
        self.signal_tx.clone()
    }

    pub(crate) async fn state(&self) -> tokio::sync::MutexGuard<'_, DispatchState> {
        self.state.lock().await
    }

    /// Apply PTY callbacks under the state lock, in arrival order.
    async fn run_signal_pump(
        dispatcher: Arc<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<SessionSignal>,
    ) {
        while let Some(signal) = signal_rx.recv().await {
            match signal {
                SessionSignal::Output {
                    session_id,
                    connection_id,
                    chunk,
                } => {
                    dispatcher
                        .handle_output_signal(&session_id, connection_id.as_deref(), chunk)
                        .await;
                }
                SessionSignal::Exit { session_id, exit } => {
                    dispatcher.handle_exit_signal(&session_id, exit).await;
                }
            }
        }
    }
}
