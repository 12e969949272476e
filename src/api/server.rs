//! Unix-socket server shell: owns connections, forwards inbound commands
//! to the dispatcher, and writes outbound envelopes as JSON lines.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::github::client::{RestGitHubClient, resolve_github_token};
use crate::github::sync::GitHubSync;
use crate::linear::GraphqlLinearClient;
use crate::store::SqliteStore;
use crate::utils::ids::prefixed_id;

use super::protocol::{Command, Envelope};

/// Run the daemon: store, dispatcher, pollers, and the accept loop.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the socket cannot
/// be bound.
pub async fn run_daemon(config: Config) -> anyhow::Result<()> {
    tracing::debug!("initializing store");
    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .with_context(|| {
                format!("open database at {}", config.database_path.display())
            })?,
    );

    let mut builder = Dispatcher::builder(Arc::clone(&store), config.clone());

    let github_api = if config.github.enabled {
        match resolve_github_token(config.github.token.as_deref()).await {
            Some(token) => Some(Arc::new(RestGitHubClient::new(token))),
            None => {
                tracing::info!("no github token resolvable, sync loop disabled");
                None
            }
        }
    } else {
        None
    };
    if let Some(ref api) = github_api {
        builder = builder.github(Arc::clone(api) as _);
    }

    if config.linear.enabled {
        if let Ok(key) = std::env::var(&config.linear.api_key_env) {
            if !key.trim().is_empty() {
                builder = builder.linear(Arc::new(GraphqlLinearClient::new(key)));
            }
        }
    }

    let dispatcher = builder.build();

    tokio::spawn(Arc::clone(&dispatcher).run_git_status_poller());

    if let Some(api) = github_api {
        let sync = Arc::new(GitHubSync::new(Arc::clone(&dispatcher), api as _));
        tokio::spawn(sync.start());
    }

    let socket_path = config.socket_path.clone();
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // A stale socket from a dead daemon blocks the bind.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind socket at {}", socket_path.display()))?;
    tracing::info!(socket = %socket_path.display(), "daemon listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let connection_id = prefixed_id("connection");
            if let Err(err) = handle_connection(dispatcher.clone(), stream, &connection_id).await {
                tracing::debug!(connection_id = %connection_id, error = %err, "connection ended");
            }
            dispatcher.disconnect(&connection_id).await;
        });
    }
}

/// Serve one connection: a reader loop for inbound frames and a writer
/// task draining the outbound channel.
async fn handle_connection(
    dispatcher: Arc<Dispatcher>,
    stream: UnixStream,
    connection_id: &str,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    dispatcher
        .register_connection(connection_id, outbound_tx)
        .await;

    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            if writer.write_all(json.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        handle_frame(&dispatcher, connection_id, &line).await;
    }

    writer_task.abort();
    Ok(())
}

/// Parse and execute one inbound frame, pushing the response envelope.
async fn handle_frame(dispatcher: &Arc<Dispatcher>, connection_id: &str, line: &str) {
    let mut value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            push_envelope(
                dispatcher,
                connection_id,
                Envelope::CommandError {
                    request_id: None,
                    code: "validation".to_owned(),
                    message: format!("invalid frame: {err}"),
                },
            )
            .await;
            return;
        }
    };

    let request_id = value
        .as_object_mut()
        .and_then(|object| object.remove("requestId"));

    let command = match Command::parse(value) {
        Ok(command) => command,
        Err(err) => {
            push_envelope(
                dispatcher,
                connection_id,
                Envelope::CommandError {
                    request_id,
                    code: err.code().to_owned(),
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let envelope = match dispatcher.dispatch(connection_id, command).await {
        Ok(response) => match serde_json::to_value(&response) {
            Ok(result) => Envelope::CommandResponse { request_id, result },
            Err(err) => Envelope::CommandError {
                request_id,
                code: "internal".to_owned(),
                message: format!("serialize response: {err}"),
            },
        },
        Err(err) => Envelope::CommandError {
            request_id,
            code: err.code().to_owned(),
            message: err.to_string(),
        },
    };

    push_envelope(dispatcher, connection_id, envelope).await;
}

async fn push_envelope(dispatcher: &Arc<Dispatcher>, connection_id: &str, envelope: Envelope) {
    dispatcher.send_envelope(connection_id, envelope).await;
}

/// Ping a running daemon over its socket.
///
/// # Errors
///
/// Returns an error when the daemon is unreachable or answers garbage.
pub async fn ping(config: &Config) -> anyhow::Result<String> {
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .with_context(|| format!("connect to {}", config.socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    writer
        .write_all(b"{\"type\":\"directory.list\"}\n")
        .await?;

    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await?
        .context("daemon closed the connection without answering")?;
    Ok(line)
}
