//! Live PTY handles backing sessions.
//!
//! The dispatcher only sees the [`LiveSession`] trait: attach/detach with
//! per-attachment replay cursors, writes, snapshots, and buffer tails. The
//! production implementation spawns the agent under a PTY and mirrors
//! output through a vt100 screen; tests use [`MockLiveSession`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::{ControlError, ControlResult, ExitStatus};
use crate::utils::ids::prefixed_id;

/// Channel buffer size for write requests.
const WRITE_CHANNEL_SIZE: usize = 256;

/// Buffer size for PTY reads.
const READ_BUFFER_SIZE: usize = 4096;

/// Default terminal geometry for spawned sessions.
const DEFAULT_ROWS: u16 = 24;
/// Default terminal width for spawned sessions.
const DEFAULT_COLS: u16 = 80;

/// One chunk of PTY output with its per-session cursor.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Strictly monotone per-session cursor.
    pub cursor: u64,

    /// Raw bytes.
    pub bytes: Vec<u8>,
}

/// Callbacks invoked by a live session for one attachment.
pub struct AttachHandlers {
    /// Called for every output chunk (including replayed ones).
    pub on_data: Box<dyn Fn(OutputChunk) + Send + Sync>,

    /// Called once when the underlying process exits.
    pub on_exit: Box<dyn Fn(ExitStatus) + Send + Sync>,
}

impl std::fmt::Debug for AttachHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachHandlers").finish_non_exhaustive()
    }
}

/// An opaque rendered terminal frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFrame {
    /// Terminal height in rows.
    pub rows: u16,

    /// Terminal width in columns.
    pub cols: u16,

    /// Visible lines, top to bottom.
    pub lines: Vec<String>,

    /// Cursor row.
    pub cursor_row: u16,

    /// Cursor column.
    pub cursor_col: u16,

    /// When the frame was captured.
    pub captured_at: DateTime<Utc>,
}

impl SnapshotFrame {
    /// The last `n` visible lines of the frame.
    ///
    /// `start_row = max(0, total_rows - min(lines_available, n))`.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let total = self.lines.len();
        let take = total.min(n);
        let start = total - take;
        self.lines[start..].to_vec()
    }
}

/// A live PTY-backed session handle.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Register handlers and replay chunks with `cursor > since_cursor`.
    ///
    /// Returns the attachment id.
    ///
    /// # Errors
    ///
    /// Fails when the session has already been closed.
    async fn attach(
        &self,
        handlers: AttachHandlers,
        since_cursor: Option<u64>,
    ) -> ControlResult<String>;

    /// Remove an attachment. Unknown ids are ignored.
    async fn detach(&self, attachment_id: &str);

    /// Write raw bytes to the PTY.
    ///
    /// # Errors
    ///
    /// Fails when the PTY writer has gone away.
    async fn write_bytes(&self, bytes: &[u8]) -> ControlResult<()>;

    /// Write UTF-8 text to the PTY.
    ///
    /// # Errors
    ///
    /// Fails when the PTY writer has gone away.
    async fn write_text(&self, text: &str) -> ControlResult<()> {
        self.write_bytes(text.as_bytes()).await
    }

    /// Capture the current terminal frame.
    ///
    /// # Errors
    ///
    /// Fails when the session has already been closed.
    async fn snapshot(&self) -> ControlResult<SnapshotFrame>;

    /// The last `tail_lines` visible rows, when the implementation keeps a
    /// buffer; `None` defers tail derivation to the snapshot frame.
    async fn buffer_tail(&self, tail_lines: Option<usize>) -> Option<Vec<String>>;

    /// The cursor of the most recent output chunk (0 before any output).
    async fn latest_cursor(&self) -> u64;

    /// OS process id of the spawned agent, when known.
    async fn process_id(&self) -> Option<u32>;

    /// Tear the session down: stop IO tasks and drop all attachments.
    async fn close(&self);
}

struct PtyInner {
    parser: vt100::Parser,
    chunks: Vec<OutputChunk>,
    cursor: u64,
    attachments: HashMap<String, AttachHandlers>,
    exit: Option<ExitStatus>,
    closed: bool,
}

/// Production [`LiveSession`] spawning the agent command under a PTY.
pub struct PtyLiveSession {
    inner: Arc<Mutex<PtyInner>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl PtyLiveSession {
    /// Spawn `argv` under a fresh PTY, optionally in `cwd`.
    ///
    /// # Errors
    ///
    /// Fails when the PTY cannot be opened or the command cannot be
    /// spawned.
    pub fn spawn(argv: &[String], cwd: Option<&str>) -> ControlResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ControlError::validation("expected non-empty command"))?;

        let (pty, pts) = pty_process::open()
            .map_err(|e| ControlError::internal(format!("open pty: {e}")))?;

        let mut cmd = pty_process::Command::new(program).args(args);
        if let Some(dir) = cwd {
            cmd = cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn(pts)
            .map_err(|e| ControlError::internal(format!("spawn '{program}': {e}")))?;
        let pid = child.id();

        let (pty_reader, mut pty_writer) = pty.into_split();
        let _ = pty_writer.resize(pty_process::Size::new(DEFAULT_ROWS, DEFAULT_COLS));
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let inner = Arc::new(Mutex::new(PtyInner {
            parser: vt100::Parser::new(DEFAULT_ROWS, DEFAULT_COLS, 0),
            chunks: Vec::new(),
            cursor: 0,
            attachments: HashMap::new(),
            exit: None,
            closed: false,
        }));

        {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Self::reader_loop(pty_reader, Arc::clone(&inner), cancel).await;
                let exit = match child.wait().await {
                    Ok(status) => ExitStatus {
                        code: status.code(),
                        signal: unix_signal_name(&status),
                    },
                    Err(_) => ExitStatus {
                        code: None,
                        signal: None,
                    },
                };
                Self::deliver_exit(&inner, exit).await;
            });
        }

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Self::writer_loop(pty_writer, write_rx, cancel).await;
            });
        }

        Ok(Self {
            inner,
            write_tx,
            cancel,
            pid,
        })
    }

    async fn reader_loop(
        mut reader: pty_process::OwnedReadPty,
        inner: Arc<Mutex<PtyInner>>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut state = inner.lock().await;
                            state.cursor += 1;
                            state.parser.process(&buf[..n]);
                            let chunk = OutputChunk {
                                cursor: state.cursor,
                                bytes: buf[..n].to_vec(),
                            };
                            state.chunks.push(chunk.clone());
                            for handlers in state.attachments.values() {
                                (handlers.on_data)(chunk.clone());
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "PTY read error");
                            break;
                        }
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    async fn writer_loop(
        mut writer: pty_process::OwnedWritePty,
        mut write_rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                data = write_rx.recv() => {
                    match data {
                        Some(bytes) => {
                            if writer.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    async fn deliver_exit(inner: &Arc<Mutex<PtyInner>>, exit: ExitStatus) {
        let mut state = inner.lock().await;
        state.exit = Some(exit.clone());
        for handlers in state.attachments.values() {
            (handlers.on_exit)(exit.clone());
        }
    }
}

#[async_trait]
impl LiveSession for PtyLiveSession {
    async fn attach(
        &self,
        handlers: AttachHandlers,
        since_cursor: Option<u64>,
    ) -> ControlResult<String> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(ControlError::not_found("session"));
        }

        let since = since_cursor.unwrap_or(0);
        for chunk in state.chunks.iter().filter(|c| c.cursor > since) {
            (handlers.on_data)(chunk.clone());
        }

        let attachment_id = prefixed_id("attachment");
        state.attachments.insert(attachment_id.clone(), handlers);
        Ok(attachment_id)
    }

    async fn detach(&self, attachment_id: &str) {
        self.inner.lock().await.attachments.remove(attachment_id);
    }

    async fn write_bytes(&self, bytes: &[u8]) -> ControlResult<()> {
        self.write_tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| ControlError::internal("pty write channel closed"))
    }

    async fn snapshot(&self) -> ControlResult<SnapshotFrame> {
        let state = self.inner.lock().await;
        if state.closed {
            return Err(ControlError::not_found("session"));
        }

        let screen = state.parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_row, cursor_col) = screen.cursor_position();
        let lines: Vec<String> = (0..rows)
            .map(|row| {
                let mut line = String::with_capacity(cols as usize);
                for col in 0..cols {
                    match screen.cell(row, col) {
                        Some(cell) if !cell.contents().is_empty() => {
                            line.push_str(&cell.contents());
                        }
                        _ => line.push(' '),
                    }
                }
                line.trim_end().to_owned()
            })
            .collect();

        Ok(SnapshotFrame {
            rows,
            cols,
            lines,
            cursor_row,
            cursor_col,
            captured_at: Utc::now(),
        })
    }

    async fn buffer_tail(&self, tail_lines: Option<usize>) -> Option<Vec<String>> {
        let frame = self.snapshot().await.ok()?;
        Some(frame.tail(tail_lines.unwrap_or(frame.lines.len())))
    }

    async fn latest_cursor(&self) -> u64 {
        self.inner.lock().await.cursor
    }

    async fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut state = self.inner.lock().await;
        state.attachments.clear();
        state.closed = true;
    }
}

#[cfg(unix)]
fn unix_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| format!("signal-{sig}"))
}

#[cfg(not(unix))]
fn unix_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

impl std::fmt::Debug for PtyLiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyLiveSession")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Scripted [`LiveSession`] for tests: output is pushed by the test, and
/// writes are recorded for assertion.
#[derive(Default)]
pub struct MockLiveSession {
    inner: Mutex<MockInner>,
}

impl std::fmt::Debug for MockLiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLiveSession").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct MockInner {
    chunks: Vec<OutputChunk>,
    cursor: u64,
    attachments: HashMap<String, AttachHandlers>,
    writes: Vec<Vec<u8>>,
    frame: Option<SnapshotFrame>,
    closed: bool,
}

impl MockLiveSession {
    /// A fresh mock with no output and a blank frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of output to all attachments, advancing the cursor.
    pub async fn push_output(&self, bytes: &[u8]) -> u64 {
        let mut state = self.inner.lock().await;
        state.cursor += 1;
        let chunk = OutputChunk {
            cursor: state.cursor,
            bytes: bytes.to_vec(),
        };
        state.chunks.push(chunk.clone());
        for handlers in state.attachments.values() {
            (handlers.on_data)(chunk.clone());
        }
        state.cursor
    }

    /// Deliver a process exit to all attachments.
    pub async fn push_exit(&self, exit: ExitStatus) {
        let state = self.inner.lock().await;
        for handlers in state.attachments.values() {
            (handlers.on_exit)(exit.clone());
        }
    }

    /// Set the frame returned by `snapshot`.
    pub async fn set_frame(&self, frame: SnapshotFrame) {
        self.inner.lock().await.frame = Some(frame);
    }

    /// Bytes written so far, in order.
    pub async fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().await.writes.clone()
    }

    /// Number of live attachments.
    pub async fn attachment_count(&self) -> usize {
        self.inner.lock().await.attachments.len()
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[async_trait]
impl LiveSession for MockLiveSession {
    async fn attach(
        &self,
        handlers: AttachHandlers,
        since_cursor: Option<u64>,
    ) -> ControlResult<String> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(ControlError::not_found("session"));
        }

        let since = since_cursor.unwrap_or(0);
        for chunk in state.chunks.iter().filter(|c| c.cursor > since) {
            (handlers.on_data)(chunk.clone());
        }

        let attachment_id = prefixed_id("attachment");
        state.attachments.insert(attachment_id.clone(), handlers);
        Ok(attachment_id)
    }

    async fn detach(&self, attachment_id: &str) {
        self.inner.lock().await.attachments.remove(attachment_id);
    }

    async fn write_bytes(&self, bytes: &[u8]) -> ControlResult<()> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(ControlError::internal("pty write channel closed"));
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }

    async fn snapshot(&self) -> ControlResult<SnapshotFrame> {
        let state = self.inner.lock().await;
        if state.closed {
            return Err(ControlError::not_found("session"));
        }
        Ok(state.frame.clone().unwrap_or(SnapshotFrame {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            lines: vec![String::new(); DEFAULT_ROWS as usize],
            cursor_row: 0,
            cursor_col: 0,
            captured_at: Utc::now(),
        }))
    }

    async fn buffer_tail(&self, tail_lines: Option<usize>) -> Option<Vec<String>> {
        let frame = self.snapshot().await.ok()?;
        Some(frame.tail(tail_lines.unwrap_or(frame.lines.len())))
    }

    async fn latest_cursor(&self) -> u64 {
        self.inner.lock().await.cursor
    }

    async fn process_id(&self) -> Option<u32> {
        None
    }

    async fn close(&self) {
        let mut state = self.inner.lock().await;
        state.attachments.clear();
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(lines: &[&str]) -> SnapshotFrame {
        SnapshotFrame {
            rows: lines.len() as u16,
            cols: 80,
            lines: lines.iter().map(|s| (*s).to_owned()).collect(),
            cursor_row: 0,
            cursor_col: 0,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn tail_takes_the_last_lines() {
        let frame = frame(&["a", "b", "c", "d"]);
        assert_eq!(frame.tail(2), vec!["c".to_owned(), "d".to_owned()]);
        assert_eq!(frame.tail(10).len(), 4);
    }

    #[tokio::test]
    async fn mock_replays_from_cursor() {
        let session = MockLiveSession::new();
        session.push_output(b"one").await;
        session.push_output(b"two").await;
        session.push_output(b"three").await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handlers = AttachHandlers {
            on_data: Box::new(move |chunk| {
                let _ = tx.send(chunk.cursor);
            }),
            on_exit: Box::new(|_| {}),
        };

        session.attach(handlers, Some(1)).await.unwrap();

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(session.latest_cursor().await, 3);
    }
}
