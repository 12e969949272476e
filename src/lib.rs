//! Conductor: multi-tenant control plane for interactive coding-agent
//! sessions.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// Protocol shapes and the unix-socket server shell.
pub mod api;
/// Daemon configuration loading.
pub mod config;
/// Domain records, enums, events, and the error taxonomy.
pub mod core;
/// The command dispatcher and its in-memory state.
pub mod dispatcher;
/// Git status cache and probe.
pub mod gitstatus;
/// GitHub grammar, REST client, and sync loop.
pub mod github;
/// The observed-event journal and subscription filters.
pub mod journal;
/// Linear issue import.
pub mod linear;
/// The task scheduler and project availability gates.
pub mod scheduler;
/// Live-session registry and PTY handles.
pub mod sessions;
/// Transactional SQLite persistence.
pub mod store;
/// Shared utilities (ids, paths, PATH probing).
pub mod utils;
