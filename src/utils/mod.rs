/// Prefixed-UUID identifier generation.
pub mod ids;

/// Data and socket path resolution.
pub mod paths;

/// PATH probing for agent CLI binaries.
pub mod tools;
