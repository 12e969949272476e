/// Command, response, and envelope shapes.
pub mod protocol;

/// Unix-socket server shell.
pub mod server;
