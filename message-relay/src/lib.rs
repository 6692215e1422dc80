//! Concurrent TCP message relay.
//!
//! A relay accepts TCP connections, serves each one on its own task, and
//! appends every received line to a shared message log before acknowledging
//! it. Connection lifecycle events go to a separate activity log.
//!
//! - [`config`] resolves the server configuration against built-in defaults
//!   and loads the client configuration.
//! - [`sink`] owns the two append-only log files, one lock per file.
//! - [`handler`] runs a single connection: newline framing, record, reply.
//! - [`relay`] binds the listener, dispatches handlers under a concurrency
//!   ceiling, and drains them on stop.
//! - [`client`] is the peer side: connect, send a line, wait for the reply.
//! - [`collab`] holds the alerting and peer classification seams.
//! - [`cli`] parses the command line for server and client modes.
//!
//! Wire protocol: UTF-8 lines terminated by `\n`. Each non-blank line `text`
//! is answered with `Message received: text`.

pub mod cli;
pub mod client;
pub mod collab;
pub mod config;
pub mod handler;
pub mod relay;
pub mod sink;
