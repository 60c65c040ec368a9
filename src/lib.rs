//! syncwatchd: a file-watcher daemon for a remote sync control plane.
//!
//! The server tells the daemon which project directories to watch (over a
//! periodic HTTP poll and a push WebSocket); the daemon watches them
//! recursively, debounces and batches the resulting change events, and
//! delivers them either by invoking an external sync command or by POSTing
//! compressed JSON chunks back to the server.
//!
//! Every mutable collection in the core is owned by exactly one task and fed
//! through a message channel; the modules here are largely one task each.

pub mod backoff;
pub mod batch;
pub mod cli;
pub mod debugdump;
pub mod error;
pub mod filter;
pub mod models;
pub mod paths;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod synccmd;
pub mod watch;
