//! The pearsync daemon: one long-lived process per user holding open
//! sync engines, commanded over newline-delimited JSON on a Unix socket.
//!
//! The CLI front-end (`pearsync` binary) talks to it for `watch`,
//! `unwatch`, `status`, `list` and `shutdown`; `--foreground` mode skips
//! the daemon entirely and runs an engine in-process.

pub mod daemon;
pub mod ipc;

pub use daemon::{Daemon, TransportFactory};
pub use ipc::{request, Request, Response, WorkspaceReport};
