//! Client-side worker/broker for JSON analysis servers.
//!
//! An editor host talks to one or more language-analysis JSON servers
//! (completion, lint, documentation, goto, refactor) over a line-delimited
//! JSON protocol. This crate is the piece that sits in between:
//!
//! - **Transport**: CRLF-framed JSON over TCP or Unix stream sockets
//!   ([`transport`]).
//! - **Reactor**: process-wide registry of live transport driver tasks
//!   ([`reactor`]).
//! - **Client**: request/response correlation with per-call callbacks and
//!   deadlines ([`client`]).
//! - **Interpreter**: parsed form of the configured interpreter URI that
//!   decides transport, child process argv and path remapping
//!   ([`interpreter`]).
//! - **Workers**: per-window supervisors pairing a process strategy with a
//!   checker strategy ([`workers`]).
//! - **Market**: the registry and factory through which editor commands
//!   submit calls ([`workers::market`]).
//!
//! The crate is a library; it owns no CLI. The host creates a
//! [`reactor::Reactor`] and a [`workers::market::Market`] at plugin init and
//! tears both down at unload.

pub mod client;
pub mod interpreter;
pub mod logging;
pub mod reactor;
pub mod testing;
pub mod transport;
pub mod vagrant;
pub mod workers;

// Re-export the types an editor host needs for the common path.
pub use client::{AsyncClient, Callback};
pub use interpreter::Interpreter;
pub use reactor::Reactor;
pub use workers::market::{Market, WindowContext};
pub use workers::worker::{Worker, WorkerStatus};
pub use workers::{Diagnostic, Notifier};
