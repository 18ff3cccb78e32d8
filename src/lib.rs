//! An async SCPI-style instrument command server.
//!
//! The engine (tree, sessions, dispatch, pub/sub) is transport-agnostic: it
//! consumes a `(read_line, write_bytes)` pair per session and
//! never opens a socket itself. [`transport`] provides the reference
//! plain-TCP listener; [`bin/scpid.rs`](../src/bin/scpid.rs) wires it to
//! [`config`] and [`builtin`] into a runnable server.

pub mod access;
pub mod builtin;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod leaf;
pub mod macros;
pub mod node;
pub mod param;
pub mod pubsub;
pub mod reply;
pub mod session;
pub mod transport;

pub use crate::access::Access;
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::session::{Session, SessionKind};
