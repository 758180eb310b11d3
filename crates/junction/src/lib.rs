//! The binder's unified crate: built-in bindings and the binaries.
//!
//! `junctiond` hosts the apis over HTTP/WebSocket; `junction-call` is the
//! matching command-line client speaking the binary protocol.

pub mod bindings;
