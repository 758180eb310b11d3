//! Built-in bindings compiled into the daemon.

pub mod hello;
