//! HTTP/WebSocket front-end for the binder.
//!
//! - [`server`] — the [`Binder`] context and its axum router.
//! - [`ws`] — the WebSocket route: binary frames or the JSON envelope,
//!   negotiated by subprotocol.
//! - [`json1`] — the JSON envelope codec.
//! - [`config`] — layered configuration (defaults ← file ← env).
//! - [`metrics`] — Prometheus recorder and metric names.

pub mod config;
pub mod json1;
pub mod metrics;
pub mod server;
pub mod ws;

pub use config::{Config, ConfigError};
pub use server::{AppState, Binder, ServerError};
pub use ws::{SUBPROTOCOL_BINARY, SUBPROTOCOL_JSON1};
