//! Binder configuration with layered sources.
//!
//! Values are resolved in priority order:
//!
//! 1. **Compiled defaults** — [`Config::default()`]
//! 2. **JSON file** — fields present in the file override defaults
//! 3. **Environment** — `JUNCTION_*` variables override everything
//!
//! The file is plain JSON with the field names below; absent fields keep
//! their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for this schema.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything the binder needs to start.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// TCP port of the HTTP/WebSocket front-end.
    pub port: u16,
    /// Bind address of the front-end.
    pub bind: String,
    /// Worker slots of the job engine.
    pub workers: usize,
    /// Budget of jobs allowed to wait in the queue.
    pub pending_jobs: usize,
    /// Per-request processing deadline in seconds (0 = unlimited).
    pub call_timeout: u64,
    /// Strict bound on live sessions.
    pub session_max: usize,
    /// Session inactivity timeout in seconds.
    pub session_timeout: u64,
    /// Token granted to fresh sessions (36 bytes). Generated when absent.
    pub initial_token: Option<String>,
    /// Default verbosity applied to every api at startup.
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 1234,
            bind: "127.0.0.1".to_owned(),
            workers: 3,
            pending_jobs: 64,
            call_timeout: 15,
            session_max: 128,
            session_timeout: 3600,
            initial_token: None,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply `JUNCTION_*` overrides from `lookup` (the process environment
    /// in production, a map in tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn set<T: std::str::FromStr>(slot: &mut T, name: &str, value: Option<String>) {
            if let Some(text) = value {
                match text.parse() {
                    Ok(parsed) => *slot = parsed,
                    Err(_) => warn!(var = name, value = %text, "ignoring unparsable override"),
                }
            }
        }

        set(&mut self.port, "JUNCTION_PORT", lookup("JUNCTION_PORT"));
        set(&mut self.bind, "JUNCTION_BIND", lookup("JUNCTION_BIND"));
        set(&mut self.workers, "JUNCTION_WORKERS", lookup("JUNCTION_WORKERS"));
        set(
            &mut self.pending_jobs,
            "JUNCTION_PENDING_JOBS",
            lookup("JUNCTION_PENDING_JOBS"),
        );
        set(
            &mut self.call_timeout,
            "JUNCTION_CALL_TIMEOUT",
            lookup("JUNCTION_CALL_TIMEOUT"),
        );
        set(
            &mut self.session_max,
            "JUNCTION_SESSION_MAX",
            lookup("JUNCTION_SESSION_MAX"),
        );
        set(
            &mut self.session_timeout,
            "JUNCTION_SESSION_TIMEOUT",
            lookup("JUNCTION_SESSION_TIMEOUT"),
        );
        if let Some(token) = lookup("JUNCTION_INITIAL_TOKEN") {
            self.initial_token = Some(token);
        }
        set(&mut self.verbosity, "JUNCTION_VERBOSITY", lookup("JUNCTION_VERBOSITY"));
    }
}
