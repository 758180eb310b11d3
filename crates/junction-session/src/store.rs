//! The bounded session table.
//!
//! Sessions are keyed by UUID and shared as `Arc<Session>`. The store's
//! capacity bound is strict: a closed session still counts until every
//! outside reference is gone. Creation at the bound first reaps sessions
//! that are closed or expired and no longer referenced (oldest first);
//! when that frees nothing, creation fails with
//! [`SessionError::Full`](crate::SessionError).
//!
//! Cookie destructors triggered by reaping run after the table lock is
//! released, on the reaping caller's thread.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::session::{Session, SessionError};

/// Store sizing and authentication defaults.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Strict bound on live sessions.
    pub max_count: usize,
    /// Default time-to-live, pushed forward on every access.
    pub ttl: Duration,
    /// Token granted to fresh sessions. Generated when `None`.
    pub initial_token: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            max_count: 128,
            ttl: Duration::hours(1),
            initial_token: None,
        }
    }
}

/// Bounded table of sessions keyed by UUID.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    max_count: usize,
    default_ttl: Duration,
    initial_token: String,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("count", &self.sessions.lock().len())
            .field("max_count", &self.max_count)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl SessionStore {
    /// Build the store. The initial token must have the 36-byte opaque
    /// identifier shape when provided.
    pub fn new(config: StoreConfig) -> Result<SessionStore, SessionError> {
        let initial_token = match config.initial_token {
            Some(token) => {
                if token.len() != 36 {
                    return Err(SessionError::BadInitialToken);
                }
                token
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        info!(max_count = config.max_count, "session store ready");
        Ok(SessionStore {
            sessions: Mutex::new(HashMap::new()),
            max_count: config.max_count.max(1),
            default_ttl: config.ttl,
            initial_token,
        })
    }

    /// The token fresh sessions start with.
    pub fn initial_token(&self) -> &str {
        &self.initial_token
    }

    /// Count of sessions currently in the table.
    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Allocate a session with a fresh UUID.
    ///
    /// `ttl` overrides the store default when given.
    pub fn create(&self, ttl: Option<Duration>) -> Result<Arc<Session>, SessionError> {
        self.create_inner(None, ttl)
    }

    /// Allocate a session under a caller-pinned UUID (36-byte shape).
    ///
    /// When a live session already carries that UUID it is returned
    /// instead, so concurrent attaches converge on one session.
    pub fn create_with(&self, uuid: &str, ttl: Option<Duration>) -> Result<Arc<Session>, SessionError> {
        if uuid.len() != 36 {
            return Err(SessionError::BadUuid);
        }
        self.create_inner(Some(uuid), ttl)
    }

    fn create_inner(
        &self,
        pinned: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Arc<Session>, SessionError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let (session, reaped) = {
            let mut sessions = self.sessions.lock();

            if let Some(uuid) = pinned {
                if let Some(existing) = sessions.get(uuid) {
                    return Ok(Arc::clone(existing));
                }
            }

            let reaped = if sessions.len() >= self.max_count {
                Self::reap_locked(&mut sessions)
            } else {
                Vec::new()
            };
            if sessions.len() >= self.max_count {
                debug!(max_count = self.max_count, "session store full");
                (Err(SessionError::Full), reaped)
            } else {
                // Uniqueness among live sessions: retry on the (vanishing)
                // chance of a v4 collision.
                let mut uuid = match pinned {
                    Some(uuid) => uuid.to_owned(),
                    None => uuid::Uuid::new_v4().to_string(),
                };
                while sessions.contains_key(&uuid) {
                    uuid = uuid::Uuid::new_v4().to_string();
                }
                let session = Arc::new(Session::new(
                    uuid.clone(),
                    self.initial_token.clone(),
                    ttl,
                ));
                let _ = sessions.insert(uuid, Arc::clone(&session));
                gauge!("sessions_active").set(sessions.len() as f64);
                (Ok(session), reaped)
            }
        };
        finish_reaped(reaped);
        session
    }

    /// Look the session up by UUID, bumping its expiry.
    ///
    /// An expired session is reaped on the way: its cookies are destroyed
    /// and the lookup misses.
    pub fn search(&self, uuid: &str) -> Option<Arc<Session>> {
        let now = Utc::now();
        let (found, expired) = {
            let mut sessions = self.sessions.lock();
            match sessions.get(uuid) {
                Some(session) if session.is_expired_at(now) => {
                    let expired = sessions.remove(uuid);
                    gauge!("sessions_active").set(sessions.len() as f64);
                    (None, expired)
                }
                Some(session) => (Some(Arc::clone(session)), None),
                None => (None, None),
            }
        };
        if let Some(session) = expired {
            session.close();
        }
        if let Some(session) = &found {
            session.touch(now);
        }
        found
    }

    /// Drop every closed or expired session that nothing references.
    pub fn purge(&self) {
        let reaped = {
            let mut sessions = self.sessions.lock();
            let reaped = Self::reap_locked(&mut sessions);
            gauge!("sessions_active").set(sessions.len() as f64);
            reaped
        };
        finish_reaped(reaped);
    }

    /// Remove reapable sessions from the table, oldest access first.
    /// Returns them so their destructors can run outside the lock.
    fn reap_locked(sessions: &mut HashMap<String, Arc<Session>>) -> Vec<Arc<Session>> {
        let now = Utc::now();
        let mut reapable: Vec<(chrono::DateTime<Utc>, String)> = sessions
            .iter()
            .filter(|(_, s)| {
                // Only the table holds it, and it can never be used again.
                Arc::strong_count(s) == 1 && (s.is_closed() || s.is_expired_at(now))
            })
            .map(|(uuid, s)| (s.last_access(), uuid.clone()))
            .collect();
        reapable.sort();

        reapable
            .into_iter()
            .filter_map(|(_, uuid)| sessions.remove(&uuid))
            .collect()
    }
}

fn finish_reaped(reaped: Vec<Arc<Session>>) {
    for session in reaped {
        // Idempotent for already-closed sessions; destroys the cookies of
        // expired ones.
        session.close();
    }
}
