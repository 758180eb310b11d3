//! One session: identity, renewable token, LOA, and the cookie map.
//!
//! A session is shared as `Arc<Session>`; the store holds one reference
//! and every in-flight request holds another. Destruction follows from
//! reference counting: the store drops its reference once the session is
//! closed or expired, and the allocation goes away with the last holder.
//!
//! Cookies are per-binding typed values with destructors. The destructor
//! of a cookie runs exactly once — on replace, on removal, or when the
//! session closes — and always after the session lock is released.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::trace;

/// Highest level of assurance a session can carry.
pub const LOA_MAX: u8 = 3;

/// Session failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// The store is at its capacity bound.
    #[error("session store is full")]
    Full,

    /// The configured initial token does not have the 36-byte shape.
    #[error("initial token must be 36 bytes")]
    BadInitialToken,

    /// A caller-pinned UUID does not have the 36-byte shape.
    #[error("session uuid must be 36 bytes")]
    BadUuid,

    /// LOA outside `0..=3`.
    #[error("level of assurance out of range")]
    BadLoa,

    /// The session is closed; no cookie may be added.
    #[error("session is closed")]
    Closed,
}

/// Opaque cookie key, issued once per binding at load time.
///
/// Two keys from different `issue` calls never collide, which gives each
/// binding a private slot namespace inside every session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CookieKey(u64);

impl CookieKey {
    /// Allocate a key distinct from every other one in this process.
    pub fn issue() -> CookieKey {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CookieKey(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A stored cookie value.
pub type CookieValue = Arc<dyn Any + Send + Sync>;

/// Destructor invoked exactly once when the cookie leaves the session.
pub type CookieDrop = Box<dyn FnOnce(CookieValue) + Send>;

struct CookieSlot {
    value: CookieValue,
    on_drop: Option<CookieDrop>,
}

impl CookieSlot {
    fn destroy(self) {
        if let Some(on_drop) = self.on_drop {
            on_drop(self.value);
        }
    }
}

struct State {
    token: String,
    loa: u8,
    last_access: DateTime<Utc>,
    expiry: DateTime<Utc>,
    ttl: Duration,
    closed: bool,
    cookies: HashMap<CookieKey, CookieSlot>,
}

/// An authentication context: UUID identity, renewable token, level of
/// assurance, timestamps, and per-binding cookies.
pub struct Session {
    uuid: String,
    created: DateTime<Utc>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("created", &self.created)
            .field("loa", &state.loa)
            .field("last_access", &state.last_access)
            .field("expiry", &state.expiry)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Session {
    pub fn new(uuid: String, token: String, ttl: Duration) -> Session {
        let now = Utc::now();
        Session {
            uuid,
            created: now,
            state: Mutex::new(State {
                token,
                loa: 0,
                last_access: now,
                expiry: now + ttl,
                ttl,
                closed: false,
                cookies: HashMap::new(),
            }),
        }
    }

    /// Stable identity, a 36-byte opaque identifier.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Creation timestamp.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Timestamp of the most recent access.
    pub fn last_access(&self) -> DateTime<Utc> {
        self.state.lock().last_access
    }

    /// Current authentication token.
    pub fn token(&self) -> String {
        self.state.lock().token.clone()
    }

    /// Compare `candidate` against the current token in constant time.
    pub fn check_token(&self, candidate: &str) -> bool {
        let state = self.state.lock();
        constant_time_eq(candidate, &state.token)
    }

    /// Replace the token with a fresh 36-byte credential.
    pub fn renew_token(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.state.lock().token.clone_from(&token);
        trace!(session = %self.uuid, "token renewed");
        token
    }

    /// Current level of assurance.
    pub fn loa(&self) -> u8 {
        self.state.lock().loa
    }

    /// Set the level of assurance, `0..=3`.
    pub fn set_loa(&self, loa: u8) -> Result<(), SessionError> {
        if loa > LOA_MAX {
            return Err(SessionError::BadLoa);
        }
        self.state.lock().loa = loa;
        Ok(())
    }

    /// Whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether the expiry has passed as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state.lock().expiry < now
    }

    /// Record an access: pushes the expiry to `now + ttl`.
    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.last_access = now;
        state.expiry = now + state.ttl;
    }

    /// Close the session: run every cookie destructor and drop the map.
    /// Further cookie installation is refused. Idempotent.
    pub fn close(&self) {
        let slots: Vec<CookieSlot> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.cookies.drain().map(|(_, slot)| slot).collect()
        };
        // Destructors run with no lock held.
        for slot in slots {
            slot.destroy();
        }
        trace!(session = %self.uuid, "session closed");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cookies
    // ─────────────────────────────────────────────────────────────────────

    /// Value stored under `key`, if any.
    pub fn cookie_get(&self, key: CookieKey) -> Option<CookieValue> {
        self.state.lock().cookies.get(&key).map(|s| Arc::clone(&s.value))
    }

    /// Value stored under `key`, or `default` — without installing it.
    pub fn cookie_get_or(&self, key: CookieKey, default: CookieValue) -> CookieValue {
        self.cookie_get(key).unwrap_or(default)
    }

    /// Value stored under `key`, installing `make()` when absent.
    pub fn cookie_get_or_init<F>(&self, key: CookieKey, make: F) -> Result<CookieValue, SessionError>
    where
        F: FnOnce() -> (CookieValue, Option<CookieDrop>),
    {
        let mut state = self.state.lock();
        if let Some(slot) = state.cookies.get(&key) {
            return Ok(Arc::clone(&slot.value));
        }
        if state.closed {
            return Err(SessionError::Closed);
        }
        let (value, on_drop) = make();
        let _ = state.cookies.insert(
            key,
            CookieSlot {
                value: Arc::clone(&value),
                on_drop,
            },
        );
        Ok(value)
    }

    /// Install `value` under `key`, replacing any previous cookie.
    ///
    /// The previous cookie's destructor runs exactly once, after the
    /// session lock is released.
    pub fn cookie_set(
        &self,
        key: CookieKey,
        value: CookieValue,
        on_drop: Option<CookieDrop>,
    ) -> Result<(), SessionError> {
        let previous = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SessionError::Closed);
            }
            state.cookies.insert(key, CookieSlot { value, on_drop })
        };
        if let Some(slot) = previous {
            slot.destroy();
        }
        Ok(())
    }

    /// Remove the cookie under `key`, running its destructor.
    ///
    /// Returns whether a cookie existed.
    pub fn cookie_remove(&self, key: CookieKey) -> bool {
        let removed = self.state.lock().cookies.remove(&key);
        match removed {
            Some(slot) => {
                slot.destroy();
                true
            }
            None => false,
        }
    }

    /// Count of cookies currently stored.
    pub fn cookie_count(&self) -> usize {
        self.state.lock().cookies.len()
    }
}

/// Byte-wise comparison whose timing does not depend on where the inputs
/// differ.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
