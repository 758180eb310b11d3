//! Session and authentication-context store for the binder.
//!
//! A session is a UUID-identified authentication context with a renewable
//! token, a level of assurance, and a map of per-binding cookies with
//! destructors. The [`SessionStore`] bounds how many may live at once and
//! expires them on inactivity.
//!
//! - [`session`] — one session: token, LOA, cookies.
//! - [`store`] — the bounded expiring table.
//! - [`auth`] — verb authorization against a session.

pub mod auth;
pub mod session;
pub mod store;

pub use auth::{postprocess, precheck, AuthError, AuthRequirement};
pub use session::{CookieDrop, CookieKey, CookieValue, Session, SessionError, LOA_MAX};
pub use store::{SessionStore, StoreConfig};
