//! The request object handed to verb callbacks.
//!
//! A request carries the parsed call (api, verb, JSON argument), the
//! session it runs under, the credentials presented, and the channels to
//! answer through: a replier (exactly one reply per request) and an
//! optional subscriber for event subscriptions tied to the call.
//!
//! Requests are cheap to clone; all clones answer the same call. The
//! first reply wins, later ones are dropped with a log line. A request
//! dropped without any reply answers on its own so the caller is never
//! left hanging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use junction_jobs::Group;
use junction_session::{CookieDrop, CookieKey, CookieValue, Session, SessionError};

use crate::events::Event;

/// Error kinds carried in the reply's `error` field.
pub mod kinds {
    /// Malformed frame, unknown opcode, bad verb name.
    pub const INVALID_ARGUMENT: &str = "invalid-argument";
    /// No api of that name.
    pub const UNKNOWN_API: &str = "unknown-api";
    /// No verb of that name on the api.
    pub const UNKNOWN_VERB: &str = "unknown-verb";
    /// Token missing or stale.
    pub const INVALID_TOKEN: &str = "invalid-token";
    /// Permission or LOA refusal.
    pub const INSUFFICIENT_SCOPE: &str = "insufficient-scope";
    /// Job queue over capacity.
    pub const BUSY: &str = "busy";
    /// Watchdog deadline reached.
    pub const TIMEOUT: &str = "timeout";
    /// Processing cancelled before completion.
    pub const ABORTED: &str = "aborted";
    /// Channel hangup while the request was in flight.
    pub const DISCONNECTED: &str = "disconnected";
    /// Invariant violation inside the binder or a binding.
    pub const INTERNAL_ERROR: &str = "internal-error";
    /// Allocation failure; fatal to the operation.
    pub const OUT_OF_MEMORY: &str = "out-of-memory";
}

/// A complete answer to a call.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// JSON result, `Null` on failure.
    pub result: Value,
    /// Error kind, `None` on success.
    pub error: Option<String>,
    /// Optional human-oriented detail.
    pub info: Option<String>,
}

impl Reply {
    /// Successful reply.
    pub fn success(result: Value) -> Reply {
        Reply {
            result,
            error: None,
            info: None,
        }
    }

    /// Failed reply with an error kind from [`kinds`].
    pub fn failure(error: &str, info: Option<&str>) -> Reply {
        Reply {
            result: Value::Null,
            error: Some(error.to_owned()),
            info: info.map(str::to_owned),
        }
    }
}

/// Where a request's single reply goes.
pub trait Replier: Send + Sync {
    /// Deliver the reply. Called at most once per request.
    fn send(&self, reply: Reply);
}

/// Subscription channel bound to the request's call.
pub trait Subscriber: Send + Sync {
    /// Tie a subscription to the call.
    fn subscribe(&self, event: &Event) -> Result<(), RequestError>;

    /// Revoke a subscription tied to the call.
    fn unsubscribe(&self, event: &Event) -> Result<(), RequestError>;
}

/// Request-surface failure (distinct from a failed *reply*).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    /// The request has no subscription channel (local or already gone).
    #[error("no subscription channel")]
    NoSubscriber,

    /// The subscription could not be established or revoked.
    #[error("subscription failed")]
    SubscribeFailed,

    /// Session refused the operation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No dispatcher attached; sub-calls are unavailable.
    #[error("no dispatcher attached")]
    NoDispatcher,
}

/// One named argument extracted from the JSON argument object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arg {
    /// Argument name.
    pub name: String,
    /// Value as text, when present.
    pub value: Option<String>,
    /// Path of an attached file, when the front-end stored one.
    pub path: Option<String>,
}

/// Everything needed to build a [`Request`].
pub struct RequestParts {
    /// Target api name.
    pub api: String,
    /// Target verb name.
    pub verb: String,
    /// JSON argument.
    pub args: Value,
    /// Session the request runs under.
    pub session: Arc<Session>,
    /// Authentication token presented with the request.
    pub token: Option<String>,
    /// Credentials presented with the request (granted permission names).
    pub creds: Option<String>,
    /// Reply channel.
    pub replier: Box<dyn Replier>,
    /// Subscription channel, when the transport supports one.
    pub subscriber: Option<Arc<dyn Subscriber>>,
}

struct DispatchState {
    context_key: Option<CookieKey>,
    dispatcher: Option<Weak<dyn Dispatcher>>,
}

/// Dispatches sub-calls. Implemented by the api set.
pub trait Dispatcher: Send + Sync {
    /// Queue `request` for processing.
    fn dispatch(&self, request: Request);
}

struct RequestInner {
    api: String,
    verb: String,
    args: Value,
    session: Arc<Session>,
    token: Option<String>,
    creds: Option<String>,
    replied: AtomicBool,
    replier: Box<dyn Replier>,
    subscriber: Option<Arc<dyn Subscriber>>,
    dispatch: Mutex<DispatchState>,
}

/// A call in processing. Clones share the same underlying request.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Build a request from its parts.
    pub fn new(parts: RequestParts) -> Request {
        Request {
            inner: Arc::new(RequestInner {
                api: parts.api,
                verb: parts.verb,
                args: parts.args,
                session: parts.session,
                token: parts.token,
                creds: parts.creds,
                replied: AtomicBool::new(false),
                replier: parts.replier,
                subscriber: parts.subscriber,
                dispatch: Mutex::new(DispatchState {
                    context_key: None,
                    dispatcher: None,
                }),
            }),
        }
    }

    /// Target api name.
    pub fn api(&self) -> &str {
        &self.inner.api
    }

    /// Target verb name.
    pub fn verb(&self) -> &str {
        &self.inner.verb
    }

    /// The JSON argument as received.
    pub fn json_args(&self) -> &Value {
        &self.inner.args
    }

    /// Textual value of the named argument, when present.
    ///
    /// Non-string JSON scalars are rendered as their JSON text.
    pub fn value(&self, key: &str) -> Option<String> {
        match self.inner.args.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    /// Full description of the named argument.
    pub fn get(&self, key: &str) -> Arg {
        Arg {
            name: key.to_owned(),
            value: self.value(key),
            path: self
                .inner
                .args
                .get(key)
                .and_then(|v| v.get("path"))
                .and_then(Value::as_str)
                .map(str::to_owned),
        }
    }

    /// The session this request runs under.
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Authentication token presented with the request.
    pub fn token(&self) -> Option<&str> {
        self.inner.token.as_deref()
    }

    /// Credentials presented with the request.
    pub fn creds(&self) -> Option<&str> {
        self.inner.creds.as_deref()
    }

    /// Whether `name` is among the granted permission names of the
    /// credentials.
    pub fn has_permission(&self, name: &str) -> bool {
        self.inner
            .creds
            .as_deref()
            .is_some_and(|creds| creds.split([' ', ',']).any(|granted| granted == name))
    }

    /// Serialization key: requests of one session run one at a time.
    pub fn group(&self) -> Group {
        Group::of(self.inner.session.uuid())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replying
    // ─────────────────────────────────────────────────────────────────────

    /// Send the reply. The first reply wins; returns whether this was it.
    pub fn reply(&self, result: Value, error: Option<&str>, info: Option<&str>) -> bool {
        if self.inner.replied.swap(true, Ordering::AcqRel) {
            debug!(
                api = %self.inner.api,
                verb = %self.inner.verb,
                "duplicate reply dropped"
            );
            return false;
        }
        self.inner.replier.send(Reply {
            result,
            error: error.map(str::to_owned),
            info: info.map(str::to_owned),
        });
        true
    }

    /// Reply success with `result`.
    pub fn success(&self, result: Value) -> bool {
        self.reply(result, None, None)
    }

    /// Reply failure with a kind from [`kinds`].
    pub fn fail(&self, error: &str, info: &str) -> bool {
        self.reply(Value::Null, Some(error), Some(info))
    }

    /// Whether a reply has been sent.
    pub fn replied(&self) -> bool {
        self.inner.replied.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe the request's connection to `event`.
    pub fn subscribe(&self, event: &Event) -> Result<(), RequestError> {
        match &self.inner.subscriber {
            Some(subscriber) => subscriber.subscribe(event),
            None => Err(RequestError::NoSubscriber),
        }
    }

    /// Unsubscribe the request's connection from `event`.
    pub fn unsubscribe(&self, event: &Event) -> Result<(), RequestError> {
        match &self.inner.subscriber {
            Some(subscriber) => subscriber.unsubscribe(event),
            None => Err(RequestError::NoSubscriber),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session context
    // ─────────────────────────────────────────────────────────────────────

    /// Set the session's level of assurance, `0..=3`.
    pub fn set_loa(&self, loa: u8) -> Result<(), RequestError> {
        Ok(self.inner.session.set_loa(loa)?)
    }

    /// The binding-private context stored in the session, if any.
    pub fn context_get(&self) -> Option<CookieValue> {
        let key = self.inner.dispatch.lock().context_key?;
        self.inner.session.cookie_get(key)
    }

    /// Store a binding-private context in the session.
    ///
    /// Replaces any previous context; its destructor runs exactly once.
    pub fn context_set(
        &self,
        value: CookieValue,
        on_drop: Option<CookieDrop>,
    ) -> Result<(), RequestError> {
        let key = self
            .inner
            .dispatch
            .lock()
            .context_key
            .ok_or(RequestError::NoDispatcher)?;
        Ok(self.inner.session.cookie_set(key, value, on_drop)?)
    }

    /// Drop the binding-private context, running its destructor.
    pub fn context_clear(&self) -> bool {
        let Some(key) = self.inner.dispatch.lock().context_key else {
            return false;
        };
        self.inner.session.cookie_remove(key)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sub-calls
    // ─────────────────────────────────────────────────────────────────────

    /// Call another verb under this request's session and credentials,
    /// resolving to its reply.
    pub async fn subcall(&self, api: &str, verb: &str, args: Value) -> Result<Reply, RequestError> {
        let dispatcher = {
            let state = self.inner.dispatch.lock();
            state
                .dispatcher
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or(RequestError::NoDispatcher)?
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        let request = Request::new(RequestParts {
            api: api.to_owned(),
            verb: verb.to_owned(),
            args,
            session: Arc::clone(&self.inner.session),
            token: self.inner.token.clone(),
            creds: self.inner.creds.clone(),
            replier: Box::new(OneshotReplier {
                tx: Mutex::new(Some(tx)),
            }),
            subscriber: self.inner.subscriber.clone(),
        });
        dispatcher.dispatch(request);

        rx.await.map_err(|_| RequestError::NoDispatcher)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch wiring (used by the api set and bound apis)
    // ─────────────────────────────────────────────────────────────────────

    /// Record the binding's cookie key before its verb runs.
    pub fn attach_context_key(&self, key: CookieKey) {
        self.inner.dispatch.lock().context_key = Some(key);
    }

    /// Record the dispatcher so sub-calls can be routed.
    pub fn attach_dispatcher(&self, dispatcher: Weak<dyn Dispatcher>) {
        self.inner.dispatch.lock().dispatcher = Some(dispatcher);
    }
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        // Exactly-one-reply backstop for buggy verbs: the caller must
        // never be left without an answer.
        if !self.replied.swap(true, Ordering::AcqRel) {
            warn!(api = %self.api, verb = %self.verb, "request dropped without a reply");
            self.replier.send(Reply::failure(
                kinds::INTERNAL_ERROR,
                Some("no reply was produced"),
            ));
        }
    }
}

struct OneshotReplier {
    tx: Mutex<Option<tokio::sync::oneshot::Sender<Reply>>>,
}

impl Replier for OneshotReplier {
    fn send(&self, reply: Reply) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(reply);
        }
    }
}
