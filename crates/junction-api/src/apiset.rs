//! The api registry and call dispatcher.
//!
//! Apis live in an array sorted by case-folded name and are looked up by
//! bisection — the table is read-hot and tiny. Dispatch queues one job
//! per request on the job engine, grouped by the request's session so
//! verbs of one session run one at a time, and bounded by the configured
//! call timeout.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use junction_jobs::{JobEngine, JobError, Outcome};

use crate::perm::PermParseError;
use crate::request::{kinds, Dispatcher, Request};

/// Api registry failure.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The api name contains forbidden characters or is empty.
    #[error("invalid api name")]
    InvalidName,

    /// An api of that name is already registered.
    #[error("api name already exists")]
    AlreadyExists,

    /// No api of that name.
    #[error("unknown api")]
    Unknown,

    /// A verb carries a malformed permission expression.
    #[error("invalid permission expression: {0}")]
    InvalidExpression(#[from] PermParseError),

    /// The api's start hook failed.
    #[error("service start failed: {0}")]
    StartFailed(String),
}

/// A named collection of verbs, as seen by the dispatcher.
#[async_trait]
pub trait Api: Send + Sync {
    /// Process one request. Must arrange exactly one reply.
    async fn call(&self, request: Request);

    /// Self-description document.
    async fn describe(&self) -> Value {
        Value::Null
    }

    /// Start the service behind the api. Idempotent.
    fn start(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Adjust the api's verbosity level.
    fn set_verbosity(&self, level: u8) {
        let _ = level;
    }

    /// Current verbosity level.
    fn get_verbosity(&self) -> u8 {
        0
    }

    /// Re-read hook configuration.
    fn update_hooks(&self) {}
}

struct Entry {
    /// Case-folded sort key.
    key: String,
    name: String,
    api: Arc<dyn Api>,
}

/// Sorted registry of apis plus the dispatch policy.
pub struct ApiSet {
    weak_self: Weak<ApiSet>,
    entries: Mutex<Vec<Entry>>,
    engine: JobEngine,
    call_timeout: Duration,
}

impl ApiSet {
    /// Build a registry dispatching through `engine`.
    ///
    /// `call_timeout` bounds each queued request (zero = unlimited).
    pub fn new(engine: JobEngine, call_timeout: Duration) -> Arc<ApiSet> {
        Arc::new_cyclic(|weak| ApiSet {
            weak_self: weak.clone(),
            entries: Mutex::new(Vec::new()),
            engine,
            call_timeout,
        })
    }

    /// Register an api under `name`.
    pub fn add(&self, name: &str, api: Arc<dyn Api>) -> Result<(), ApiError> {
        if !is_valid_api_name(name) {
            warn!(api = name, "invalid api name refused");
            return Err(ApiError::InvalidName);
        }
        let key = name.to_lowercase();
        let mut entries = self.entries.lock();
        match entries.binary_search_by(|entry| entry.key.as_str().cmp(&key)) {
            Ok(_) => Err(ApiError::AlreadyExists),
            Err(idx) => {
                entries.insert(
                    idx,
                    Entry {
                        key,
                        name: name.to_owned(),
                        api,
                    },
                );
                info!(api = name, "api added");
                Ok(())
            }
        }
    }

    /// Find an api by case-insensitive name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Api>> {
        let key = name.to_lowercase();
        let entries = self.entries.lock();
        entries
            .binary_search_by(|entry| entry.key.as_str().cmp(&key))
            .ok()
            .map(|idx| Arc::clone(&entries[idx].api))
    }

    /// Registered api names, in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// The engine requests are dispatched on.
    pub fn engine(&self) -> &JobEngine {
        &self.engine
    }

    /// Dispatch a request synchronously, inside the caller.
    pub async fn call_direct(&self, request: Request) {
        self.attach(&request);
        counter!("api_requests_total").increment(1);
        match self.lookup(request.api()) {
            Some(api) => api.call(request).await,
            None => {
                counter!("api_unknown_total").increment(1);
                let _ = request.fail(
                    kinds::UNKNOWN_API,
                    &format!("api {} not found", request.api()),
                );
            }
        }
    }

    /// Dispatch a request through the job engine.
    ///
    /// The job is grouped by the request's session and bounded by the call
    /// timeout; the request is guaranteed a reply on every path (busy,
    /// timeout, cancellation included).
    pub fn call(&self, request: Request) {
        let Some(this) = self.weak_self.upgrade() else {
            let _ = request.fail(kinds::INTERNAL_ERROR, "api set is gone");
            return;
        };

        let group = request.group();
        let set = Arc::clone(&this);
        let job_request = request.clone();
        let queued = self.engine.queue_watched(
            Some(group),
            self.call_timeout,
            move |_ctx| async move { set.call_direct(job_request).await },
        );

        match queued {
            Ok(done) => {
                // The watcher converts an abnormal outcome into the reply
                // the verb never got to send.
                let _ = tokio::spawn(async move {
                    match done.await {
                        Ok(Outcome::TimedOut) => {
                            let _ = request.fail(kinds::TIMEOUT, "request processing timed out");
                        }
                        Ok(Outcome::Cancelled) => {
                            let _ = request.fail(kinds::ABORTED, "request processing was cancelled");
                        }
                        Ok(Outcome::Done) | Err(_) => {}
                    }
                });
            }
            Err(JobError::Busy) => {
                counter!("api_busy_total").increment(1);
                let _ = request.fail(kinds::BUSY, "too many pending requests");
            }
            Err(_) => {
                let _ = request.fail(kinds::ABORTED, "binder is shutting down");
            }
        }
    }

    fn attach(&self, request: &Request) {
        let weak: Weak<dyn Dispatcher> = self.weak_self.clone();
        request.attach_dispatcher(weak);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Service management
    // ─────────────────────────────────────────────────────────────────────

    /// Start the named service.
    pub fn start_service(&self, name: &str) -> Result<(), ApiError> {
        self.lookup(name).ok_or(ApiError::Unknown)?.start()
    }

    /// Start every service, stopping at the first failure.
    pub fn start_all(&self) -> Result<(), ApiError> {
        let apis: Vec<Arc<dyn Api>> = {
            let entries = self.entries.lock();
            entries.iter().map(|e| Arc::clone(&e.api)).collect()
        };
        for api in apis {
            api.start()?;
        }
        Ok(())
    }

    /// Ask one api (or all with `None`) to re-read its hook flags.
    pub fn update_hooks(&self, name: Option<&str>) {
        for api in self.select(name) {
            api.update_hooks();
        }
    }

    /// Set the verbosity of one api (or all with `None`).
    pub fn set_verbosity(&self, name: Option<&str>, level: u8) {
        for api in self.select(name) {
            api.set_verbosity(level);
        }
    }

    /// Verbosity of the named api.
    pub fn get_verbosity(&self, name: &str) -> Result<u8, ApiError> {
        Ok(self.lookup(name).ok_or(ApiError::Unknown)?.get_verbosity())
    }

    fn select(&self, name: Option<&str>) -> Vec<Arc<dyn Api>> {
        match name {
            Some(name) => self.lookup(name).into_iter().collect(),
            None => {
                let entries = self.entries.lock();
                entries.iter().map(|e| Arc::clone(&e.api)).collect()
            }
        }
    }

    /// Self-description of every api, keyed by name.
    pub async fn describe_all(&self) -> Value {
        let apis: Vec<(String, Arc<dyn Api>)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|e| (e.name.clone(), Arc::clone(&e.api)))
                .collect()
        };
        let mut doc = Map::new();
        for (name, api) in apis {
            let _ = doc.insert(name, api.describe().await);
        }
        Value::Object(doc)
    }
}

impl Dispatcher for ApiSet {
    /// Sub-calls run outside the session group: the parent verb holds the
    /// group while it awaits the sub-reply, so routing the child through
    /// the grouped queue would deadlock.
    fn dispatch(&self, request: Request) {
        let Some(this) = self.weak_self.upgrade() else {
            let _ = request.fail(kinds::INTERNAL_ERROR, "api set is gone");
            return;
        };
        let _ = tokio::spawn(async move { this.call_direct(request).await });
    }
}

/// Validity rule for api names: non-empty, and every ASCII character must
/// be printable, non-space, and outside the reserved URI set.
pub fn is_valid_api_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.chars().all(|c| {
        if (c as u32) >= 0x80 {
            return true;
        }
        c > ' '
            && !matches!(
                c,
                '"' | '#' | '%' | '&' | '\'' | '/' | '?' | '`' | '\\' | '\x7f'
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Reply, Replier, RequestParts};
    use crate::verb::{Binding, BoundApi, Verb};
    use junction_jobs::JobConfig;
    use junction_session::Session;
    use serde_json::json;
    use tokio::sync::oneshot;

    struct ChannelReplier {
        tx: Mutex<Option<oneshot::Sender<Reply>>>,
    }

    impl Replier for ChannelReplier {
        fn send(&self, reply: Reply) {
            if let Some(tx) = self.tx.lock().take() {
                let _ = tx.send(reply);
            }
        }
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            uuid::Uuid::new_v4().to_string(),
            "123456789012345678901234567890123456".to_owned(),
            chrono::Duration::hours(1),
        ))
    }

    fn request_on(
        session: &Arc<Session>,
        api: &str,
        verb: &str,
        args: Value,
    ) -> (Request, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let request = Request::new(RequestParts {
            api: api.to_owned(),
            verb: verb.to_owned(),
            args,
            session: Arc::clone(session),
            token: None,
            creds: None,
            replier: Box::new(ChannelReplier {
                tx: Mutex::new(Some(tx)),
            }),
            subscriber: None,
        });
        (request, rx)
    }

    fn ping_api() -> Arc<BoundApi> {
        BoundApi::new(Binding::new("hello").verb(Verb::new(
            "ping",
            |request: Request| async move {
                let _ = request.success(json!("pong"));
            },
        )))
        .unwrap()
    }

    fn apiset(timeout: Duration) -> Arc<ApiSet> {
        ApiSet::new(JobEngine::new(JobConfig::default()), timeout)
    }

    #[test]
    fn name_validation() {
        for ok in ["hello", "a", "x-y_z.v1", "émis", "UPPER"] {
            assert!(is_valid_api_name(ok), "{ok} should be valid");
        }
        for bad in [
            "", "with space", "a/b", "a?b", "a#b", "a%b", "a&b", "a'b", "a\"b", "a`b", "a\\b",
            "a\x7fb", "\tx",
        ] {
            assert!(!is_valid_api_name(bad), "{bad:?} should be invalid");
        }
    }

    #[tokio::test]
    async fn add_rejects_invalid_and_duplicate_names() {
        let set = apiset(Duration::ZERO);
        assert!(matches!(
            set.add("bad name", ping_api()),
            Err(ApiError::InvalidName)
        ));
        set.add("hello", ping_api()).unwrap();
        assert!(matches!(
            set.add("HELLO", ping_api()),
            Err(ApiError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_and_sorted() {
        let set = apiset(Duration::ZERO);
        set.add("zeta", ping_api()).unwrap();
        set.add("Alpha", ping_api()).unwrap();
        set.add("mid", ping_api()).unwrap();

        assert!(set.lookup("ALPHA").is_some());
        assert!(set.lookup("zeta").is_some());
        assert!(set.lookup("none").is_none());
        assert_eq!(set.names(), vec!["Alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn queued_call_replies() {
        let set = apiset(Duration::from_secs(5));
        set.add("hello", ping_api()).unwrap();

        let session = session();
        let (request, rx) = request_on(&session, "hello", "ping", json!({}));
        set.call(request);
        assert_eq!(rx.await.unwrap(), Reply::success(json!("pong")));
    }

    #[tokio::test]
    async fn unknown_api_replies_unknown_api() {
        let set = apiset(Duration::ZERO);
        let session = session();
        let (request, rx) = request_on(&session, "missing", "ping", json!({}));
        set.call(request);
        let reply = rx.await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(kinds::UNKNOWN_API));
    }

    #[tokio::test]
    async fn same_session_calls_are_serialized() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let api = BoundApi::new(
            Binding::new("seq")
                .verb(Verb::new("slow", move |request: Request| {
                    let order = Arc::clone(&o1);
                    async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        order.lock().push("slow");
                        let _ = request.success(json!(null));
                    }
                }))
                .verb(Verb::new("fast", move |request: Request| {
                    let order = Arc::clone(&o2);
                    async move {
                        order.lock().push("fast");
                        let _ = request.success(json!(null));
                    }
                })),
        )
        .unwrap();

        let set = apiset(Duration::ZERO);
        set.add("seq", api).unwrap();

        let session = session();
        let (first, rx1) = request_on(&session, "seq", "slow", json!({}));
        let (second, rx2) = request_on(&session, "seq", "fast", json!({}));
        set.call(first);
        set.call(second);
        let _ = rx1.await.unwrap();
        let _ = rx2.await.unwrap();

        assert_eq!(order.lock().as_slice(), &["slow", "fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_verb_gets_a_timeout_reply() {
        let api = BoundApi::new(
            Binding::new("stuck").verb(Verb::new("forever", |_request: Request| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })),
        )
        .unwrap();
        let set = apiset(Duration::from_secs(1));
        set.add("stuck", api).unwrap();

        let session = session();
        let (request, rx) = request_on(&session, "stuck", "forever", json!({}));
        set.call(request);
        let reply = rx.await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(kinds::TIMEOUT));
    }

    #[tokio::test]
    async fn subcall_routes_through_the_dispatcher() {
        let relay = BoundApi::new(Binding::new("relay").verb(Verb::new(
            "echo",
            |request: Request| async move {
                let reply = request
                    .subcall("hello", "ping", json!({}))
                    .await
                    .expect("subcall");
                let _ = request.success(json!({ "relayed": reply.result }));
            },
        )))
        .unwrap();

        let set = apiset(Duration::from_secs(5));
        set.add("hello", ping_api()).unwrap();
        set.add("relay", relay).unwrap();

        let session = session();
        let (request, rx) = request_on(&session, "relay", "echo", json!({}));
        set.call(request);
        let reply = rx.await.unwrap();
        assert_eq!(reply, Reply::success(json!({ "relayed": "pong" })));
    }

    #[tokio::test]
    async fn verbosity_can_be_set_selectively_or_globally() {
        let set = apiset(Duration::ZERO);
        set.add("a", ping_api()).unwrap();
        set.add("b", ping_api()).unwrap();

        set.set_verbosity(Some("a"), 2);
        assert_eq!(set.get_verbosity("a").unwrap(), 2);
        assert_eq!(set.get_verbosity("b").unwrap(), 0);

        set.set_verbosity(None, 3);
        assert_eq!(set.get_verbosity("a").unwrap(), 3);
        assert_eq!(set.get_verbosity("b").unwrap(), 3);

        assert!(matches!(set.get_verbosity("nope"), Err(ApiError::Unknown)));

        // Hook updates broadcast the same way (no-op on these apis).
        set.update_hooks(Some("a"));
        set.update_hooks(None);
    }

    #[tokio::test]
    async fn describe_all_keys_by_api_name() {
        let set = apiset(Duration::ZERO);
        set.add("hello", ping_api()).unwrap();
        let doc = set.describe_all().await;
        assert_eq!(doc["hello"]["api"], "hello");
    }
}
