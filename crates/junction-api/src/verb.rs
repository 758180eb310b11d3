//! The verb ABI: binding descriptors and the api built from one.
//!
//! A binding declares an api as data: a name, an info string, and a list
//! of verbs, each carrying a session requirement, an optional permission
//! expression, and an async handler. [`BoundApi::new`] compiles the
//! descriptor — permission expressions are parsed here, so a malformed
//! one fails at load time and never at request time.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info_span, Instrument};

use junction_session::{postprocess, precheck, AuthError, AuthRequirement, CookieKey};

use crate::apiset::{Api, ApiError};
use crate::perm::PermExpr;
use crate::request::{kinds, Request};

type VerbFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type VerbHandler = Arc<dyn Fn(Request) -> VerbFuture + Send + Sync>;
type StartHook = Box<dyn Fn() -> Result<(), ApiError> + Send + Sync>;

/// One verb of a binding.
pub struct Verb {
    name: String,
    info: Option<String>,
    auth: AuthRequirement,
    permission: Option<String>,
    handler: VerbHandler,
}

impl Verb {
    /// Declare a verb with its async handler.
    pub fn new<F, Fut>(name: &str, handler: F) -> Verb
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Verb {
            name: name.to_owned(),
            info: None,
            auth: AuthRequirement::NONE,
            permission: None,
            handler: Arc::new(move |request| Box::pin(handler(request))),
        }
    }

    /// Human-oriented description.
    pub fn info(mut self, info: &str) -> Verb {
        self.info = Some(info.to_owned());
        self
    }

    /// Session requirement checked before the handler runs.
    pub fn auth(mut self, auth: AuthRequirement) -> Verb {
        self.auth = auth;
        self
    }

    /// Permission expression, parsed at load time.
    pub fn permission(mut self, expression: &str) -> Verb {
        self.permission = Some(expression.to_owned());
        self
    }
}

/// An api descriptor: what a binding exports.
pub struct Binding {
    name: String,
    info: Option<String>,
    verbs: Vec<Verb>,
    on_start: Option<StartHook>,
}

impl Binding {
    /// Start a descriptor for the api `name`.
    pub fn new(name: &str) -> Binding {
        Binding {
            name: name.to_owned(),
            info: None,
            verbs: Vec::new(),
            on_start: None,
        }
    }

    /// Human-oriented description of the api.
    pub fn info(mut self, info: &str) -> Binding {
        self.info = Some(info.to_owned());
        self
    }

    /// Add a verb.
    pub fn verb(mut self, verb: Verb) -> Binding {
        self.verbs.push(verb);
        self
    }

    /// Hook invoked once before the api serves calls.
    pub fn on_start<F>(mut self, hook: F) -> Binding
    where
        F: Fn() -> Result<(), ApiError> + Send + Sync + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }
}

struct CompiledVerb {
    name: String,
    info: Option<String>,
    auth: AuthRequirement,
    permission: Option<PermExpr>,
    handler: VerbHandler,
}

/// An api compiled from a [`Binding`], ready for the api set.
pub struct BoundApi {
    name: String,
    info: Option<String>,
    /// Sorted by lowercased name for bisection.
    verbs: Vec<CompiledVerb>,
    context_key: CookieKey,
    verbosity: AtomicU8,
    started: AtomicBool,
    on_start: Option<StartHook>,
}

impl BoundApi {
    /// Compile the descriptor. Fails when a permission expression is
    /// malformed.
    pub fn new(binding: Binding) -> Result<Arc<BoundApi>, ApiError> {
        let mut verbs = Vec::with_capacity(binding.verbs.len());
        for verb in binding.verbs {
            let permission = match &verb.permission {
                Some(expression) => Some(PermExpr::parse(expression)?),
                None => None,
            };
            verbs.push(CompiledVerb {
                name: verb.name,
                info: verb.info,
                auth: verb.auth,
                permission,
                handler: verb.handler,
            });
        }
        verbs.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

        Ok(Arc::new(BoundApi {
            name: binding.name,
            info: binding.info,
            verbs,
            context_key: CookieKey::issue(),
            verbosity: AtomicU8::new(0),
            started: AtomicBool::new(false),
            on_start: binding.on_start,
        }))
    }

    /// The api's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn find_verb(&self, name: &str) -> Option<&CompiledVerb> {
        let wanted = name.to_lowercase();
        self.verbs
            .binary_search_by(|verb| verb.name.to_lowercase().cmp(&wanted))
            .ok()
            .map(|idx| &self.verbs[idx])
    }
}

#[async_trait]
impl Api for BoundApi {
    async fn call(&self, request: Request) {
        let Some(verb) = self.find_verb(request.verb()) else {
            let _ = request.fail(
                kinds::UNKNOWN_VERB,
                &format!("verb {} unknown within api {}", request.verb(), self.name),
            );
            return;
        };

        // The binding's private slot in the session.
        request.attach_context_key(self.context_key);

        // Session requirement, then permission; failures short-circuit
        // and the handler is never invoked.
        if let Err(refused) = precheck(request.session(), verb.auth, request.token()) {
            let kind = match refused {
                AuthError::InvalidToken => kinds::INVALID_TOKEN,
                AuthError::InsufficientScope => kinds::INSUFFICIENT_SCOPE,
            };
            let _ = request.fail(kind, "authorization refused");
            return;
        }
        if let Some(expression) = &verb.permission {
            if !expression.eval(&|name| request.has_permission(name)) {
                let _ = request.fail(kinds::INSUFFICIENT_SCOPE, "permission denied");
                return;
            }
        }

        let span = info_span!("verb", api = %self.name, verb = %verb.name);
        (verb.handler)(request.clone()).instrument(span).await;

        postprocess(request.session(), verb.auth);
    }

    async fn describe(&self) -> Value {
        let verbs: Vec<Value> = self
            .verbs
            .iter()
            .map(|verb| {
                json!({
                    "verb": verb.name,
                    "info": verb.info,
                    "auth": {
                        "check": verb.auth.check,
                        "close": verb.auth.close,
                        "renew": verb.auth.renew,
                        "loa": verb.auth.loa,
                    },
                    "permission": verb.permission.as_ref().map(ToString::to_string),
                })
            })
            .collect();
        json!({
            "api": self.name,
            "info": self.info,
            "verbs": verbs,
        })
    }

    fn start(&self) -> Result<(), ApiError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(api = %self.name, "starting service");
        match &self.on_start {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    fn set_verbosity(&self, level: u8) {
        self.verbosity.store(level, Ordering::Relaxed);
    }

    fn get_verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }
}
