//! Transport-agnostic api adapters over a wire endpoint.
//!
//! Two directions:
//!
//! - [`ServerStub`] turns a server endpoint into a front door for a local
//!   [`ApiSet`](crate::ApiSet): incoming calls become [`Request`]s, the
//!   connection becomes an event listener, and subscriptions tie back to
//!   the originating callid.
//! - [`RemoteApi`] turns a client endpoint into a local [`Api`]: calls are
//!   serialized onto the wire and the correlated reply resolves the local
//!   request.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use junction_session::SessionStore;
use junction_wire::{
    CallListener, DescribeRequest, Endpoint, IncomingCall, ServerHooks, Transport,
};

use crate::apiset::{Api, ApiSet};
use crate::events::{Event, EventHub, EventListener};
use crate::request::{kinds, Reply, Replier, Request, RequestError, RequestParts, Subscriber};

// ─────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────

/// Glue between one server endpoint and the local api set.
pub struct ServerStub {
    apiset: Arc<ApiSet>,
    sessions: Arc<SessionStore>,
    hub: EventHub,
    /// Connection-level token, presented once at channel setup.
    token: Option<String>,
    listener: OnceLock<Arc<WireListener>>,
}

impl ServerStub {
    /// Wire a transport to the api set. Returns the endpoint whose
    /// [`process_frame`](Endpoint::process_frame) the connection's reader
    /// feeds.
    pub fn serve(
        transport: Arc<dyn Transport>,
        apiset: Arc<ApiSet>,
        sessions: Arc<SessionStore>,
        hub: EventHub,
        token: Option<String>,
    ) -> Arc<Endpoint> {
        let stub = Arc::new(ServerStub {
            apiset,
            sessions,
            hub: hub.clone(),
            token,
            listener: OnceLock::new(),
        });

        let endpoint = Endpoint::server(transport, Arc::clone(&stub) as Arc<dyn ServerHooks>);

        // Frame decoding runs on the worker pool, serialized per
        // connection so dispatch keeps the transport's delivery order.
        let engine = stub.apiset.engine().clone();
        let decode_group = junction_jobs::Group::fresh();
        endpoint.set_queuing(Box::new(move |work| {
            engine
                .queue(Some(decode_group), std::time::Duration::ZERO, move |_ctx| async move {
                    work();
                })
                .map_err(|_| ())
        }));

        // The listener holds the endpoint weakly: the endpoint owns the
        // stub (its hooks), so a strong edge here would be a cycle.
        let listener = Arc::new(WireListener {
            endpoint: Arc::downgrade(&endpoint),
        });
        let _ = stub.listener.set(Arc::clone(&listener));

        // The connection now sees every event lifecycle; existing events
        // are replayed so its view starts complete.
        let dyn_listener: Arc<dyn EventListener> = listener;
        hub.add_listener(Arc::clone(&dyn_listener));
        endpoint.set_on_hangup(Box::new(move || {
            hub.remove_listener(&dyn_listener);
        }));

        endpoint
    }

    fn dyn_listener(&self) -> Option<Arc<dyn EventListener>> {
        self.listener
            .get()
            .map(|l| Arc::clone(l) as Arc<dyn EventListener>)
    }
}

/// Resolve the session for an incoming call: attach to the live one, or
/// create it (pinned to the presented UUID when it has the right shape).
pub fn attach_session(
    sessions: &SessionStore,
    uuid: &str,
) -> Result<Arc<junction_session::Session>, junction_session::SessionError> {
    if let Some(session) = sessions.search(uuid) {
        return Ok(session);
    }
    if uuid.len() == 36 {
        sessions.create_with(uuid, None)
    } else {
        sessions.create(None)
    }
}

impl ServerHooks for ServerStub {
    fn on_call(
        &self,
        call: IncomingCall,
        verb: &str,
        args: Value,
        session_uuid: &str,
        creds: Option<&str>,
    ) {
        let Some((api, verb)) = verb.split_once('/') else {
            let _ = call.reply(
                Value::Null,
                Some(kinds::INVALID_ARGUMENT),
                Some("expected api/verb"),
            );
            return;
        };

        let session = match attach_session(&self.sessions, session_uuid) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "cannot attach a session to the call");
                let _ = call.reply(
                    Value::Null,
                    Some(kinds::INTERNAL_ERROR),
                    Some(&e.to_string()),
                );
                return;
            }
        };

        let request = Request::new(RequestParts {
            api: api.to_owned(),
            verb: verb.to_owned(),
            args,
            session,
            token: self.token.clone(),
            creds: creds.map(str::to_owned),
            replier: Box::new(WireReplier { call: call.clone() }),
            subscriber: Some(Arc::new(WireSubscriber {
                hub: self.hub.clone(),
                listener: self.dyn_listener(),
                call,
            })),
        });

        self.apiset.call(request);
    }

    fn on_describe(&self, request: DescribeRequest) {
        let apiset = Arc::clone(&self.apiset);
        let _ = tokio::spawn(async move {
            let doc = apiset.describe_all().await;
            let _ = request.put(Some(doc));
        });
    }
}

/// Forwards hub traffic onto the wire.
struct WireListener {
    endpoint: Weak<Endpoint>,
}

impl EventListener for WireListener {
    fn on_event_create(&self, event_id: u32, name: &str) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            let _ = endpoint.event_create(event_id, name);
        }
    }

    fn on_event_remove(&self, event_id: u32, name: &str) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            let _ = endpoint.event_remove(event_id, name);
        }
    }

    fn on_event_push(&self, event_id: u32, name: &str, data: &Value) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            let _ = endpoint.event_push(event_id, name, data.clone());
        }
    }

    fn on_event_broadcast(&self, name: &str, data: &Value) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            let _ = endpoint.event_broadcast(name, data.clone());
        }
    }
}

/// Sends the request's one reply back as a `Y` frame.
struct WireReplier {
    call: IncomingCall,
}

impl Replier for WireReplier {
    fn send(&self, reply: Reply) {
        let sent = self.call.reply(
            reply.result,
            reply.error.as_deref(),
            reply.info.as_deref(),
        );
        if let Err(e) = sent {
            debug!(callid = self.call.callid(), error = %e, "reply lost to hangup");
        }
    }
}

/// Ties hub subscriptions to the originating call.
struct WireSubscriber {
    hub: EventHub,
    listener: Option<Arc<dyn EventListener>>,
    call: IncomingCall,
}

impl Subscriber for WireSubscriber {
    fn subscribe(&self, event: &Event) -> Result<(), RequestError> {
        let listener = self.listener.as_ref().ok_or(RequestError::NoSubscriber)?;
        self.hub
            .subscribe(event, listener)
            .map_err(|_| RequestError::SubscribeFailed)?;
        self.call
            .subscribe(event.id(), event.name())
            .map_err(|_| RequestError::SubscribeFailed)
    }

    fn unsubscribe(&self, event: &Event) -> Result<(), RequestError> {
        let listener = self.listener.as_ref().ok_or(RequestError::NoSubscriber)?;
        self.hub
            .unsubscribe(event, listener)
            .map_err(|_| RequestError::SubscribeFailed)?;
        self.call
            .unsubscribe(event.id(), event.name())
            .map_err(|_| RequestError::SubscribeFailed)
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────

/// A remote api presented as a local one.
///
/// Replies and describe documents are forwarded; event traffic arrives on
/// the endpoint's [`ClientHooks`](junction_wire::ClientHooks), which the
/// embedder owns.
pub struct RemoteApi {
    endpoint: Arc<Endpoint>,
}

impl RemoteApi {
    /// Wrap a client endpoint.
    pub fn new(endpoint: Arc<Endpoint>) -> Arc<RemoteApi> {
        Arc::new(RemoteApi { endpoint })
    }
}

/// Resolves the local request from the correlated reply.
struct ForwardListener {
    request: Request,
}

impl CallListener for ForwardListener {
    fn on_reply(&self, result: Value, error: Option<String>, info: Option<String>) {
        let _ = self
            .request
            .reply(result, error.as_deref(), info.as_deref());
    }
}

#[async_trait]
impl Api for RemoteApi {
    async fn call(&self, request: Request) {
        let selector = format!("{}/{}", request.api(), request.verb());
        let session_uuid = request.session().uuid().to_owned();
        let creds = request.creds().map(str::to_owned);
        let listener = Arc::new(ForwardListener {
            request: request.clone(),
        });

        if let Err(e) = self.endpoint.call(
            &selector,
            request.json_args().clone(),
            &session_uuid,
            creds.as_deref(),
            listener,
        ) {
            let _ = request.fail(kinds::DISCONNECTED, &e.to_string());
        }
    }

    async fn describe(&self) -> Value {
        let (tx, rx) = oneshot::channel();
        let sent = self.endpoint.describe(Box::new(move |doc| {
            let _ = tx.send(doc);
        }));
        match sent {
            Ok(_) => rx.await.ok().flatten().unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }
}
