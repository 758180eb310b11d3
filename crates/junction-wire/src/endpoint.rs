//! Protocol endpoint: one end of a binary message channel.
//!
//! The protocol is asymmetric. A **client** endpoint emits calls and
//! describe requests and consumes replies, descriptions and the event
//! frames. A **server** endpoint consumes calls and describes and emits
//! everything else. The role is fixed at creation.
//!
//! Correlation state lives in owned maps keyed by `callid`/`descid`. A new
//! id is seeded from a counter and linearly probed until unused among the
//! in-flight ids of its kind, so uniqueness holds even across wrap-around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::{DecodeError, Message};
use crate::transport::Transport;

/// Endpoint-level failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// The transport is gone; the frame was not emitted.
    #[error("channel disconnected")]
    Disconnected,

    /// The outbound queue was full; the frame was dropped.
    #[error("channel congested, frame dropped")]
    Congested,

    /// A client-only operation was invoked on a server endpoint.
    #[error("endpoint is not a client")]
    NotClient,

    /// A server-only operation was invoked on a client endpoint.
    #[error("endpoint is not a server")]
    NotServer,
}

/// Per-call listener on the client side.
///
/// `on_reply` fires exactly once per accepted call: with the server's
/// answer, or with `"disconnected"` when the channel hangs up first.
/// Subscription notices may fire any number of times while the call is in
/// flight.
pub trait CallListener: Send + Sync {
    /// The call was answered (or cancelled by hangup).
    fn on_reply(&self, result: Value, error: Option<String>, info: Option<String>);

    /// The server subscribed this call's context to an event.
    fn on_subscribe(&self, event_id: u32, event: &str) {
        let _ = (event_id, event);
    }

    /// The server unsubscribed this call's context from an event.
    fn on_unsubscribe(&self, event_id: u32, event: &str) {
        let _ = (event_id, event);
    }
}

/// Endpoint-level callbacks on the client side.
pub trait ClientHooks: Send + Sync {
    /// An event came into existence on the server.
    fn on_event_create(&self, event_id: u32, event: &str) {
        let _ = (event_id, event);
    }

    /// An event was destroyed on the server.
    fn on_event_remove(&self, event_id: u32, event: &str) {
        let _ = (event_id, event);
    }

    /// Event data pushed to a subscription held by this endpoint.
    fn on_event_push(&self, event_id: u32, event: &str, data: Value) {
        let _ = (event_id, event, data);
    }

    /// Event data broadcast to every listener.
    fn on_event_broadcast(&self, event: &str, data: Value) {
        let _ = (event, data);
    }
}

/// Endpoint-level callbacks on the server side.
pub trait ServerHooks: Send + Sync {
    /// A call arrived. The implementation owns the reply through `call`.
    fn on_call(
        &self,
        call: IncomingCall,
        verb: &str,
        args: Value,
        session: &str,
        creds: Option<&str>,
    );

    /// A describe arrived. The default answers with a null description.
    fn on_describe(&self, request: DescribeRequest) {
        let _ = request.put(None);
    }
}

/// Scheduling hook: posts frame processing somewhere else (the job
/// engine). An `Err` return falls back to inline processing.
pub type QueuingHook = Box<dyn Fn(Box<dyn FnOnce() + Send>) -> Result<(), ()> + Send + Sync>;

/// Callback resolving a describe: the document, or `None` on hangup.
pub type DescribeCallback = Box<dyn FnOnce(Option<Value>) + Send>;

struct ClientState {
    hooks: Arc<dyn ClientHooks>,
    calls: Mutex<HashMap<u32, Arc<dyn CallListener>>>,
    describes: Mutex<HashMap<u32, DescribeCallback>>,
    callid_seed: AtomicU32,
    descid_seed: AtomicU32,
}

struct ServerState {
    hooks: Arc<dyn ServerHooks>,
}

enum Role {
    Client(ClientState),
    Server(ServerState),
}

/// One end of the binary protocol.
pub struct Endpoint {
    weak_self: Weak<Endpoint>,
    role: Role,
    transport: Arc<dyn Transport>,
    hungup: AtomicBool,
    queuing: Mutex<Option<QueuingHook>>,
    on_hangup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Endpoint {
    /// Create a client endpoint over `transport`.
    pub fn client(transport: Arc<dyn Transport>, hooks: Arc<dyn ClientHooks>) -> Arc<Endpoint> {
        Arc::new_cyclic(|weak| Endpoint {
            weak_self: weak.clone(),
            role: Role::Client(ClientState {
                hooks,
                calls: Mutex::new(HashMap::new()),
                describes: Mutex::new(HashMap::new()),
                callid_seed: AtomicU32::new(1),
                descid_seed: AtomicU32::new(1),
            }),
            transport,
            hungup: AtomicBool::new(false),
            queuing: Mutex::new(None),
            on_hangup: Mutex::new(None),
        })
    }

    /// Create a server endpoint over `transport`.
    pub fn server(transport: Arc<dyn Transport>, hooks: Arc<dyn ServerHooks>) -> Arc<Endpoint> {
        Arc::new_cyclic(|weak| Endpoint {
            weak_self: weak.clone(),
            role: Role::Server(ServerState { hooks }),
            transport,
            hungup: AtomicBool::new(false),
            queuing: Mutex::new(None),
            on_hangup: Mutex::new(None),
        })
    }

    /// Whether this endpoint emits calls.
    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client(_))
    }

    /// Whether this endpoint answers calls.
    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Install a scheduling hook for incoming frames.
    ///
    /// Without a hook, frames are processed inline on the caller of
    /// [`process_frame`](Endpoint::process_frame), in delivery order. With
    /// one, per-frame ordering across workers is not guaranteed; the
    /// protocol only requires ordering per callid, which correlation
    /// preserves.
    pub fn set_queuing(&self, hook: QueuingHook) {
        *self.queuing.lock() = Some(hook);
    }

    /// Install a callback fired once when the channel hangs up.
    pub fn set_on_hangup(&self, callback: Box<dyn FnOnce() + Send>) {
        *self.on_hangup.lock() = Some(callback);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Client side
    // ─────────────────────────────────────────────────────────────────────

    /// Emit a call. The listener's `on_reply` will fire exactly once.
    ///
    /// Returns the allocated callid. On emission failure the listener is
    /// dropped without being invoked and the error is returned instead.
    pub fn call(
        &self,
        verb: &str,
        args: Value,
        session: &str,
        creds: Option<&str>,
        listener: Arc<dyn CallListener>,
    ) -> Result<u32, WireError> {
        let Role::Client(client) = &self.role else {
            return Err(WireError::NotClient);
        };

        let callid = {
            let mut calls = client.calls.lock();
            let mut id = client.callid_seed.fetch_add(1, Ordering::Relaxed);
            while calls.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            let _ = calls.insert(id, listener);
            id
        };

        let frame = Message::Call {
            callid,
            verb: verb.to_owned(),
            session: session.to_owned(),
            args,
            creds: creds.map(str::to_owned),
        }
        .encode();

        match self.transport.send(frame) {
            Ok(()) => Ok(callid),
            Err(e) => {
                let _ = client.calls.lock().remove(&callid);
                Err(e)
            }
        }
    }

    /// Request the peer's self-description.
    ///
    /// The callback receives the description, or `None` when the channel
    /// hangs up before the answer arrives.
    pub fn describe(&self, callback: DescribeCallback) -> Result<u32, WireError> {
        let Role::Client(client) = &self.role else {
            return Err(WireError::NotClient);
        };

        let descid = {
            let mut describes = client.describes.lock();
            let mut id = client.descid_seed.fetch_add(1, Ordering::Relaxed);
            while describes.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            let _ = describes.insert(id, callback);
            id
        };

        match self.transport.send(Message::Describe { descid }.encode()) {
            Ok(()) => Ok(descid),
            Err(e) => {
                let _ = client.describes.lock().remove(&descid);
                Err(e)
            }
        }
    }

    /// Count of calls awaiting a reply.
    pub fn inflight_calls(&self) -> usize {
        match &self.role {
            Role::Client(c) => c.calls.lock().len(),
            Role::Server(_) => 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Server side
    // ─────────────────────────────────────────────────────────────────────

    /// Announce a new event to the peer.
    pub fn event_create(&self, event_id: u32, event: &str) -> Result<(), WireError> {
        self.server_send(Message::EventCreate {
            event_id,
            event: event.to_owned(),
        })
    }

    /// Announce the removal of an event to the peer.
    pub fn event_remove(&self, event_id: u32, event: &str) -> Result<(), WireError> {
        self.server_send(Message::EventRemove {
            event_id,
            event: event.to_owned(),
        })
    }

    /// Push event data to the peer (it holds a subscription).
    pub fn event_push(&self, event_id: u32, event: &str, data: Value) -> Result<(), WireError> {
        self.server_send(Message::EventPush {
            event_id,
            event: event.to_owned(),
            data,
        })
    }

    /// Broadcast event data to the peer.
    pub fn event_broadcast(&self, event: &str, data: Value) -> Result<(), WireError> {
        self.server_send(Message::EventBroadcast {
            event: event.to_owned(),
            data,
        })
    }

    fn server_send(&self, msg: Message) -> Result<(), WireError> {
        if !self.is_server() {
            return Err(WireError::NotServer);
        }
        self.transport.send(msg.encode())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reception
    // ─────────────────────────────────────────────────────────────────────

    /// Feed one incoming frame.
    ///
    /// With a queuing hook installed the frame is processed asynchronously;
    /// otherwise inline. Decode failures are local: the frame is dropped
    /// and the endpoint stays usable.
    pub fn process_frame(&self, frame: Bytes) {
        if self.hungup.load(Ordering::Acquire) {
            return;
        }
        let queued = {
            let guard = self.queuing.lock();
            match (guard.as_ref(), self.weak_self.upgrade()) {
                (Some(hook), Some(ep)) => {
                    let f = frame.clone();
                    hook(Box::new(move || ep.dispatch(&f))).is_ok()
                }
                _ => false,
            }
        };
        if !queued {
            self.dispatch(&frame);
        }
    }

    fn dispatch(&self, frame: &[u8]) {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(DecodeError::UnknownOpcode(op)) => {
                // Soft error: keep the connection.
                counter!("wire_unknown_opcodes_total").increment(1);
                debug!(opcode = op, "ignoring frame with unknown opcode");
                return;
            }
            Err(e) => {
                counter!("wire_decode_errors_total").increment(1);
                warn!(error = %e, len = frame.len(), "dropping undecodable frame");
                return;
            }
        };

        match &self.role {
            Role::Client(client) => Self::dispatch_client(client, msg),
            Role::Server(server) => self.dispatch_server(server, msg),
        }
    }

    fn strong_self(&self) -> Arc<Endpoint> {
        // The endpoint is only reachable through an Arc, so the upgrade
        // cannot fail while a frame is being dispatched.
        self.weak_self.upgrade().expect("endpoint alive")
    }

    fn dispatch_client(client: &ClientState, msg: Message) {
        match msg {
            Message::Reply {
                callid,
                error,
                info,
                result,
            } => {
                // Remove before invoking: the reply fires exactly once even
                // if a duplicate callid arrives.
                let listener = client.calls.lock().remove(&callid);
                match listener {
                    Some(listener) => listener.on_reply(result, error, info),
                    None => debug!(callid, "reply for unknown call"),
                }
            }
            Message::EventSubscribe {
                callid,
                event_id,
                event,
            } => {
                let listener = client.calls.lock().get(&callid).cloned();
                if let Some(listener) = listener {
                    listener.on_subscribe(event_id, &event);
                }
            }
            Message::EventUnsubscribe {
                callid,
                event_id,
                event,
            } => {
                let listener = client.calls.lock().get(&callid).cloned();
                if let Some(listener) = listener {
                    listener.on_unsubscribe(event_id, &event);
                }
            }
            Message::EventCreate { event_id, event } => {
                client.hooks.on_event_create(event_id, &event);
            }
            Message::EventRemove { event_id, event } => {
                client.hooks.on_event_remove(event_id, &event);
            }
            Message::EventPush {
                event_id,
                event,
                data,
            } => {
                client.hooks.on_event_push(event_id, &event, data);
            }
            Message::EventBroadcast { event, data } => {
                client.hooks.on_event_broadcast(&event, data);
            }
            Message::Description {
                descid,
                description,
            } => {
                let callback = client.describes.lock().remove(&descid);
                match callback {
                    Some(callback) => callback(Some(description)),
                    None => debug!(descid, "description for unknown describe"),
                }
            }
            Message::Call { .. } | Message::Describe { .. } => {
                counter!("wire_misdirected_frames_total").increment(1);
                debug!("server-bound frame on client endpoint, ignored");
            }
        }
    }

    fn dispatch_server(&self, server: &ServerState, msg: Message) {
        match msg {
            Message::Call {
                callid,
                verb,
                session,
                args,
                creds,
            } => {
                let call = IncomingCall {
                    endpoint: self.strong_self(),
                    callid,
                };
                server
                    .hooks
                    .on_call(call, &verb, args, &session, creds.as_deref());
            }
            Message::Describe { descid } => {
                server.hooks.on_describe(DescribeRequest {
                    endpoint: self.strong_self(),
                    descid,
                });
            }
            _ => {
                counter!("wire_misdirected_frames_total").increment(1);
                debug!("client-bound frame on server endpoint, ignored");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Hangup
    // ─────────────────────────────────────────────────────────────────────

    /// Tear the endpoint down. Idempotent.
    ///
    /// In-flight describes are answered with `None` and in-flight calls
    /// with `("disconnected", "server hung up")`, each exactly once, then
    /// the hangup callback fires and the transport is released.
    pub fn hangup(&self) {
        if self.hungup.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Role::Client(client) = &self.role {
            // Detach both maps first so late frames find nothing.
            let calls: Vec<_> = {
                let mut guard = client.calls.lock();
                guard.drain().collect()
            };
            let describes: Vec<_> = {
                let mut guard = client.describes.lock();
                guard.drain().collect()
            };

            for (_, listener) in calls {
                listener.on_reply(
                    Value::Null,
                    Some("disconnected".to_owned()),
                    Some("server hung up".to_owned()),
                );
            }
            for (_, callback) in describes {
                callback(None);
            }
        }

        if let Some(callback) = self.on_hangup.lock().take() {
            callback();
        }

        self.transport.hangup();
    }
}

/// A call received by a server endpoint. Answering, subscribing and
/// unsubscribing all reference the originating callid; subscription frames
/// are only meaningful while the call is in flight on the peer.
#[derive(Clone)]
pub struct IncomingCall {
    endpoint: Arc<Endpoint>,
    callid: u32,
}

impl IncomingCall {
    /// The peer's correlation id for this call.
    pub fn callid(&self) -> u32 {
        self.callid
    }

    /// Emit the reply.
    pub fn reply(
        &self,
        result: Value,
        error: Option<&str>,
        info: Option<&str>,
    ) -> Result<(), WireError> {
        self.endpoint.transport.send(
            Message::Reply {
                callid: self.callid,
                error: error.map(str::to_owned),
                info: info.map(str::to_owned),
                result,
            }
            .encode(),
        )
    }

    /// Tie a subscription to this call.
    pub fn subscribe(&self, event_id: u32, event: &str) -> Result<(), WireError> {
        self.endpoint.transport.send(
            Message::EventSubscribe {
                callid: self.callid,
                event_id,
                event: event.to_owned(),
            }
            .encode(),
        )
    }

    /// Revoke a subscription tied to this call.
    pub fn unsubscribe(&self, event_id: u32, event: &str) -> Result<(), WireError> {
        self.endpoint.transport.send(
            Message::EventUnsubscribe {
                callid: self.callid,
                event_id,
                event: event.to_owned(),
            }
            .encode(),
        )
    }

    /// The endpoint this call arrived on.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

/// A describe received by a server endpoint.
pub struct DescribeRequest {
    endpoint: Arc<Endpoint>,
    descid: u32,
}

impl DescribeRequest {
    /// Answer with the description (`None` encodes as JSON null).
    pub fn put(self, description: Option<Value>) -> Result<(), WireError> {
        self.endpoint.transport.send(
            Message::Description {
                descid: self.descid,
                description: description.unwrap_or(Value::Null),
            }
            .encode(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Records every listener invocation for assertions.
    #[derive(Default)]
    struct Recorder {
        replies: PlMutex<Vec<(Value, Option<String>, Option<String>)>>,
        subscribes: PlMutex<Vec<(u32, String)>>,
        unsubscribes: PlMutex<Vec<(u32, String)>>,
    }

    impl CallListener for Recorder {
        fn on_reply(&self, result: Value, error: Option<String>, info: Option<String>) {
            self.replies.lock().push((result, error, info));
        }
        fn on_subscribe(&self, event_id: u32, event: &str) {
            self.subscribes.lock().push((event_id, event.to_owned()));
        }
        fn on_unsubscribe(&self, event_id: u32, event: &str) {
            self.unsubscribes.lock().push((event_id, event.to_owned()));
        }
    }

    #[derive(Default)]
    struct ClientRecorder {
        pushes: PlMutex<Vec<(u32, String, Value)>>,
        broadcasts: PlMutex<Vec<(String, Value)>>,
        creates: PlMutex<Vec<(u32, String)>>,
        removes: PlMutex<Vec<(u32, String)>>,
    }

    impl ClientHooks for ClientRecorder {
        fn on_event_create(&self, event_id: u32, event: &str) {
            self.creates.lock().push((event_id, event.to_owned()));
        }
        fn on_event_remove(&self, event_id: u32, event: &str) {
            self.removes.lock().push((event_id, event.to_owned()));
        }
        fn on_event_push(&self, event_id: u32, event: &str, data: Value) {
            self.pushes.lock().push((event_id, event.to_owned(), data));
        }
        fn on_event_broadcast(&self, event: &str, data: Value) {
            self.broadcasts.lock().push((event.to_owned(), data));
        }
    }

    /// Server hooks that answer `ping` with `"pong"` and anything else
    /// with an error, optionally subscribing first.
    struct PingServer {
        subscribe_first: bool,
    }

    impl ServerHooks for PingServer {
        fn on_call(
            &self,
            call: IncomingCall,
            verb: &str,
            _args: Value,
            _session: &str,
            _creds: Option<&str>,
        ) {
            if self.subscribe_first {
                call.subscribe(11, "x").unwrap();
            }
            if verb == "ping" {
                call.reply(json!("pong"), None, None).unwrap();
            } else {
                call.reply(Value::Null, Some("unknown-verb"), Some(verb))
                    .unwrap();
            }
        }
    }

    struct Link {
        client: Arc<Endpoint>,
        server: Arc<Endpoint>,
        c2s: mpsc::Receiver<Bytes>,
        s2c: mpsc::Receiver<Bytes>,
        client_hooks: Arc<ClientRecorder>,
    }

    impl Link {
        fn new(server_hooks: Arc<dyn ServerHooks>) -> Link {
            // Roomy queues: these tests enqueue bursts without draining.
            let (ct, c2s) = ChannelTransport::with_capacity(256);
            let (st, s2c) = ChannelTransport::with_capacity(256);
            let client_hooks = Arc::new(ClientRecorder::default());
            let client = Endpoint::client(Arc::new(ct), client_hooks.clone());
            let server = Endpoint::server(Arc::new(st), server_hooks);
            Link {
                client,
                server,
                c2s,
                s2c,
                client_hooks,
            }
        }

        /// Deliver queued frames in both directions until quiescent.
        fn pump(&mut self) {
            loop {
                let mut moved = false;
                while let Ok(frame) = self.c2s.try_recv() {
                    self.server.process_frame(frame);
                    moved = true;
                }
                while let Ok(frame) = self.s2c.try_recv() {
                    self.client.process_frame(frame);
                    moved = true;
                }
                if !moved {
                    break;
                }
            }
        }
    }

    #[test]
    fn happy_call_replies_exactly_once() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        let recorder = Arc::new(Recorder::default());
        let callid = link
            .client
            .call(
                "ping",
                json!({}),
                "123456789012345678901234567890123456",
                None,
                recorder.clone(),
            )
            .unwrap();
        assert_eq!(link.client.inflight_calls(), 1);
        link.pump();

        let replies = recorder.replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], (json!("pong"), None, None));
        assert_eq!(link.client.inflight_calls(), 0);
        let _ = callid;
    }

    #[test]
    fn hangup_mid_call_reports_disconnected_once_per_call() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        let r7 = Arc::new(Recorder::default());
        let r8 = Arc::new(Recorder::default());
        let _ = link.client.call("ping", json!({}), "s", None, r7.clone()).unwrap();
        let _ = link.client.call("ping", json!({}), "s", None, r8.clone()).unwrap();

        // Server goes away before any reply is delivered.
        link.client.hangup();
        link.client.hangup(); // idempotent

        for r in [&r7, &r8] {
            let replies = r.replies.lock();
            assert_eq!(replies.len(), 1);
            assert_eq!(
                replies[0],
                (
                    Value::Null,
                    Some("disconnected".to_owned()),
                    Some("server hung up".to_owned())
                )
            );
        }

        // A reply arriving after hangup is not delivered.
        link.pump();
        assert_eq!(r7.replies.lock().len(), 1);
    }

    #[test]
    fn subscribe_is_bound_to_the_call_and_push_arrives_after_reply() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: true,
        }));
        let recorder = Arc::new(Recorder::default());
        let _ = link
            .client
            .call("ping", json!({}), "s", None, recorder.clone())
            .unwrap();
        link.pump();

        assert_eq!(recorder.subscribes.lock().as_slice(), &[(11, "x".to_owned())]);
        assert_eq!(recorder.replies.lock().len(), 1);

        // Push after the reply still reaches the endpoint hooks.
        link.server.event_push(11, "x", json!({"v": 1})).unwrap();
        link.pump();
        let pushes = link.client_hooks.pushes.lock();
        assert_eq!(pushes.as_slice(), &[(11, "x".to_owned(), json!({"v": 1}))]);
    }

    #[test]
    fn event_lifecycle_reaches_client_hooks() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        link.server.event_create(4, "hello/started").unwrap();
        link.server
            .event_broadcast("hello/alert", json!({"level": 1}))
            .unwrap();
        link.server.event_remove(4, "hello/started").unwrap();
        link.pump();

        assert_eq!(
            link.client_hooks.creates.lock().as_slice(),
            &[(4, "hello/started".to_owned())]
        );
        assert_eq!(
            link.client_hooks.broadcasts.lock().as_slice(),
            &[("hello/alert".to_owned(), json!({"level": 1}))]
        );
        assert_eq!(
            link.client_hooks.removes.lock().as_slice(),
            &[(4, "hello/started".to_owned())]
        );
    }

    #[test]
    fn describe_roundtrip_and_hangup_cancellation() {
        struct Describing;
        impl ServerHooks for Describing {
            fn on_call(&self, _: IncomingCall, _: &str, _: Value, _: &str, _: Option<&str>) {}
            fn on_describe(&self, request: DescribeRequest) {
                request.put(Some(json!({"api": "hello"}))).unwrap();
            }
        }

        let mut link = Link::new(Arc::new(Describing));
        let got = Arc::new(PlMutex::new(Vec::new()));
        let g = got.clone();
        let _ = link
            .client
            .describe(Box::new(move |d| g.lock().push(d)))
            .unwrap();
        link.pump();
        assert_eq!(got.lock().as_slice(), &[Some(json!({"api": "hello"}))]);

        // A second describe cancelled by hangup yields None.
        let g = got.clone();
        let _ = link
            .client
            .describe(Box::new(move |d| g.lock().push(d)))
            .unwrap();
        link.client.hangup();
        assert_eq!(got.lock().len(), 2);
        assert_eq!(got.lock()[1], None);
    }

    #[test]
    fn callids_are_unique_among_inflight_calls() {
        let link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = link
                .client
                .call("ping", json!({}), "s", None, Arc::new(Recorder::default()))
                .unwrap();
            assert!(seen.insert(id), "callid {id} reused while in flight");
        }
    }

    #[test]
    fn unknown_opcode_is_ignored_and_endpoint_survives() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        link.server.process_frame(Bytes::from_static(b"Z\x00\x01"));
        // Misdirected frame (reply sent to the server) is also ignored.
        link.server.process_frame(
            Message::Reply {
                callid: 1,
                error: None,
                info: None,
                result: Value::Null,
            }
            .encode(),
        );

        let recorder = Arc::new(Recorder::default());
        let _ = link
            .client
            .call("ping", json!({}), "s", None, recorder.clone())
            .unwrap();
        link.pump();
        assert_eq!(recorder.replies.lock().len(), 1);
    }

    #[test]
    fn truncated_frame_is_dropped_and_endpoint_survives() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        let full = Message::Call {
            callid: 3,
            verb: "ping".into(),
            session: "s".into(),
            args: json!({}),
            creds: None,
        }
        .encode();
        link.server.process_frame(full.slice(..full.len() - 2));

        let recorder = Arc::new(Recorder::default());
        let _ = link
            .client
            .call("ping", json!({}), "s", None, recorder.clone())
            .unwrap();
        link.pump();
        assert_eq!(recorder.replies.lock().len(), 1);
    }

    #[test]
    fn queuing_hook_receives_frame_processing() {
        let mut link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        let queued = Arc::new(AtomicUsize::new(0));
        let pending: Arc<PlMutex<Vec<Box<dyn FnOnce() + Send>>>> =
            Arc::new(PlMutex::new(Vec::new()));
        let q = queued.clone();
        let p = pending.clone();
        link.server.set_queuing(Box::new(move |work| {
            let _ = q.fetch_add(1, Ordering::Relaxed);
            p.lock().push(work);
            Ok(())
        }));

        let recorder = Arc::new(Recorder::default());
        let _ = link
            .client
            .call("ping", json!({}), "s", None, recorder.clone())
            .unwrap();
        while let Ok(frame) = link.c2s.try_recv() {
            link.server.process_frame(frame);
        }
        assert_eq!(queued.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.replies.lock().len(), 0);

        // Running the deferred work produces the reply.
        for work in pending.lock().drain(..) {
            work();
        }
        link.pump();
        assert_eq!(recorder.replies.lock().len(), 1);
    }

    #[test]
    fn send_after_hangup_fails_without_leaking_state() {
        let link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        link.client.hangup();
        let err = link
            .client
            .call("ping", json!({}), "s", None, Arc::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err, WireError::Disconnected);
        assert_eq!(link.client.inflight_calls(), 0);
    }

    #[test]
    fn role_checks() {
        let link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        assert!(link.client.is_client() && !link.client.is_server());
        assert!(link.server.is_server() && !link.server.is_client());
        assert_eq!(
            link.server
                .call("x", Value::Null, "s", None, Arc::new(Recorder::default()))
                .unwrap_err(),
            WireError::NotClient
        );
        assert_eq!(
            link.client.event_broadcast("x", Value::Null).unwrap_err(),
            WireError::NotServer
        );
    }

    #[test]
    fn hangup_callback_fires_once() {
        let link = Link::new(Arc::new(PingServer {
            subscribe_first: false,
        }));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        link.client.set_on_hangup(Box::new(move || {
            let _ = f.fetch_add(1, Ordering::Relaxed);
        }));
        link.client.hangup();
        link.client.hangup();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
