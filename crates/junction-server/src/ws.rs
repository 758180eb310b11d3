//! The WebSocket front door.
//!
//! One route serves two subprotocols, negotiated at upgrade:
//!
//! - [`SUBPROTOCOL_BINARY`] — raw binary protocol frames, one frame per
//!   WebSocket binary message, glued to the api set by a
//!   [`ServerStub`](junction_api::ServerStub).
//! - [`SUBPROTOCOL_JSON1`] — the JSON envelope of [`crate::json1`],
//!   bridged 1-to-1 onto the same dispatch path.
//!
//! A connection-level token may ride in the upgrade query
//! (`/v1/ws?token=…&uuid=…`); the JSON envelope can override it per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use junction_api::events::EventListener;
use junction_api::{attach_session, kinds, Event, Reply, Replier, Request, RequestError, RequestParts, ServerStub, Subscriber};
use junction_wire::{ChannelTransport, DEFAULT_SEND_CAPACITY, MAX_TOTAL_DROPS};

use crate::json1;
use crate::server::AppState;

/// Subprotocol token of the binary framing protocol.
pub const SUBPROTOCOL_BINARY: &str = "x-junction-bin1";
/// Subprotocol token of the JSON envelope.
pub const SUBPROTOCOL_JSON1: &str = "x-junction-json1";

/// Upgrade-time parameters.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Connection-level authentication token.
    pub token: Option<String>,
    /// Session the connection wants to attach to.
    pub uuid: Option<String>,
}

/// `GET /v1/ws` — upgrade and serve until hangup.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.protocols([SUBPROTOCOL_BINARY, SUBPROTOCOL_JSON1])
        .on_upgrade(move |socket| serve_connection(state, query, socket))
}

async fn serve_connection(state: Arc<AppState>, query: WsQuery, socket: WebSocket) {
    let protocol = socket
        .protocol()
        .and_then(|value| value.to_str().ok())
        .unwrap_or(SUBPROTOCOL_BINARY)
        .to_owned();
    counter!(crate::metrics::WS_CONNECTIONS_TOTAL, "protocol" => protocol.clone()).increment(1);
    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(protocol = %protocol, "websocket connection opened");

    if protocol == SUBPROTOCOL_JSON1 {
        json1_connection(state, query, socket).await;
    } else {
        binary_connection(state, query, socket).await;
    }

    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(protocol = %protocol, "websocket connection closed");
}

/// Binary mode: frames go straight to a wire endpoint behind a stub.
async fn binary_connection(state: Arc<AppState>, query: WsQuery, mut socket: WebSocket) {
    let (transport, mut outbound) = ChannelTransport::new();
    let endpoint = ServerStub::serve(
        Arc::new(transport),
        Arc::clone(&state.apiset),
        Arc::clone(&state.sessions),
        state.hub.clone(),
        query.token,
    );

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if socket.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(data))) => endpoint.process_frame(data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
        }
    }

    endpoint.hangup();
}

/// JSON mode: envelopes bridged onto the dispatch path.
async fn json1_connection(state: Arc<AppState>, query: WsQuery, mut socket: WebSocket) {
    let (out_tx, mut outbound) = Json1Outbound::new();
    let listener: Arc<dyn EventListener> = Arc::new(Json1Listener {
        out: Arc::clone(&out_tx),
    });
    state.hub.add_listener(Arc::clone(&listener));

    // Calls without an explicit uuid share one session per connection.
    let default_uuid = query
        .uuid
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    loop {
        tokio::select! {
            text = outbound.recv() => match text {
                Some(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_envelope(&state, &query.token, &default_uuid, &listener, &out_tx, text.as_str());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
        }
    }

    state.hub.remove_listener(&listener);
}

fn handle_envelope(
    state: &Arc<AppState>,
    connection_token: &Option<String>,
    default_uuid: &str,
    listener: &Arc<dyn EventListener>,
    out: &Arc<Json1Outbound>,
    text: &str,
) {
    let call = match json1::parse_call(text) {
        Ok(call) => call,
        Err(e) => {
            counter!(crate::metrics::JSON1_BAD_FRAMES_TOTAL).increment(1);
            debug!(error = %e, "dropping malformed envelope");
            return;
        }
    };

    let replier = Json1Replier {
        msgid: call.msgid.clone(),
        out: Arc::clone(out),
    };

    let Some((api, verb)) = call.selector.split_once('/') else {
        replier.send(Reply::failure(
            kinds::INVALID_ARGUMENT,
            Some("expected api/verb"),
        ));
        return;
    };

    let uuid = call.uuid.as_deref().unwrap_or(default_uuid);
    let session = match attach_session(&state.sessions, uuid) {
        Ok(session) => session,
        Err(e) => {
            replier.send(Reply::failure(kinds::INTERNAL_ERROR, Some(&e.to_string())));
            return;
        }
    };

    let request = Request::new(RequestParts {
        api: api.to_owned(),
        verb: verb.to_owned(),
        args: call.args,
        session,
        token: call.token.or_else(|| connection_token.clone()),
        creds: None,
        replier: Box::new(replier),
        subscriber: Some(Arc::new(Json1Subscriber {
            hub: state.hub.clone(),
            listener: Arc::clone(listener),
        })),
    });

    state.apiset.call(request);
}

/// Bounded outbound queue of one JSON connection, with slow-client drop
/// accounting.
///
/// A full queue drops the frame and counts it; a connection whose
/// lifetime drops reach [`MAX_TOTAL_DROPS`] is torn down — the channel
/// closes, the serve loop sees end-of-stream, and the socket goes away.
struct Json1Outbound {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    drops: AtomicU64,
}

impl Json1Outbound {
    fn new() -> (Arc<Json1Outbound>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(DEFAULT_SEND_CAPACITY);
        (
            Arc::new(Json1Outbound {
                tx: Mutex::new(Some(tx)),
                drops: AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Queue a frame. Returns whether it was accepted.
    fn send(&self, frame: String) -> bool {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(_)) => {
                counter!(crate::metrics::WS_SEND_DROPS_TOTAL).increment(1);
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= MAX_TOTAL_DROPS {
                    warn!(drops, "disconnecting slow json1 client");
                    drop(guard.take());
                } else {
                    warn!(total_drops = drops, "frame dropped, send queue full");
                }
                false
            }
        }
    }

    /// Total frames dropped to congestion over the connection's lifetime.
    fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Delivers event envelopes to one JSON connection.
struct Json1Listener {
    out: Arc<Json1Outbound>,
}

impl EventListener for Json1Listener {
    fn on_event_create(&self, _event_id: u32, _name: &str) {
        // The envelope has no lifecycle frames.
    }

    fn on_event_remove(&self, _event_id: u32, _name: &str) {}

    fn on_event_push(&self, _event_id: u32, name: &str, data: &Value) {
        let _ = self.out.send(json1::event_frame(name, data));
    }

    fn on_event_broadcast(&self, name: &str, data: &Value) {
        let _ = self.out.send(json1::event_frame(name, data));
    }
}

/// Sends the reply envelope, once.
struct Json1Replier {
    msgid: Value,
    out: Arc<Json1Outbound>,
}

impl Replier for Json1Replier {
    fn send(&self, reply: Reply) {
        let _ = self.out.send(json1::reply_frame(&self.msgid, &reply));
    }
}

/// Ties hub subscriptions to the connection's listener.
struct Json1Subscriber {
    hub: junction_api::EventHub,
    listener: Arc<dyn EventListener>,
}

impl Subscriber for Json1Subscriber {
    fn subscribe(&self, event: &Event) -> Result<(), RequestError> {
        self.hub
            .subscribe(event, &self.listener)
            .map_err(|_| RequestError::SubscribeFailed)
    }

    fn unsubscribe(&self, event: &Event) -> Result<(), RequestError> {
        self.hub
            .unsubscribe(event, &self.listener)
            .map_err(|_| RequestError::SubscribeFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json1_outbound_delivers_until_full() {
        let (out, mut rx) = Json1Outbound::new();
        assert!(out.send("one".to_owned()));
        assert!(out.send("two".to_owned()));
        assert_eq!(rx.try_recv().unwrap(), "one");
        assert_eq!(rx.try_recv().unwrap(), "two");
        assert_eq!(out.drop_count(), 0);

        // Fill the queue, then everything bounces.
        for i in 0..DEFAULT_SEND_CAPACITY {
            assert!(out.send(format!("frame-{i}")));
        }
        assert!(!out.send("overflow".to_owned()));
        assert_eq!(out.drop_count(), 1);
    }

    #[test]
    fn json1_outbound_disconnects_slow_client_after_threshold() {
        let (out, mut rx) = Json1Outbound::new();
        for i in 0..DEFAULT_SEND_CAPACITY {
            assert!(out.send(format!("frame-{i}")));
        }

        // Dropped but tolerated below the threshold.
        for _ in 0..MAX_TOTAL_DROPS - 1 {
            assert!(!out.send("lost".to_owned()));
        }
        // The drop crossing the threshold closes the channel.
        assert!(!out.send("lost".to_owned()));
        assert_eq!(out.drop_count(), MAX_TOTAL_DROPS);

        // Buffered frames still drain, then the stream ends — which is
        // what makes the serve loop tear the socket down.
        for _ in 0..DEFAULT_SEND_CAPACITY {
            assert!(rx.try_recv().is_ok());
        }
        assert!(rx.try_recv().is_err());

        // Closed for good; later sends are not counted as drops.
        assert!(!out.send("late".to_owned()));
        assert_eq!(out.drop_count(), MAX_TOTAL_DROPS);
    }

    #[test]
    fn json1_outbound_keeps_fast_client() {
        let (out, mut rx) = Json1Outbound::new();
        for round in 0..20 {
            assert!(out.send(json!({"round": round}).to_string()));
            // Drain to keep the queue clear (simulating a fast client).
            while rx.try_recv().is_ok() {}
        }
        assert_eq!(out.drop_count(), 0);
    }
}

