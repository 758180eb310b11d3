//! `junction-call` — command-line client speaking the binary protocol.
//!
//! One-shot: `junction-call ws://host:port/v1/ws api verb '{"json":1}'`.
//! Without a call on the command line, lines of the form `api verb json`
//! are read from stdin, one call per line.
//!
//! Exit codes: 0 on success, 1 when the connection fails.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use junction_wire::{CallListener, ChannelTransport, ClientHooks, Endpoint};

#[derive(Debug, Parser)]
#[command(name = "junction-call", about = "binder command-line client")]
struct Args {
    /// Pretty-print replies.
    #[arg(long)]
    human: bool,

    /// Print replies without decoration.
    #[arg(long)]
    raw: bool,

    /// Echo each call before sending it.
    #[arg(long)]
    echo: bool,

    /// Connection token passed at upgrade.
    #[arg(long)]
    token: Option<String>,

    /// WebSocket uri of the binder, e.g. ws://localhost:1234/v1/ws.
    uri: String,

    /// Api to call.
    api: Option<String>,

    /// Verb to call.
    verb: Option<String>,

    /// JSON argument (defaults to null).
    json: Option<String>,
}

/// Prints unsolicited event traffic.
struct PrintEvents {
    human: bool,
}

impl ClientHooks for PrintEvents {
    fn on_event_create(&self, event_id: u32, event: &str) {
        eprintln!("ON-EVENT-CREATE {event} ({event_id})");
    }
    fn on_event_remove(&self, event_id: u32, event: &str) {
        eprintln!("ON-EVENT-REMOVE {event} ({event_id})");
    }
    fn on_event_push(&self, event_id: u32, event: &str, data: Value) {
        println!("ON-EVENT {event} ({event_id}): {}", render(&data, self.human));
    }
    fn on_event_broadcast(&self, event: &str, data: Value) {
        println!("ON-BROADCAST {event}: {}", render(&data, self.human));
    }
}

/// Resolves a oneshot with the reply.
struct WaitReply {
    tx: Mutex<Option<oneshot::Sender<(Value, Option<String>, Option<String>)>>>,
}

impl CallListener for WaitReply {
    fn on_reply(&self, result: Value, error: Option<String>, info: Option<String>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send((result, error, info));
        }
    }
    fn on_subscribe(&self, event_id: u32, event: &str) {
        eprintln!("ON-SUBSCRIBE {event} ({event_id})");
    }
    fn on_unsubscribe(&self, event_id: u32, event: &str) {
        eprintln!("ON-UNSUBSCRIBE {event} ({event_id})");
    }
}

fn render(value: &Value, human: bool) -> String {
    if human {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

async fn run_call(
    endpoint: &Arc<Endpoint>,
    session: &str,
    args: &Args,
    api: &str,
    verb: &str,
    json: &str,
) -> bool {
    let parsed: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(_) => Value::String(json.to_owned()),
    };
    let selector = format!("{api}/{verb}");
    if args.echo {
        println!("CALL {selector} {}", render(&parsed, args.human));
    }

    let (tx, rx) = oneshot::channel();
    let listener = Arc::new(WaitReply {
        tx: Mutex::new(Some(tx)),
    });
    if endpoint
        .call(&selector, parsed, session, None, listener)
        .is_err()
    {
        eprintln!("ERROR: connection lost");
        return false;
    }

    match rx.await {
        Ok((result, None, _)) => {
            if args.raw {
                println!("{}", render(&result, args.human));
            } else {
                println!("ON-REPLY {selector}: {}", render(&result, args.human));
            }
            true
        }
        Ok((_, Some(error), info)) => {
            eprintln!(
                "ON-REPLY {selector}: ERROR {error}{}",
                info.map(|i| format!(" ({i})")).unwrap_or_default()
            );
            true
        }
        Err(_) => {
            eprintln!("ERROR: no reply");
            false
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let uri = match &args.token {
        Some(token) => format!("{}?token={token}", args.uri),
        None => args.uri.clone(),
    };
    let mut request = match uri.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("ERROR: bad uri: {e}");
            return ExitCode::from(1);
        }
    };
    let _ = request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("x-junction-bin1"),
    );

    let (socket, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            eprintln!("ERROR: connection to {} failed: {e}", args.uri);
            return ExitCode::from(1);
        }
    };
    let (mut sink, mut stream) = socket.split();

    let (transport, mut outbound) = ChannelTransport::new();
    let endpoint = Endpoint::client(Arc::new(transport), Arc::new(PrintEvents { human: args.human }));

    // Writer: wire frames out to the socket.
    let _ = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: socket frames into the endpoint, hangup at end of stream.
    let reader_endpoint = Arc::clone(&endpoint);
    let _ = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Binary(data)) => reader_endpoint.process_frame(data),
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        reader_endpoint.hangup();
    });

    let session = uuid::Uuid::new_v4().to_string();

    match (&args.api, &args.verb) {
        (Some(api), Some(verb)) => {
            let json = args.json.clone().unwrap_or_else(|| "null".to_owned());
            let ok = run_call(&endpoint, &session, &args, api, verb, &json).await;
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        _ => {
            // Interactive: one `api verb [json]` call per stdin line.
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut parts = line.trim().splitn(3, char::is_whitespace);
                let (Some(api), Some(verb)) = (parts.next(), parts.next()) else {
                    eprintln!("use: api verb [json]");
                    continue;
                };
                let json = parts.next().unwrap_or("null").to_owned();
                if !run_call(&endpoint, &session, &args, api, verb, &json).await {
                    return ExitCode::from(1);
                }
            }
            ExitCode::SUCCESS
        }
    }
}
