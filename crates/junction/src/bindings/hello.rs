//! The built-in `hello` binding.
//!
//! A demonstration api exercising the whole verb surface: plain replies,
//! failures, tagged events with subscription management, session LOA and
//! token verbs, and binding-private session context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use junction_api::{kinds, Binding, Event, EventHub, Request, Verb};
use junction_session::AuthRequirement;

/// Build the `hello` binding over `hub`.
pub fn binding(hub: &EventHub) -> Binding {
    let count = Arc::new(AtomicU32::new(0));
    let events: Arc<Mutex<HashMap<String, Event>>> = Arc::default();

    let hub = hub.clone();
    let ev_add = Arc::clone(&events);
    let ev_del = Arc::clone(&events);
    let ev_sub = Arc::clone(&events);
    let ev_unsub = Arc::clone(&events);
    let ev_push = Arc::clone(&events);

    Binding::new("hello")
        .info("demonstration api of the binder")
        .verb(
            Verb::new("ping", move |request: Request| {
                let count = Arc::clone(&count);
                async move {
                    let n = count.fetch_add(1, Ordering::Relaxed) + 1;
                    let _ = request.success(json!({ "pong": n }));
                }
            })
            .info("answers pong with a call count"),
        )
        .verb(
            Verb::new("fail", |request: Request| async move {
                let _ = request.fail("failed", "intentional failure");
            })
            .info("always fails"),
        )
        .verb(
            Verb::new("args", |request: Request| async move {
                let _ = request.success(request.json_args().clone());
            })
            .info("echoes the json argument"),
        )
        .verb(
            Verb::new("eventadd", move |request: Request| {
                let hub = hub.clone();
                let events = Arc::clone(&ev_add);
                async move {
                    let (Some(tag), Some(name)) = (request.value("tag"), request.value("name"))
                    else {
                        let _ = request.fail(kinds::INVALID_ARGUMENT, "tag and name required");
                        return;
                    };
                    let mut events = events.lock();
                    if events.contains_key(&tag) {
                        let _ = request.fail(kinds::INVALID_ARGUMENT, "tag already exists");
                        return;
                    }
                    let _ = events.insert(tag, hub.create(&format!("hello/{name}")));
                    let _ = request.success(Value::Null);
                }
            })
            .info("creates the event of the given tag and name"),
        )
        .verb(
            Verb::new("eventdel", move |request: Request| {
                let events = Arc::clone(&ev_del);
                async move {
                    match request.value("tag") {
                        Some(tag) if events.lock().remove(&tag).is_some() => {
                            let _ = request.success(Value::Null);
                        }
                        Some(_) => {
                            let _ = request.fail(kinds::INVALID_ARGUMENT, "unknown tag");
                        }
                        None => {
                            let _ = request.fail(kinds::INVALID_ARGUMENT, "tag required");
                        }
                    }
                }
            })
            .info("removes the event of the given tag"),
        )
        .verb(
            Verb::new("eventsub", move |request: Request| {
                let events = Arc::clone(&ev_sub);
                async move {
                    let event = request.value("tag").and_then(|t| events.lock().get(&t).cloned());
                    match event {
                        Some(event) => match request.subscribe(&event) {
                            Ok(()) => {
                                let _ = request.success(Value::Null);
                            }
                            Err(e) => {
                                let _ = request.fail(kinds::INTERNAL_ERROR, &e.to_string());
                            }
                        },
                        None => {
                            let _ = request.fail(kinds::INVALID_ARGUMENT, "unknown tag");
                        }
                    }
                }
            })
            .info("subscribes to the event of the given tag"),
        )
        .verb(
            Verb::new("eventunsub", move |request: Request| {
                let events = Arc::clone(&ev_unsub);
                async move {
                    let event = request.value("tag").and_then(|t| events.lock().get(&t).cloned());
                    match event {
                        Some(event) => match request.unsubscribe(&event) {
                            Ok(()) => {
                                let _ = request.success(Value::Null);
                            }
                            Err(e) => {
                                let _ = request.fail(kinds::INTERNAL_ERROR, &e.to_string());
                            }
                        },
                        None => {
                            let _ = request.fail(kinds::INVALID_ARGUMENT, "unknown tag");
                        }
                    }
                }
            })
            .info("unsubscribes from the event of the given tag"),
        )
        .verb(
            Verb::new("eventpush", move |request: Request| {
                let events = Arc::clone(&ev_push);
                async move {
                    let event = request.value("tag").and_then(|t| events.lock().get(&t).cloned());
                    match event {
                        Some(event) => {
                            let data = request.json_args().get("data").cloned().unwrap_or(Value::Null);
                            let reached = event.push(&data);
                            let _ = request.success(json!({ "reached": reached }));
                        }
                        None => {
                            let _ = request.fail(kinds::INVALID_ARGUMENT, "unknown tag");
                        }
                    }
                }
            })
            .info("pushes data on the event of the given tag"),
        )
        .verb(
            Verb::new("login", |request: Request| async move {
                if request.session().loa() > 0 {
                    let _ = request.fail(kinds::INVALID_ARGUMENT, "already logged in");
                    return;
                }
                let _ = request.set_loa(1);
                let _ = request.success(json!({ "token": request.session().token() }));
            })
            .info("opens the session at loa 1"),
        )
        .verb(
            Verb::new("refresh", |request: Request| async move {
                // The renewed token is produced after the verb; hand the
                // client what it needs to read it back.
                let _ = request.success(Value::Null);
            })
            .auth(AuthRequirement::checked().renewing())
            .info("renews the session token"),
        )
        .verb(
            Verb::new("logout", |request: Request| async move {
                let _ = request.success(Value::Null);
            })
            .auth(AuthRequirement::checked().closing())
            .info("closes the session"),
        )
        .verb(
            Verb::new("set-loa", |request: Request| async move {
                let loa = request
                    .json_args()
                    .get("loa")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u8;
                match request.set_loa(loa) {
                    Ok(()) => {
                        let _ = request.success(json!({ "loa": loa }));
                    }
                    Err(e) => {
                        let _ = request.fail(kinds::INVALID_ARGUMENT, &e.to_string());
                    }
                }
            })
            .auth(AuthRequirement::checked())
            .info("sets the session loa, 0..=3"),
        )
        .verb(
            Verb::new("admin", |request: Request| async move {
                let _ = request.success(json!("you are admin"));
            })
            .auth(AuthRequirement::with_loa(3))
            .info("requires loa 3"),
        )
        .verb(
            Verb::new("context-set", |request: Request| async move {
                let value = request.json_args().clone();
                match request.context_set(Arc::new(value), None) {
                    Ok(()) => {
                        let _ = request.success(Value::Null);
                    }
                    Err(e) => {
                        let _ = request.fail(kinds::INTERNAL_ERROR, &e.to_string());
                    }
                }
            })
            .info("stores the argument as session context"),
        )
        .verb(
            Verb::new("context-get", |request: Request| async move {
                let value = request
                    .context_get()
                    .and_then(|v| v.downcast::<Value>().ok())
                    .map_or(Value::Null, |v| (*v).clone());
                let _ = request.success(value);
            })
            .info("returns the stored session context"),
        )
}
