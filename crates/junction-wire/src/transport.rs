//! Transport abstraction under an endpoint.
//!
//! The endpoint never touches a socket. It hands finished frames to a
//! [`Transport`] and receives incoming frames through
//! [`Endpoint::process_frame`](crate::Endpoint::process_frame). Frame
//! boundaries are the transport's responsibility (a WebSocket binary
//! message, one frame per send).

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::WireError;

/// Frames a connection may have queued before congestion drops kick in.
pub const DEFAULT_SEND_CAPACITY: usize = 32;

/// Maximum total lifetime frame drops before a channel is forcibly closed
/// as a slow client.
pub const MAX_TOTAL_DROPS: u64 = 100;

/// One direction of a binary message channel.
///
/// `send` must be atomic at the frame level: two concurrent sends may
/// interleave *frames* but never bytes within a frame, and frames from one
/// caller arrive in the order sent.
pub trait Transport: Send + Sync + 'static {
    /// Queue one frame for emission.
    fn send(&self, frame: Bytes) -> Result<(), WireError>;

    /// Ask the channel to close. Idempotent.
    fn hangup(&self);
}

/// Transport over a bounded in-process channel.
///
/// The receiving half is drained by a writer task (server side) or handed
/// straight to a peer endpoint (tests). A full queue drops the frame and
/// counts it; a channel whose lifetime drops reach [`MAX_TOTAL_DROPS`] is
/// torn down, so a stalled peer cannot pin memory. Send fails with
/// [`WireError::Disconnected`] once the receiver is gone or `hangup` ran.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    drops: AtomicU64,
}

impl ChannelTransport {
    /// Create the transport and the stream of outbound frames, with the
    /// default queue capacity.
    pub fn new() -> (ChannelTransport, mpsc::Receiver<Bytes>) {
        ChannelTransport::with_capacity(DEFAULT_SEND_CAPACITY)
    }

    /// Create the transport with an explicit queue capacity.
    pub fn with_capacity(capacity: usize) -> (ChannelTransport, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            ChannelTransport {
                tx: Mutex::new(Some(tx)),
                drops: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Total frames dropped to congestion over the channel's lifetime.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Bytes) -> Result<(), WireError> {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(WireError::Disconnected);
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(WireError::Disconnected),
            Err(TrySendError::Full(_)) => {
                counter!("ws_send_drops_total").increment(1);
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= MAX_TOTAL_DROPS {
                    warn!(drops, "disconnecting slow client");
                    drop(guard.take());
                    Err(WireError::Disconnected)
                } else {
                    warn!(total_drops = drops, "frame dropped, send queue full");
                    Err(WireError::Congested)
                }
            }
        }
    }

    fn hangup(&self) {
        // Dropping the sender closes the stream; the draining task sees
        // end-of-stream and tears the connection down.
        drop(self.tx.lock().take());
    }
}
