//! Uniform file-descriptor readiness source.
//!
//! An [`Fdev`] registers a descriptor with the runtime's reactor and
//! dispatches readiness to a callback from a background task. The callback
//! must consume the readiness (read or write the descriptor); readiness is
//! edge-managed, so an unconsumed event will not be redelivered.
//!
//! Dropping the handle deregisters the descriptor. With `autoclose` the
//! descriptor is closed on teardown, otherwise it is handed back to the
//! caller's ownership untouched.

use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Which readiness to watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdInterest {
    /// The descriptor is readable.
    Read,
    /// The descriptor is writable.
    Write,
}

/// Dispatch policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdRepeat {
    /// Dispatch once, then deregister.
    OneShot,
    /// Dispatch on every readiness until dropped.
    Repeat,
}

/// A registered descriptor. Dropping it stops dispatch.
pub struct Fdev {
    stop: CancellationToken,
}

impl Fdev {
    /// Register `fd` and dispatch readiness to `callback`.
    ///
    /// The descriptor must already be in non-blocking mode. `autoclose`
    /// decides whether teardown closes it.
    pub fn new<C>(
        fd: OwnedFd,
        interest: FdInterest,
        repeat: FdRepeat,
        autoclose: bool,
        mut callback: C,
    ) -> std::io::Result<Fdev>
    where
        C: FnMut(BorrowedFd<'_>) + Send + 'static,
    {
        let tokio_interest = match interest {
            FdInterest::Read => Interest::READABLE,
            FdInterest::Write => Interest::WRITABLE,
        };
        let afd = AsyncFd::with_interest(fd, tokio_interest)?;
        let stop = CancellationToken::new();

        let token = stop.clone();
        let _ = tokio::spawn(async move {
            loop {
                let ready = tokio::select! {
                    () = token.cancelled() => break,
                    ready = afd.ready(tokio_interest) => ready,
                };
                match ready {
                    Ok(mut guard) => {
                        callback(afd.get_ref().as_fd());
                        guard.clear_ready();
                        if repeat == FdRepeat::OneShot {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            trace!("fdev dispatch ended");
            if !autoclose {
                // Hand the descriptor back to the caller's ownership.
                let _ = afd.into_inner().into_raw_fd();
            }
        });

        Ok(Fdev { stop })
    }
}

impl Drop for Fdev {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
