//! Deadline supervision for running jobs.
//!
//! The engine runs every job under a watchdog. A job with a non-zero
//! timeout is cancelled at its deadline: the watchdog fires the job's
//! cancellation token (so cooperative work can wind down) and stops
//! polling the job future, which drops it at its current suspension
//! point. Fatal faults are not recovered; they abort the process.

use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::JobFuture;

/// How a supervised job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The job ran to completion.
    Done,
    /// The watchdog cancelled the job at its deadline.
    TimedOut,
    /// The job was cancelled before it ran (engine shutdown).
    Cancelled,
}

/// Poll `fut` to completion, bounded by `timeout` when non-zero.
///
/// On expiry the `token` is cancelled before the future is dropped so
/// anything the job spawned or shares the token with observes the
/// cancellation.
pub(crate) async fn supervise(timeout: Duration, token: CancellationToken, fut: JobFuture) -> Outcome {
    if timeout.is_zero() {
        fut.await;
        return Outcome::Done;
    }

    let started = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(()) => Outcome::Done,
        Err(_) => {
            token.cancel();
            counter!("jobs_watchdog_timeouts_total").increment(1);
            warn!(
                timeout_s = timeout.as_secs_f64(),
                ran_s = started.elapsed().as_secs_f64(),
                "job exceeded its deadline, cancelled"
            );
            Outcome::TimedOut
        }
    }
}
