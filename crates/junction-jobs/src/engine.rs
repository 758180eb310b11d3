//! The job engine: bounded parallelism, FIFO with per-group mutual
//! exclusion, deadlines, and a reentrant wait primitive.
//!
//! Jobs share a single FIFO. A worker picks the first job whose group is
//! not currently running; jobs of one group therefore execute one at a
//! time, in enqueue order. Workers are tokio tasks, started lazily up to
//! `allowed`, and `allowed` caps *logical* parallelism: a worker parked in
//! [`JobEngine::enter`] keeps its slot and keeps processing unrelated jobs
//! while it waits, so nested waits cannot starve the pool.
//!
//! Cancellation is cooperative. Every job receives a [`JobContext`] whose
//! token fires at the deadline; a job that ignores it is dropped at its
//! next suspension point. Jobs still pending at [`JobEngine::terminate`]
//! are invoked exactly once with [`JobCause::Cancelled`] so they can
//! release what they hold.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::poll;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::watchdog::{self, Outcome};

/// Opaque serialization key. Jobs sharing a group never run concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Group(u64);

impl Group {
    /// Allocate a key distinct from every other one in this process.
    pub fn fresh() -> Group {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Group(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Key derived from hashing `value`, stable within the process.
    ///
    /// A hash collision only merges two serialization domains, which is
    /// harmless for correctness.
    pub fn of<T: std::hash::Hash>(value: T) -> Group {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Group(hasher.finish())
    }
}

/// Why a job callback is being invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobCause {
    /// Normal execution.
    Run,
    /// The job will never run; clean up only.
    Cancelled,
}

/// Handed to every job callback.
#[derive(Clone)]
pub struct JobContext {
    cause: JobCause,
    token: CancellationToken,
}

impl JobContext {
    /// Why the callback fired.
    pub fn cause(&self) -> JobCause {
        self.cause
    }

    /// True when the job is being cancelled instead of run.
    pub fn is_cancelled(&self) -> bool {
        self.cause == JobCause::Cancelled
    }

    /// Token fired at the job's deadline or at engine shutdown.
    ///
    /// Long-running jobs should pass it to anything they spawn and yield
    /// at suspension points so cancellation stays prompt.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// Engine failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    /// The pending-job budget is exhausted.
    #[error("too many pending jobs")]
    Busy,

    /// The engine is terminating and accepts no new work.
    #[error("engine is stopping")]
    Stopping,

    /// An `enter` wait exceeded its timeout.
    #[error("wait timed out")]
    Timeout,
}

/// Pool sizing.
#[derive(Clone, Copy, Debug)]
pub struct JobConfig {
    /// Maximum count of concurrently working slots.
    pub allowed: usize,
    /// Maximum count of jobs waiting in the FIFO.
    pub pending: usize,
}

impl Default for JobConfig {
    fn default() -> JobConfig {
        JobConfig {
            allowed: 3,
            pending: 64,
        }
    }
}

struct QueuedJob {
    group: Option<Group>,
    timeout: Duration,
    work: JobFn,
    done: Option<oneshot::Sender<Outcome>>,
}

struct Scheduler {
    queue: VecDeque<QueuedJob>,
    busy: HashSet<Group>,
    /// Budget left for pending jobs; freed when a job starts running.
    remains: usize,
    /// Logical worker slots in use, including workers parked in `enter`.
    started: usize,
    /// Workers idle on the wakeup signal.
    waiting: usize,
    stopping: bool,
}

struct Shared {
    state: Mutex<Scheduler>,
    wakeup: Notify,
    allowed: usize,
    tracker: TaskTracker,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct JobEngine {
    shared: Arc<Shared>,
}

impl JobEngine {
    /// Create an engine. Workers start lazily on first demand.
    ///
    /// Must be called within a tokio runtime; workers are spawned onto it.
    pub fn new(config: JobConfig) -> JobEngine {
        JobEngine {
            shared: Arc::new(Shared {
                state: Mutex::new(Scheduler {
                    queue: VecDeque::new(),
                    busy: HashSet::new(),
                    remains: config.pending,
                    started: 0,
                    waiting: 0,
                    stopping: false,
                }),
                wakeup: Notify::new(),
                allowed: config.allowed.max(1),
                tracker: TaskTracker::new(),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────

    /// Append a job to the FIFO.
    ///
    /// `timeout` bounds the job's execution (zero = unlimited), measured
    /// from when it starts, not from now. Returns [`JobError::Busy`] when
    /// the pending budget is exhausted.
    pub fn queue<F, Fut>(
        &self,
        group: Option<Group>,
        timeout: Duration,
        work: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push(group, timeout, box_job(work), None, true)
    }

    /// Like [`queue`](JobEngine::queue), also yielding the job's outcome.
    pub fn queue_watched<F, Fut>(
        &self,
        group: Option<Group>,
        timeout: Duration,
        work: F,
    ) -> Result<oneshot::Receiver<Outcome>, JobError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(group, timeout, box_job(work), Some(tx), true)?;
        Ok(rx)
    }

    /// Run a job and wait for it, lending the current task to the pool
    /// while it waits.
    pub async fn invoke<F, Fut>(&self, timeout: Duration, work: F) -> Result<Outcome, JobError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        // The waiter lends itself to the pool, so completion does not
        // depend on the budget: bypass it like a nested enqueue.
        self.push(None, timeout, box_job(work), Some(tx), false)?;
        let outcome = self
            .work_until(async move { rx.await.unwrap_or(Outcome::Cancelled) })
            .await;
        Ok(outcome)
    }

    /// Process jobs on the current task until `until` resolves.
    ///
    /// The task takes a logical worker slot for the duration, which is the
    /// accounting that makes `allowed` an effective-parallelism cap rather
    /// than a task-count cap.
    async fn work_until<T>(&self, until: impl Future<Output = T>) -> T {
        let shared = &self.shared;
        shared.state.lock().started += 1;

        tokio::pin!(until);
        let value = loop {
            // The exit condition is checked between jobs, never during one.
            if let std::task::Poll::Ready(value) = poll!(&mut until) {
                break value;
            }

            let notified = shared.wakeup.notified();
            tokio::pin!(notified);

            let step = {
                let mut s = shared.state.lock();
                if s.stopping {
                    // No further work can arrive; terminate() resolves the
                    // waiter by cancelling whatever it waits on.
                    Step::Stop
                } else if let Some(job) = pick(&mut s) {
                    Step::Job(job)
                } else {
                    // Register before releasing the lock so a wakeup
                    // issued in between is not lost.
                    notified.as_mut().enable();
                    s.waiting += 1;
                    Step::Wait
                }
            };

            match step {
                Step::Job(job) => run_job(shared, job).await,
                Step::Stop => break until.await,
                Step::Wait => {
                    tokio::select! {
                        value = &mut until => {
                            shared.state.lock().waiting -= 1;
                            break value;
                        }
                        () = &mut notified => {
                            shared.state.lock().waiting -= 1;
                        }
                    }
                }
            }
        };

        shared.state.lock().started -= 1;
        value
    }

    fn push(
        &self,
        group: Option<Group>,
        timeout: Duration,
        work: JobFn,
        done: Option<oneshot::Sender<Outcome>>,
        budgeted: bool,
    ) -> Result<(), JobError> {
        let spawn = {
            let mut s = self.shared.state.lock();
            if s.stopping {
                return Err(JobError::Stopping);
            }
            if budgeted {
                if s.remains == 0 {
                    counter!("jobs_rejected_busy_total").increment(1);
                    return Err(JobError::Busy);
                }
                s.remains -= 1;
            }
            s.queue.push_back(QueuedJob {
                group,
                timeout,
                work,
                done,
            });
            // Lazy worker creation: only when nobody is idle and the cap
            // allows one more.
            let spawn = s.waiting == 0 && s.started < self.shared.allowed;
            if spawn {
                s.started += 1;
            }
            spawn
        };
        if spawn {
            let shared = Arc::clone(&self.shared);
            let _ = self.shared.tracker.spawn(worker(shared));
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reentrant wait
    // ─────────────────────────────────────────────────────────────────────

    /// Run `setup` with a [`LoopRef`], then process jobs on the current
    /// task until [`LoopRef::leave`] is called (or the ref is dropped).
    ///
    /// When `group` is given, the wait holds the group for its whole
    /// duration, serializing against jobs of the same group. `timeout`
    /// bounds the wait (zero = unlimited).
    pub async fn enter<F>(
        &self,
        group: Option<Group>,
        timeout: Duration,
        setup: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(LoopRef),
    {
        if let Some(g) = group {
            self.acquire_group(g).await?;
        }

        let (tx, rx) = oneshot::channel();
        setup(LoopRef { tx });

        let left = self
            .work_until(async move {
                if timeout.is_zero() {
                    let _ = rx.await;
                    true
                } else {
                    tokio::select! {
                        _ = rx => true,
                        () = tokio::time::sleep(timeout) => false,
                    }
                }
            })
            .await;

        if let Some(g) = group {
            let _ = self.shared.state.lock().busy.remove(&g);
            self.shared.wakeup.notify_one();
        }

        if left {
            Ok(())
        } else {
            Err(JobError::Timeout)
        }
    }

    async fn acquire_group(&self, group: Group) -> Result<(), JobError> {
        loop {
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            {
                let mut s = self.shared.state.lock();
                if s.stopping {
                    return Err(JobError::Stopping);
                }
                if !s.busy.contains(&group) {
                    let _ = s.busy.insert(group);
                    return Ok(());
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Stop the engine: refuse new jobs, let running jobs finish, join the
    /// workers, then cancel every still-pending job exactly once.
    ///
    /// Must not be called from inside a job.
    pub async fn terminate(&self) {
        let drained: Vec<QueuedJob> = {
            let mut s = self.shared.state.lock();
            s.stopping = true;
            s.remains = 0;
            s.queue.drain(..).collect()
        };
        self.shared.wakeup.notify_waiters();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        let token = CancellationToken::new();
        token.cancel();
        for job in drained {
            let ctx = JobContext {
                cause: JobCause::Cancelled,
                token: token.clone(),
            };
            (job.work)(ctx).await;
            if let Some(done) = job.done {
                let _ = done.send(Outcome::Cancelled);
            }
        }
        debug!("job engine terminated");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Jobs waiting in the FIFO.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Logical worker slots in use.
    pub fn workers(&self) -> usize {
        self.shared.state.lock().started
    }

    /// Workers idle on the wakeup signal.
    pub fn idle_workers(&self) -> usize {
        self.shared.state.lock().waiting
    }
}

/// Wait handle produced by [`JobEngine::enter`].
///
/// Dropping it without calling [`leave`](LoopRef::leave) also releases the
/// waiter.
pub struct LoopRef {
    tx: oneshot::Sender<()>,
}

impl LoopRef {
    /// Release the worker parked in the matching `enter`.
    pub fn leave(self) {
        let _ = self.tx.send(());
    }
}

fn box_job<F, Fut>(work: F) -> JobFn
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(work(ctx)))
}

enum Step {
    Job(QueuedJob),
    Stop,
    Wait,
}

/// Pool worker: processes jobs until the engine stops.
async fn worker(shared: Arc<Shared>) {
    trace!("worker started");
    loop {
        let notified = shared.wakeup.notified();
        tokio::pin!(notified);

        let step = {
            let mut s = shared.state.lock();
            if s.stopping {
                Step::Stop
            } else if let Some(job) = pick(&mut s) {
                Step::Job(job)
            } else {
                // Register before releasing the lock: terminate's wakeup
                // only reaches already-registered waiters.
                notified.as_mut().enable();
                s.waiting += 1;
                Step::Wait
            }
        };

        match step {
            Step::Job(job) => run_job(&shared, job).await,
            Step::Stop => break,
            Step::Wait => {
                notified.await;
                shared.state.lock().waiting -= 1;
            }
        }
    }
    shared.state.lock().started -= 1;
    trace!("worker stopped");
}

/// Take the first runnable job, marking its group busy and freeing its
/// budget slot.
fn pick(s: &mut Scheduler) -> Option<QueuedJob> {
    let idx = s
        .queue
        .iter()
        .position(|j| j.group.is_none_or(|g| !s.busy.contains(&g)))?;
    let job = s.queue.remove(idx)?;
    if let Some(g) = job.group {
        let _ = s.busy.insert(g);
    }
    s.remains += 1;
    Some(job)
}

async fn run_job(shared: &Arc<Shared>, job: QueuedJob) {
    let token = CancellationToken::new();
    let ctx = JobContext {
        cause: JobCause::Run,
        token: token.clone(),
    };
    let fut = (job.work)(ctx);
    let outcome = watchdog::supervise(job.timeout, token, fut).await;

    if let Some(done) = job.done {
        let _ = done.send(outcome);
    }
    if let Some(group) = job.group {
        let _ = shared.state.lock().busy.remove(&group);
        // The release may unblock the next job of this group.
        shared.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration, Instant};

    fn engine(allowed: usize, pending: usize) -> JobEngine {
        JobEngine::new(JobConfig { allowed, pending })
    }

    #[tokio::test]
    async fn jobs_run_and_complete() {
        let engine = engine(3, 16);
        let rx = engine
            .queue_watched(None, Duration::ZERO, |_ctx| async { sleep(Duration::from_millis(1)).await })
            .unwrap();
        assert_eq!(rx.await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn same_group_jobs_run_in_enqueue_order() {
        let engine = engine(3, 16);
        let group = Group::fresh();
        let log: Arc<PlMutex<String>> = Arc::default();

        let l = log.clone();
        let a = engine
            .queue_watched(Some(group), Duration::ZERO, move |_ctx| async move {
                // Give B every chance to overtake if serialization is broken.
                sleep(Duration::from_millis(20)).await;
                l.lock().push('A');
            })
            .unwrap();
        let l = log.clone();
        let b = engine
            .queue_watched(Some(group), Duration::ZERO, move |_ctx| async move {
                l.lock().push('B');
            })
            .unwrap();

        assert_eq!(a.await.unwrap(), Outcome::Done);
        assert_eq!(b.await.unwrap(), Outcome::Done);
        assert_eq!(log.lock().as_str(), "AB");
    }

    #[tokio::test]
    async fn different_groups_run_in_parallel() {
        let engine = engine(3, 16);
        let (tx1, rx1) = oneshot::channel::<()>();
        let (tx2, rx2) = oneshot::channel::<()>();

        // Each job completes only once the other has started: requires
        // both to be running at once.
        let a = engine
            .queue_watched(Some(Group::fresh()), Duration::ZERO, move |_ctx| async move {
                let _ = tx1.send(());
                let _ = rx2.await;
            })
            .unwrap();
        let b = engine
            .queue_watched(Some(Group::fresh()), Duration::ZERO, move |_ctx| async move {
                let _ = tx2.send(());
                let _ = rx1.await;
            })
            .unwrap();

        assert_eq!(a.await.unwrap(), Outcome::Done);
        assert_eq!(b.await.unwrap(), Outcome::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_cancels_at_the_deadline_and_worker_survives() {
        let engine = engine(2, 16);

        let started = Instant::now();
        let rx = engine
            .queue_watched(None, Duration::from_secs(1), |_ctx| async {
                sleep(Duration::from_secs(5)).await;
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), Outcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "fired late: {elapsed:?}");

        // The worker is healthy afterwards.
        let rx = engine
            .queue_watched(None, Duration::ZERO, |_ctx| async {})
            .unwrap();
        assert_eq!(rx.await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn pending_budget_rejects_with_busy() {
        // One worker, blocked; the budget then fills up.
        let engine = engine(1, 2);
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let blocker = engine
            .queue_watched(None, Duration::ZERO, move |_ctx| async move {
                let _ = hold_rx.await;
            })
            .unwrap();
        // Wait for the blocker to start (its budget slot frees on start).
        while engine.pending() > 0 {
            tokio::task::yield_now().await;
        }

        engine.queue(None, Duration::ZERO, |_ctx| async {}).unwrap();
        engine.queue(None, Duration::ZERO, |_ctx| async {}).unwrap();
        assert_matches!(
            engine.queue(None, Duration::ZERO, |_ctx| async {}),
            Err(JobError::Busy)
        );

        let _ = hold_tx.send(());
        assert_eq!(blocker.await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn invoke_returns_after_completion() {
        let engine = engine(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let outcome = engine
            .invoke(Duration::ZERO, move |_ctx| async move {
                let _ = r.fetch_add(1, Ordering::Relaxed);
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn enter_processes_jobs_while_parked() {
        // Pool of one: the entered worker itself must run the job that
        // calls leave, or this deadlocks.
        let engine = engine(1, 4);
        let parked = engine.clone();
        let handle = tokio::spawn(async move {
            parked
                .enter(None, Duration::ZERO, |loopref| {
                    parked
                        .queue(None, Duration::ZERO, move |_ctx| async move {
                            loopref.leave();
                        })
                        .unwrap();
                })
                .await
        });
        assert_matches!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn enter_times_out() {
        let engine = engine(1, 4);
        let result = engine
            .enter(None, Duration::from_secs(1), |loopref| {
                // Nobody ever calls leave.
                std::mem::forget(loopref);
            })
            .await;
        assert_matches!(result, Err(JobError::Timeout));
    }

    #[tokio::test]
    async fn enter_holds_its_group() {
        let engine = engine(2, 8);
        let group = Group::fresh();
        let log: Arc<PlMutex<String>> = Arc::default();

        let l = log.clone();
        let e = engine.clone();
        let entered = tokio::spawn(async move {
            e.enter(Some(group), Duration::ZERO, |loopref| {
                l.lock().push('E');
                // Released from an unrelated job.
                e.queue(None, Duration::ZERO, move |_ctx| async move {
                    loopref.leave();
                })
                .unwrap();
            })
            .await
        });

        // A same-group job must not start while the wait holds the group.
        while log.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let l = log.clone();
        let same = engine
            .queue_watched(Some(group), Duration::ZERO, move |_ctx| async move {
                l.lock().push('G');
            })
            .unwrap();

        assert_matches!(entered.await.unwrap(), Ok(()));
        assert_eq!(same.await.unwrap(), Outcome::Done);
        assert_eq!(log.lock().as_str(), "EG");
    }

    #[tokio::test]
    async fn terminate_cancels_pending_jobs_exactly_once() {
        let engine = engine(1, 8);
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let blocker = engine
            .queue_watched(None, Duration::ZERO, move |_ctx| async move {
                let _ = hold_rx.await;
            })
            .unwrap();
        while engine.pending() > 0 {
            tokio::task::yield_now().await;
        }

        let cancelled = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = cancelled.clone();
            let r = ran.clone();
            engine
                .queue(None, Duration::ZERO, move |ctx| async move {
                    if ctx.is_cancelled() {
                        let _ = c.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let _ = r.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .unwrap();
        }

        // Unblock the running job, then stop.
        let _ = hold_tx.send(());
        assert_eq!(blocker.await.unwrap(), Outcome::Done);
        engine.terminate().await;

        assert_eq!(cancelled.load(Ordering::Relaxed) + ran.load(Ordering::Relaxed), 3);
        assert_matches!(
            engine.queue(None, Duration::ZERO, |_ctx| async {}),
            Err(JobError::Stopping)
        );
    }

    #[tokio::test]
    async fn workers_start_lazily_up_to_allowed() {
        let engine = engine(2, 16);
        assert_eq!(engine.workers(), 0);

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let hold_rx = Arc::new(tokio::sync::Mutex::new(Some(hold_rx)));
        let mut watchers = Vec::new();
        for _ in 0..4 {
            let hold = hold_rx.clone();
            watchers.push(
                engine
                    .queue_watched(None, Duration::ZERO, move |_ctx| async move {
                        let rx = hold.lock().await.take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                    })
                    .unwrap(),
            );
        }
        while engine.pending() > 2 {
            tokio::task::yield_now().await;
        }
        assert!(engine.workers() <= 2);

        let _ = hold_tx.send(());
        for w in watchers {
            assert_eq!(w.await.unwrap(), Outcome::Done);
        }
    }
}
