//! Priority-ordered, concurrency-bounded, rate-limited task scheduler.
//!
//! A [`Scheduler`] admits queued work against two gates — a concurrency
//! limit and a sliding 1-second rate window — and dispatches the
//! highest-priority, earliest-submitted admissible task first. Running
//! tasks are never preempted; only queued tasks can be reordered or
//! cancelled synchronously.
//!
//! One `Scheduler<Out, E>` instance is owned by a single action: `Out` and
//! `E` are that action's handler's success and error types, fixed for the
//! scheduler's lifetime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CancelState, CancellationError, PipelineError};
use crate::priority_queue::PriorityQueue;
use crate::rate_limit::{Admission, RateWindow};

/// Stable identifier for a scheduled task (shared with the invocation's
/// action-id — the scheduler and the pipeline speak the same id space).
pub type TaskId = Uuid;

/// A future produced by a task's work closure once it has been handed a
/// cancellation token.
pub type WorkFuture<Out, E> = Pin<Box<dyn Future<Output = Result<Out, PipelineError<E>>> + Send>>;

/// The work a task performs: a one-shot closure taking a cancellation token.
pub type WorkFn<Out, E> = Box<dyn FnOnce(CancellationToken) -> WorkFuture<Out, E> + Send>;

/// How [`Scheduler::shutdown`] should treat work still in flight.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Cancel the queue and abort every running task's token immediately.
    Immediate,
    /// Cancel the queue, then wait for running tasks to settle up to a
    /// timeout before force-aborting whatever remains.
    Graceful,
}

impl std::fmt::Debug for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownMode::Immediate => write!(f, "immediate"),
            ShutdownMode::Graceful => write!(f, "graceful"),
        }
    }
}

struct QueuedTask<Out, E> {
    work: WorkFn<Out, E>,
    result_tx: tokio::sync::oneshot::Sender<Result<Out, PipelineError<E>>>,
    token: CancellationToken,
}

struct RunningTask {
    token: CancellationToken,
    cancelled: bool,
    cancel_reason: Option<String>,
}

struct Inner<Out, E> {
    queue: PriorityQueue<TaskId>,
    queued: HashMap<TaskId, QueuedTask<Out, E>>,
    running: HashMap<TaskId, RunningTask>,
    rate: RateWindow,
    concurrency: usize,
    sequence: u64,
    shutting_down: bool,
    rate_timer_pending: bool,
}

/// Priority-ordered, concurrency-bounded, rate-limited task scheduler.
///
/// Cheaply cloneable (`Arc`-backed); clones share the same admission state.
pub struct Scheduler<Out, E> {
    inner: Arc<Mutex<Inner<Out, E>>>,
}

impl<Out, E> Clone for Scheduler<Out, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Out, E> Scheduler<Out, E>
where
    Out: Send + 'static,
    E: Send + 'static,
{
    /// Create a scheduler with the given concurrency limit (`None` rate
    /// limit means unbounded).
    pub fn new(concurrency: usize, rate_limit: Option<u32>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: PriorityQueue::new(),
                queued: HashMap::new(),
                running: HashMap::new(),
                rate: RateWindow::new(rate_limit),
                concurrency: concurrency.max(1),
                sequence: 0,
                shutting_down: false,
                rate_timer_pending: false,
            })),
        }
    }

    /// Enqueue `work` under `id` at `priority` (0-100). Dispatch is deferred
    /// to the next tokio tick so the caller can attach observers to the
    /// returned receiver/token before the task could possibly settle.
    pub fn schedule(
        &self,
        id: TaskId,
        priority: u8,
        work: WorkFn<Out, E>,
    ) -> (
        tokio::sync::oneshot::Receiver<Result<Out, PipelineError<E>>>,
        CancellationToken,
    ) {
        let token = CancellationToken::new();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();

        {
            let mut g = self.inner.lock().unwrap();
            if g.shutting_down {
                let _ = result_tx.send(Err(PipelineError::Cancelled(CancellationError::new(
                    Some("scheduler is shutting down".into()),
                    CancelState::Queued,
                ))));
                return (result_rx, token);
            }
            let sequence = g.sequence;
            g.sequence += 1;
            g.queue.push(id, priority, sequence);
            g.queued.insert(
                id,
                QueuedTask {
                    work,
                    result_tx,
                    token: token.clone(),
                },
            );
            tracing::debug!(task_id = %id, priority, "task queued");
        }

        self.kick_dispatch();
        (result_rx, token)
    }

    /// Cancel `id`. If queued, settles its receiver synchronously with a
    /// `Queued`-tagged cancellation before the handler ever runs. If
    /// running, aborts its token cooperatively (`Running`-tagged). Returns
    /// `false` if `id` is unknown. Idempotent: a second cancel on a task
    /// already marked cancelled keeps the first reason.
    pub fn cancel(&self, id: TaskId, reason: Option<String>) -> bool {
        let mut g = self.inner.lock().unwrap();

        if g.queue.remove(&id) {
            if let Some(qt) = g.queued.remove(&id) {
                qt.token.cancel();
                let _ = qt.result_tx.send(Err(PipelineError::Cancelled(
                    CancellationError::new(reason, CancelState::Queued),
                )));
                tracing::info!(task_id = %id, "queued task cancelled");
                return true;
            }
            return false;
        }

        if let Some(rt) = g.running.get_mut(&id) {
            if !rt.cancelled {
                rt.cancelled = true;
                rt.cancel_reason = reason;
            }
            rt.token.cancel();
            tracing::info!(task_id = %id, "running task cancel requested");
            return true;
        }

        false
    }

    /// Cancel every queued task, tagging each with `Queued`. Running tasks
    /// are left untouched. Returns how many were cancelled.
    pub fn clear_queue(&self, reason: Option<String>) -> usize {
        let mut g = self.inner.lock().unwrap();
        let ids = g.queue.drain_all();
        let mut count = 0;
        for id in ids {
            if let Some(qt) = g.queued.remove(&id) {
                qt.token.cancel();
                let _ = qt.result_tx.send(Err(PipelineError::Cancelled(
                    CancellationError::new(reason.clone(), CancelState::Queued),
                )));
                count += 1;
            }
        }
        tracing::info!(count, "queue cleared");
        count
    }

    /// Live-update the concurrency limit; opportunistically drains the
    /// queue if the new limit admits more work.
    pub fn set_concurrency(&self, limit: usize) {
        {
            let mut g = self.inner.lock().unwrap();
            g.concurrency = limit.max(1);
        }
        self.kick_dispatch();
    }

    /// Live-update the rate limit (`None` = unbounded); opportunistically
    /// drains the queue.
    pub fn set_rate_limit(&self, limit: Option<u32>) {
        {
            let mut g = self.inner.lock().unwrap();
            g.rate.set_limit(limit);
        }
        self.kick_dispatch();
    }

    /// Stop accepting new work, cancel the queue, and settle running work
    /// per `mode`.
    pub async fn shutdown(&self, mode: ShutdownMode, timeout: Duration) {
        {
            let mut g = self.inner.lock().unwrap();
            g.shutting_down = true;
        }
        self.clear_queue(Some("scheduler shutting down".into()));

        match mode {
            ShutdownMode::Immediate => {
                let g = self.inner.lock().unwrap();
                for rt in g.running.values() {
                    rt.token.cancel();
                }
            }
            ShutdownMode::Graceful => {
                let deadline = Instant::now() + timeout;
                loop {
                    let remaining = self.inner.lock().unwrap().running.len();
                    if remaining == 0 {
                        break;
                    }
                    if Instant::now() >= deadline {
                        tracing::warn!("graceful shutdown timed out; forcing cancellation");
                        let g = self.inner.lock().unwrap();
                        for rt in g.running.values() {
                            rt.token.cancel();
                        }
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        tracing::info!(?mode, "scheduler shutdown complete");
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().unwrap().running.len()
    }

    /// Alias for `running_count` (spec: `getActiveCount`).
    pub fn active_count(&self) -> usize {
        self.running_count()
    }

    /// Alias for `queued_count` (spec: `getQueueLength`).
    pub fn queue_length(&self) -> usize {
        self.queued_count()
    }

    /// Every task id currently known to the scheduler, queued or running.
    /// Used by `cancelAll`'s predicate form, which needs to visit live tasks
    /// one at a time rather than cancel unconditionally.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let g = self.inner.lock().unwrap();
        g.queued.keys().chain(g.running.keys()).copied().collect()
    }

    fn kick_dispatch(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(dispatch(inner));
    }
}

/// Admit and run as many queued tasks as the concurrency and rate gates
/// allow, then return. Each admitted task re-triggers this function on
/// settlement so work keeps draining without a dedicated driver thread.
async fn dispatch<Out, E>(inner: Arc<Mutex<Inner<Out, E>>>)
where
    Out: Send + 'static,
    E: Send + 'static,
{
    loop {
        let mut g = inner.lock().unwrap();

        if g.queue.is_empty() {
            return;
        }
        if g.running.len() >= g.concurrency {
            return;
        }

        match g.rate.probe(Instant::now()) {
            Admission::Admitted => {}
            Admission::WaitMillis(wait_ms) => {
                if !g.rate_timer_pending {
                    g.rate_timer_pending = true;
                    let inner2 = Arc::clone(&inner);
                    drop(g);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                        {
                            let mut g = inner2.lock().unwrap();
                            g.rate_timer_pending = false;
                        }
                        dispatch(inner2).await;
                    });
                }
                return;
            }
        }

        let id = match g.queue.pop_highest() {
            Some(id) => id,
            None => return,
        };
        let queued = match g.queued.remove(&id) {
            Some(q) => q,
            None => continue,
        };

        g.running.insert(
            id,
            RunningTask {
                token: queued.token.clone(),
                cancelled: false,
                cancel_reason: None,
            },
        );
        drop(g);

        tracing::info!(task_id = %id, "task admitted");
        let inner2 = Arc::clone(&inner);
        let token_for_work = queued.token.clone();
        tokio::spawn(async move {
            let outcome = (queued.work)(token_for_work).await;
            let resolved_ok = outcome.is_ok();

            let final_outcome = {
                let mut g = inner2.lock().unwrap();
                match g.running.remove(&id) {
                    // The work ignored its cancellation token and resolved
                    // anyway: override with a cancellation error. If the
                    // work already produced an error (possibly its own
                    // cancellation error tagged `running` or
                    // `retry-delay`), pass it through unchanged instead of
                    // clobbering a more specific tag.
                    Some(rt) if rt.cancelled && resolved_ok => {
                        tracing::info!(task_id = %id, "settling as cancelled (running)");
                        Err(PipelineError::Cancelled(CancellationError::new(
                            rt.cancel_reason,
                            CancelState::Running,
                        )))
                    }
                    _ => outcome,
                }
            };

            let _ = queued.result_tx.send(final_outcome);
            dispatch(inner2).await;
        });
    }
}
