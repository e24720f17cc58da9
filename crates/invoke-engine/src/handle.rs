//! The public handle returned synchronously from `invoke`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CancelState as LifecyclePhase, CancellationError, PipelineError};
use crate::scheduler::Scheduler;

/// Shared between a [`Handle`] and the pipeline's attempt loop so a cancel
/// reason set by the caller is visible to the code noticing the token was
/// tripped, without the scheduler needing to know about reasons at all.
pub(crate) struct CancelState {
    pub cancelled: AtomicBool,
    pub reason: Mutex<Option<String>>,
}

impl CancelState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
        })
    }
}

pub(crate) type SharedCancelState = Arc<CancelState>;

/// Returned from `invoke`. The result future and the event-logged future
/// settle independently: the result future resolves as soon as the pipeline
/// decides an outcome, while the event-logged future resolves only once the
/// terminal wide event has been handed to the `.onEvent` observer. Both can
/// be awaited concurrently off the same handle (e.g. via `tokio::join!`)
/// since each only claims its own oneshot receiver out of a `Mutex<Option<_>>`
/// rather than requiring ownership of the whole handle.
pub struct Handle<Out, E> {
    action_id: Uuid,
    result_rx: Mutex<Option<tokio::sync::oneshot::Receiver<Result<Out, PipelineError<E>>>>>,
    event_logged_rx: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    token: CancellationToken,
    scheduler: Scheduler<Out, E>,
    cancel_state: SharedCancelState,
}

impl<Out, E> Handle<Out, E>
where
    Out: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(
        action_id: Uuid,
        result_rx: tokio::sync::oneshot::Receiver<Result<Out, PipelineError<E>>>,
        event_logged_rx: tokio::sync::oneshot::Receiver<()>,
        token: CancellationToken,
        scheduler: Scheduler<Out, E>,
        cancel_state: SharedCancelState,
    ) -> Self {
        Self {
            action_id,
            result_rx: Mutex::new(Some(result_rx)),
            event_logged_rx: Mutex::new(Some(event_logged_rx)),
            token,
            scheduler,
            cancel_state,
        }
    }

    pub fn action_id(&self) -> Uuid {
        self.action_id
    }

    /// Await the invocation's outcome. Claims the handle's result channel
    /// the first time it's called; a second call panics, matching the
    /// one-shot nature of the underlying channel.
    pub async fn result(&self) -> Result<Out, PipelineError<E>> {
        let rx = self
            .result_rx
            .lock()
            .unwrap()
            .take()
            .expect("Handle::result() already awaited");
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Cancelled(CancellationError::new(
                Some("pipeline dropped without settling".into()),
                LifecyclePhase::Running,
            ))),
        }
    }

    /// Resolves once the terminal wide event has been delivered to the
    /// `.onEvent` observer (or immediately, if none is configured). Claims
    /// the handle's event-logged channel the first time it's called.
    pub async fn event_logged(&self) {
        let rx = self
            .event_logged_rx
            .lock()
            .unwrap()
            .take()
            .expect("Handle::event_logged() already awaited");
        let _ = rx.await;
    }

    /// Idempotent: cancelling an already-settled or already-cancelled
    /// invocation is a no-op (the first reason wins).
    pub fn cancel(&self, reason: Option<String>) {
        if self
            .cancel_state
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.cancel_state.reason.lock().unwrap() = reason.clone();
            self.scheduler.cancel(self.action_id, reason);
            self.token.cancel();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel_state.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_state.reason.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[tokio::test]
    async fn result_and_event_logged_settle_independently() {
        let scheduler: Scheduler<u32, String> = Scheduler::new(1, None);
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let (event_tx, event_logged_rx) = tokio::sync::oneshot::channel();
        let handle: Handle<u32, String> = Handle::new(
            Uuid::new_v4(),
            result_rx,
            event_logged_rx,
            CancellationToken::new(),
            scheduler,
            CancelState::new(),
        );

        result_tx.send(Ok(7)).unwrap();
        assert_eq!(handle.result().await.unwrap(), 7);

        // event-logged hasn't settled yet even though result already has.
        event_tx.send(()).unwrap();
        handle.event_logged().await;
    }

    #[tokio::test]
    async fn result_and_event_logged_can_be_awaited_concurrently() {
        let scheduler: Scheduler<u32, String> = Scheduler::new(1, None);
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let (event_tx, event_logged_rx) = tokio::sync::oneshot::channel();
        let handle: Handle<u32, String> = Handle::new(
            Uuid::new_v4(),
            result_rx,
            event_logged_rx,
            CancellationToken::new(),
            scheduler,
            CancelState::new(),
        );

        result_tx.send(Ok(9)).unwrap();
        event_tx.send(()).unwrap();

        let (result, ()) = tokio::join!(handle.result(), handle.event_logged());
        assert_eq!(result.unwrap(), 9);
    }
}
