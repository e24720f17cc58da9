//! The public builder + invocation surface (spec §6): `create_action` and its
//! three handler-shape constructors, the chainable `ActionBuilder`, and the
//! `Action` that `invoke`s, ties the scheduler to the pipeline, and exposes
//! `cancel_all` / `clear_queue`.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action_context::ActionContext;
use crate::ambient::{self, SharedContext};
use crate::attachment::{to_attachment, AttachmentValue};
use crate::context::{ContextWarning, InvocationContext, ProgressUpdate, WarningThresholds};
use crate::error::ValidationError;
use crate::event::WideEvent;
use crate::handle::{CancelState as HandleCancelState, Handle};
use crate::handler::{BoxFuture, HandlerKind};
use crate::pipeline::{run_attempt_loop, AttemptFn, AttemptLoopConfig, RetryPolicy, TimeoutPolicy};
use crate::priority::Priority;
use crate::scheduler::{Scheduler, ShutdownMode, WorkFn};

/// Per-invocation overrides accepted by `invoke`.
#[derive(Default, Clone)]
pub struct InvokeOptions {
    /// Overrides the action's default priority for this invocation only.
    pub priority: Option<Priority>,
    /// Deep-merged into the invocation's attachments before the handler runs.
    pub metadata: Option<AttachmentValue>,
}

/// `create_action(handler).set_concurrency(4)?...build()` — the chainable
/// option-setting surface. Each setter validates synchronously and returns
/// `Err` rather than letting a bad option reach the pipeline (spec §7).
pub struct ActionBuilder<In, Out, E> {
    handler: HandlerKind<In, Out, E>,
    concurrency: usize,
    rate_limit: Option<u32>,
    priority: Priority,
    retry: RetryPolicy<E>,
    timeout: Option<TimeoutPolicy>,
    event_observer: Option<Arc<dyn Fn(WideEvent) + Send + Sync>>,
    progress_observer: Option<(Arc<dyn Fn(ProgressUpdate) + Send + Sync>, Duration)>,
    warning_thresholds: WarningThresholds,
    warning_sink: Option<Arc<dyn Fn(ContextWarning) + Send + Sync>>,
    error_sink: Arc<dyn Fn(&dyn std::error::Error) + Send + Sync>,
}

fn default_error_sink() -> Arc<dyn Fn(&dyn std::error::Error) + Send + Sync> {
    Arc::new(|err: &dyn std::error::Error| {
        tracing::error!(error = %err, "unhandled error in action observer callback");
    })
}

impl<In, Out, E> ActionBuilder<In, Out, E> {
    fn with_handler(handler: HandlerKind<In, Out, E>) -> Self {
        Self {
            handler,
            concurrency: 1,
            rate_limit: None,
            priority: Priority::NORMAL,
            retry: RetryPolicy::default(),
            timeout: None,
            event_observer: None,
            progress_observer: None,
            warning_thresholds: WarningThresholds::default(),
            warning_sink: None,
            error_sink: default_error_sink(),
        }
    }

    /// Positive integer; default 1.
    pub fn set_concurrency(mut self, limit: usize) -> Result<Self, ValidationError> {
        if limit == 0 {
            return Err(ValidationError::new("concurrency must be a positive integer"));
        }
        self.concurrency = limit;
        Ok(self)
    }

    /// `None` means unbounded (the spec's `∞`); `Some(0)` is rejected.
    pub fn set_rate_limit(mut self, limit: Option<u32>) -> Result<Self, ValidationError> {
        if limit == Some(0) {
            return Err(ValidationError::new("rate limit must be positive"));
        }
        self.rate_limit = limit;
        Ok(self)
    }

    pub fn set_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn set_retry(mut self, retry: RetryPolicy<E>) -> Self {
        self.retry = retry;
        self
    }

    /// Rejects a zero-millisecond timeout synchronously.
    pub fn set_timeout(mut self, policy: TimeoutPolicy) -> Result<Self, ValidationError> {
        if policy.duration_ms == 0 {
            return Err(ValidationError::new("timeout duration must be greater than zero"));
        }
        self.timeout = Some(policy);
        Ok(self)
    }

    pub fn on_event(mut self, callback: impl Fn(WideEvent) + Send + Sync + 'static) -> Self {
        self.event_observer = Some(Arc::new(callback));
        self
    }

    pub fn on_progress(
        mut self,
        callback: impl Fn(ProgressUpdate) + Send + Sync + 'static,
        throttle: Duration,
    ) -> Self {
        self.progress_observer = Some((Arc::new(callback), throttle));
        self
    }

    pub fn set_context_warning_threshold(
        mut self,
        thresholds: WarningThresholds,
        on_warning: impl Fn(ContextWarning) + Send + Sync + 'static,
    ) -> Self {
        self.warning_thresholds = thresholds;
        self.warning_sink = Some(Arc::new(on_warning));
        self
    }

    pub fn set_error_sink(mut self, sink: impl Fn(&dyn std::error::Error) + Send + Sync + 'static) -> Self {
        self.error_sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> Action<In, Out, E>
    where
        Out: Send + 'static,
        E: Send + 'static,
    {
        Action {
            handler: self.handler,
            scheduler: Scheduler::new(self.concurrency, self.rate_limit),
            default_priority: self.priority,
            retry: self.retry,
            timeout: self.timeout,
            event_observer: self.event_observer,
            progress_observer: self.progress_observer,
            warning_thresholds: self.warning_thresholds,
            warning_sink: self.warning_sink,
            error_sink: self.error_sink,
        }
    }
}

/// Register a plain handler: `Fn(In) -> Future<Output = Result<Out, E>>`.
pub fn create_action<In, Out, E, F, Fut>(handler: F) -> ActionBuilder<In, Out, E>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
{
    ActionBuilder::with_handler(HandlerKind::Plain(Arc::new(move |input| {
        Box::pin(handler(input)) as BoxFuture<Out, E>
    })))
}

/// Register a context-shaped handler:
/// `Fn(ActionContext, In) -> Future<Output = Result<Out, E>>`. The handler
/// gets direct access to attach/progress without reaching into ambient
/// state.
pub fn create_context_action<In, Out, E, F, Fut>(handler: F) -> ActionBuilder<In, Out, E>
where
    F: Fn(ActionContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
{
    ActionBuilder::with_handler(HandlerKind::Context(Arc::new(move |ctx, input| {
        Box::pin(handler(ctx, input)) as BoxFuture<Out, E>
    })))
}

/// Register a token-shaped handler:
/// `Fn(CancellationToken, In) -> Future<Output = Result<Out, E>>`. The
/// handler is expected to cooperate with timeout/cancellation by racing its
/// own work against the token.
pub fn create_token_action<In, Out, E, F, Fut>(handler: F) -> ActionBuilder<In, Out, E>
where
    F: Fn(CancellationToken, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
{
    ActionBuilder::with_handler(HandlerKind::Token(Arc::new(move |token, input| {
        Box::pin(handler(token, input)) as BoxFuture<Out, E>
    })))
}

/// A handler plus its execution policy: concurrency, rate limit, priority,
/// retry, timeout, and observers. Cheaply cloneable; clones share the same
/// underlying scheduler.
pub struct Action<In, Out, E> {
    pub(crate) handler: HandlerKind<In, Out, E>,
    pub(crate) scheduler: Scheduler<Out, E>,
    pub(crate) default_priority: Priority,
    pub(crate) retry: RetryPolicy<E>,
    pub(crate) timeout: Option<TimeoutPolicy>,
    pub(crate) event_observer: Option<Arc<dyn Fn(WideEvent) + Send + Sync>>,
    pub(crate) progress_observer: Option<(Arc<dyn Fn(ProgressUpdate) + Send + Sync>, Duration)>,
    pub(crate) warning_thresholds: WarningThresholds,
    pub(crate) warning_sink: Option<Arc<dyn Fn(ContextWarning) + Send + Sync>>,
    pub(crate) error_sink: Arc<dyn Fn(&dyn std::error::Error) + Send + Sync>,
}

impl<In, Out, E> Clone for Action<In, Out, E> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            scheduler: self.scheduler.clone(),
            default_priority: self.default_priority,
            retry: self.retry.clone(),
            timeout: self.timeout,
            event_observer: self.event_observer.clone(),
            progress_observer: self.progress_observer.clone(),
            warning_thresholds: self.warning_thresholds.clone(),
            warning_sink: self.warning_sink.clone(),
            error_sink: Arc::clone(&self.error_sink),
        }
    }
}

impl<In, Out, E> Action<In, Out, E>
where
    In: Clone + Serialize + Send + 'static,
    Out: Default + Serialize + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create and submit one invocation, returning its handle synchronously.
    /// Dispatch onto the scheduler is deferred to the next tick (see
    /// [`Scheduler::schedule`]) so the caller can attach everything it needs
    /// to the handle before the task could possibly settle.
    pub fn invoke(&self, input: In, options: InvokeOptions) -> Handle<Out, E> {
        self.invoke_with_batch(input, options, None)
    }

    pub(crate) fn invoke_with_batch(
        &self,
        input: In,
        options: InvokeOptions,
        batch_id: Option<Uuid>,
    ) -> Handle<Out, E> {
        let action_id = Uuid::new_v4();
        let priority = options.priority.unwrap_or(self.default_priority).value();

        let parent = ambient::current();
        let progress_throttle = self
            .progress_observer
            .as_ref()
            .map(|(_, throttle)| *throttle)
            .unwrap_or(Duration::from_millis(100));

        let mut ctx = match &parent {
            Some(parent_shared) => {
                let parent_guard = parent_shared.lock().unwrap();
                InvocationContext::new_child(
                    action_id,
                    &parent_guard,
                    self.warning_thresholds.clone(),
                    progress_throttle,
                )
            }
            None => InvocationContext::new_root(
                action_id,
                self.warning_thresholds.clone(),
                progress_throttle,
            ),
        };

        if let Some(metadata) = options.metadata {
            let warning = ctx.attach_record(metadata);
            self.emit_warning(warning);
        }

        if let Some(parent_shared) = &parent {
            parent_shared.lock().unwrap().register_child_start(action_id);
        }

        let shared_ctx: SharedContext = Arc::new(Mutex::new(ctx));
        let cancel_state = HandleCancelState::new();
        let cancel_reason_reader: Arc<dyn Fn() -> Option<String> + Send + Sync> = {
            let cancel_state = Arc::clone(&cancel_state);
            Arc::new(move || cancel_state.reason.lock().unwrap().clone())
        };

        let (event_logged_tx, event_logged_rx) = tokio::sync::oneshot::channel();

        let input_snapshot = to_attachment(&input);

        let handler = self.handler.clone();
        let progress_observer = self.progress_observer.clone();
        let warning_sink = self.warning_sink.clone();
        let attempt_fn: AttemptFn<Out, E> = Box::new(move |ctx_arg: SharedContext, token: CancellationToken| {
            let handler = handler.clone();
            let input = input.clone();
            let progress_observer = progress_observer.clone();
            let warning_sink = warning_sink.clone();
            Box::pin(async move {
                let ctx_for_action = Arc::clone(&ctx_arg);
                let action_ctx_factory = move || {
                    ActionContext::new(
                        Arc::clone(&ctx_for_action),
                        progress_observer.clone(),
                        warning_sink.clone(),
                    )
                };
                ambient::scoped(
                    ctx_arg.clone(),
                    handler.call(input, action_ctx_factory, token),
                )
                .await
            })
        });

        let cfg = AttemptLoopConfig {
            action_id,
            priority,
            batch_id,
            input: input_snapshot,
            attempt_fn,
            retry: self.retry.clone(),
            timeout: self.timeout,
            event_observer: self.event_observer.clone(),
            error_sink: Arc::clone(&self.error_sink),
            out_to_attachment: Arc::new(|value: &Out| to_attachment(value)),
            err_to_string: Arc::new(|err: &E| err.to_string()),
            cancel_reason: cancel_reason_reader,
        };

        let ctx_for_loop = Arc::clone(&shared_ctx);
        let parent_for_rollup = parent.clone();
        let work: WorkFn<Out, E> = Box::new(move |token: CancellationToken| {
            Box::pin(async move {
                let (outcome, event) = run_attempt_loop(cfg, ctx_for_loop, token).await;
                if let Some(parent_shared) = parent_for_rollup {
                    parent_shared.lock().unwrap().register_child_complete(event);
                }
                let _ = event_logged_tx.send(());
                outcome
            })
        });

        let (result_rx, token) = self.scheduler.schedule(action_id, priority, work);
        Handle::new(
            action_id,
            result_rx,
            event_logged_rx,
            token,
            self.scheduler.clone(),
            cancel_state,
        )
    }

    /// Cancel every queued task unconditionally.
    pub fn clear_queue(&self, reason: Option<String>) -> usize {
        self.scheduler.clear_queue(reason)
    }

    /// Cancel every queued and running task with a fixed reason.
    pub fn cancel_all(&self, reason: Option<String>) -> usize {
        let mut count = 0;
        for id in self.scheduler.task_ids() {
            if self.scheduler.cancel(id, reason.clone()) {
                count += 1;
            }
        }
        count
    }

    /// Cancel only the tasks `predicate` decides to: `None` leaves a task
    /// alone, `Some(reason)` cancels it with that reason. Resolves the
    /// source-ambiguous "always `Cancelled by predicate`" open question
    /// (spec §9) by letting the predicate express its own reason.
    pub fn cancel_all_where(&self, predicate: impl Fn(Uuid) -> Option<String>) -> usize {
        let mut count = 0;
        for id in self.scheduler.task_ids() {
            if let Some(reason) = predicate(id) {
                if self.scheduler.cancel(id, Some(reason)) {
                    count += 1;
                }
            }
        }
        count
    }

    pub fn queued_count(&self) -> usize {
        self.scheduler.queued_count()
    }

    pub fn running_count(&self) -> usize {
        self.scheduler.running_count()
    }

    pub async fn shutdown(&self, mode: ShutdownMode, timeout: Duration) {
        self.scheduler.shutdown(mode, timeout).await;
    }

    fn emit_warning(&self, warning: Option<ContextWarning>) {
        if let (Some(warning), Some(sink)) = (warning, &self.warning_sink) {
            sink(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct TestError;

    #[tokio::test]
    async fn invoke_resolves_with_handler_output() {
        let action = create_action(|n: i32| async move { Ok::<_, TestError>(n * 2) })
            .set_concurrency(2)
            .unwrap()
            .build();
        let handle = action.invoke(21, InvokeOptions::default());
        assert_eq!(handle.result().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn builder_rejects_zero_concurrency() {
        let builder = create_action(|n: i32| async move { Ok::<_, TestError>(n) });
        assert!(builder.set_concurrency(0).is_err());
    }

    #[tokio::test]
    async fn builder_rejects_zero_timeout() {
        let builder = create_action(|n: i32| async move { Ok::<_, TestError>(n) });
        assert!(builder.set_timeout(TimeoutPolicy::from_millis(0)).is_err());
    }

    #[tokio::test]
    async fn retry_policy_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let action = create_action(move |_: ()| {
            let calls = Arc::clone(&calls2);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(TestError)
                } else {
                    Ok(7)
                }
            }
        })
        .set_retry(RetryPolicy {
            max_retries: 2,
            backoff: BackoffKind::Linear,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter: false,
            should_retry: Arc::new(|_| true),
        })
        .build();

        let handle = action.invoke((), InvokeOptions::default());
        assert_eq!(handle.result().await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_policy_aborts_slow_handler() {
        let action = create_context_action(|_ctx: ActionContext, _: ()| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, TestError>(())
        })
        .set_timeout(TimeoutPolicy::from_millis(10))
        .unwrap()
        .build();

        let handle = action.invoke((), InvokeOptions::default());
        let err = handle.result().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn cancel_before_dispatch_short_circuits_the_handler() {
        let action = create_action(|_: ()| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, TestError>(())
        })
        .set_concurrency(1)
        .unwrap()
        .build();

        // occupy the single concurrency slot so the next invocation queues
        let _blocker_handle = action.invoke((), InvokeOptions::default());
        tokio::task::yield_now().await;

        let handle = action.invoke((), InvokeOptions::default());
        handle.cancel(Some("no longer needed".into()));
        let err = handle.result().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_all_where_uses_predicate_reason() {
        let action = create_action(|_: ()| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, TestError>(())
        })
        .set_concurrency(1)
        .unwrap()
        .build();

        let h1 = action.invoke((), InvokeOptions::default());
        let h2 = action.invoke((), InvokeOptions::default());
        let target = h2.action_id();

        let cancelled = action.cancel_all_where(|id| {
            if id == target {
                Some("targeted".to_string())
            } else {
                None
            }
        });
        assert_eq!(cancelled, 1);

        let h2_err = h2.result().await.unwrap_err();
        match h2_err.as_cancellation() {
            Some(c) => assert_eq!(c.reason.as_deref(), Some("targeted")),
            None => panic!("expected cancellation"),
        }

        // h1 is unaffected by the predicate and still runs to completion.
        drop(h1);
    }

    #[tokio::test]
    async fn nested_invocation_inherits_trace_id_via_ambient_context() {
        let seen_trace: Arc<StdMutex<Option<Uuid>>> = Arc::new(StdMutex::new(None));
        let seen_trace2 = Arc::clone(&seen_trace);

        let inner = create_context_action(move |ctx: ActionContext, _: ()| {
            let seen_trace = Arc::clone(&seen_trace2);
            async move {
                *seen_trace.lock().unwrap() = Some(ctx.trace_id());
                Ok::<_, TestError>(())
            }
        })
        .build();

        let outer = create_context_action(move |ctx: ActionContext, _: ()| {
            let inner = inner.clone();
            async move {
                let outer_trace = ctx.trace_id();
                inner.invoke((), InvokeOptions::default()).result().await.unwrap();
                Ok::<_, TestError>(outer_trace)
            }
        })
        .build();

        let handle = outer.invoke((), InvokeOptions::default());
        let outer_trace = handle.result().await.unwrap();
        assert_eq!(*seen_trace.lock().unwrap(), Some(outer_trace));
    }
}
