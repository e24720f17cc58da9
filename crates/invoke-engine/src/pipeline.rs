//! The invocation pipeline: the per-invocation state machine that composes
//! retry, timeout, cancellation, and wide-event emission around one handler
//! call.
//!
//! Grounded on the retry/backoff attempt loop shape used by the teacher
//! crate's step executor, generalized with cooperative cancellation and
//! per-attempt timeout racing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ambient::SharedContext;
use crate::attachment::AttachmentValue;
use crate::error::{CancelState, CancellationError, PipelineError, TimeoutError};
use crate::event::WideEvent;

/// A handler call already bound to its input; invoked once per attempt with
/// the invocation's ambient context and a per-attempt cancellation token.
pub type AttemptFn<Out, E> = Box<
    dyn Fn(SharedContext, CancellationToken) -> Pin<Box<dyn Future<Output = Result<Out, E>> + Send>>
        + Send,
>;

/// Linear or exponential backoff between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Linear,
    Exponential,
}

/// How the pipeline decides whether a failed attempt gets retried.
pub enum RetryableError<'a, E> {
    Handler(&'a E),
    Timeout(&'a TimeoutError),
}

/// Per-action retry configuration.
pub struct RetryPolicy<E> {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub should_retry: Arc<dyn Fn(&RetryableError<'_, E>) -> bool + Send + Sync>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            backoff: self.backoff,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
            should_retry: Arc::clone(&self.should_retry),
        }
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: false,
            should_retry: Arc::new(|_| true),
        }
    }
}

/// Per-attempt timeout configuration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub duration_ms: u64,
    pub throw_on_timeout: bool,
    pub abort_signal: bool,
}

impl TimeoutPolicy {
    /// The spec's shorthand form: `.setTimeout(ms)`, forced (non-cooperative)
    /// and throwing on expiry.
    pub fn from_millis(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            throw_on_timeout: true,
            abort_signal: false,
        }
    }

    /// Opt into cooperative cancellation: the pipeline aborts the handler's
    /// token on timeout instead of just discarding its eventual outcome.
    pub fn with_abort_signal(mut self) -> Self {
        self.abort_signal = true;
        self
    }

    /// Timeout becomes a successful `Out::default()` outcome (still marked
    /// `timed_out` in the terminal event) instead of a `TimeoutError`.
    pub fn without_throwing(mut self) -> Self {
        self.throw_on_timeout = false;
        self
    }
}

/// `linear: baseDelay * attemptNumber`, `exponential: baseDelay *
/// 2^(attemptNumber - 1)`, capped at `maxDelay`, optionally jittered to a
/// uniform fraction in `[0.5, 1.0)`, floored to an integer millisecond
/// count. `attempt_number` is 1 for the first retry.
fn compute_delay_ms<E>(policy: &RetryPolicy<E>, attempt_number: u32) -> u64 {
    let raw = match policy.backoff {
        BackoffKind::Linear => policy.base_delay_ms.saturating_mul(attempt_number as u64),
        BackoffKind::Exponential => {
            let exponent = attempt_number.saturating_sub(1).min(63);
            policy.base_delay_ms.saturating_mul(1u64 << exponent)
        }
    };
    let capped = raw.min(policy.max_delay_ms);
    if policy.jitter {
        let factor = rand::thread_rng().gen_range(0.5..1.0);
        ((capped as f64) * factor).floor() as u64
    } else {
        capped
    }
}

enum AttemptRaw<Out, E> {
    Finished(Result<Out, E>),
    TimedOut,
    Cancelled,
    Panicked,
}

enum AttemptFailure<E> {
    Handler(E),
    Timeout(TimeoutError),
    Cancelled(CancelState),
}

/// Race one handler attempt against an optional timeout and the outer
/// cancellation token. The handler is spawned on its own task so that, in
/// forced (non-cooperative) timeout mode, it may keep running in the
/// background after the race is lost — its eventual outcome is simply
/// discarded, matching forced-timeout semantics.
async fn run_one_attempt<Out, E>(
    attempt_fn: &AttemptFn<Out, E>,
    ctx: SharedContext,
    inner_token: CancellationToken,
    outer_token: CancellationToken,
    timeout: Option<TimeoutPolicy>,
) -> AttemptRaw<Out, E>
where
    Out: Send + 'static,
    E: Send + 'static,
{
    let fut = attempt_fn(ctx, inner_token);
    let task = tokio::spawn(fut);

    let timeout_duration = timeout.map(|t| Duration::from_millis(t.duration_ms));

    tokio::select! {
        biased;
        _ = outer_token.cancelled() => AttemptRaw::Cancelled,
        _ = sleep_optional(timeout_duration) => AttemptRaw::TimedOut,
        joined = task => match joined {
            Ok(result) => AttemptRaw::Finished(result),
            Err(_join_error) => AttemptRaw::Panicked,
        },
    }
}

/// Never resolves when `duration` is `None`, letting the other `select!`
/// branches decide the outcome.
async fn sleep_optional(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[allow(clippy::too_many_arguments)]
pub struct AttemptLoopConfig<Out, E> {
    pub action_id: Uuid,
    pub priority: u8,
    pub batch_id: Option<Uuid>,
    pub input: AttachmentValue,
    pub attempt_fn: AttemptFn<Out, E>,
    pub retry: RetryPolicy<E>,
    pub timeout: Option<TimeoutPolicy>,
    pub event_observer: Option<Arc<dyn Fn(WideEvent) + Send + Sync>>,
    pub error_sink: Arc<dyn Fn(&dyn std::error::Error) + Send + Sync>,
    pub out_to_attachment: Arc<dyn Fn(&Out) -> AttachmentValue + Send + Sync>,
    pub err_to_string: Arc<dyn Fn(&E) -> String + Send + Sync>,
    /// Read the cancel reason once the token is observed tripped, shared
    /// with the `Handle` so reasons set via `Handle::cancel` are visible
    /// here without the scheduler needing to know about them.
    pub cancel_reason: Arc<dyn Fn() -> Option<String> + Send + Sync>,
}

/// Run the full per-invocation state machine: the attempt/retry loop,
/// intermediate event emission, and terminal wide-event construction.
/// Returns the settled outcome together with the terminal event so the
/// caller can roll it up into a parent context and complete the
/// event-logged future.
pub async fn run_attempt_loop<Out, E>(
    cfg: AttemptLoopConfig<Out, E>,
    ctx: SharedContext,
    token: CancellationToken,
) -> (Result<Out, PipelineError<E>>, WideEvent)
where
    Out: Default + Send + 'static,
    E: Send + 'static,
{
    let started_at = Utc::now();
    let start_instant = Instant::now();

    let mut retry_delays_ms: Vec<u64> = Vec::new();
    let mut last_execution_time_ms: Option<u64> = None;
    let mut timed_out = false;
    let mut total_attempts: u32 = 0;
    let (trace_id, depth, parent_action_id) = {
        let guard = ctx.lock().unwrap();
        (
            guard.trace_id,
            guard.depth,
            guard.parent.as_ref().map(|p| p.action_id),
        )
    };

    let mut attempt: u32 = 0;
    let outcome: Result<Out, PipelineError<E>> = loop {
        if token.is_cancelled() {
            let state = if attempt == 0 {
                CancelState::Queued
            } else {
                CancelState::Running
            };
            break Err(PipelineError::Cancelled(CancellationError::new(
                (cfg.cancel_reason)(),
                state,
            )));
        }

        let attempt_start = Instant::now();
        let inner_token = token.child_token();
        let raw = run_one_attempt(
            &cfg.attempt_fn,
            Arc::clone(&ctx),
            inner_token.clone(),
            token.clone(),
            cfg.timeout,
        )
        .await;
        let execution_time_ms = attempt_start.elapsed().as_millis() as u64;
        last_execution_time_ms = Some(execution_time_ms);
        total_attempts = attempt + 1;

        let failure = match raw {
            AttemptRaw::Finished(Ok(value)) => break Ok(value),
            AttemptRaw::Finished(Err(e)) => AttemptFailure::Handler(e),
            AttemptRaw::TimedOut => {
                timed_out = true;
                if let Some(policy) = cfg.timeout {
                    if policy.abort_signal {
                        inner_token.cancel();
                    }
                }
                AttemptFailure::Timeout(TimeoutError {
                    duration: Duration::from_millis(
                        cfg.timeout.map(|t| t.duration_ms).unwrap_or(0),
                    ),
                })
            }
            AttemptRaw::Cancelled => AttemptFailure::Cancelled(CancelState::Running),
            AttemptRaw::Panicked => {
                (cfg.error_sink)(&PanicPlaceholder);
                AttemptFailure::Cancelled(CancelState::Running)
            }
        };

        if let AttemptFailure::Cancelled(state) = failure {
            break Err(PipelineError::Cancelled(CancellationError::new(
                (cfg.cancel_reason)(),
                state,
            )));
        }

        let is_last_attempt = attempt >= cfg.retry.max_retries;
        let retryable = match &failure {
            AttemptFailure::Handler(e) => {
                (cfg.retry.should_retry)(&RetryableError::Handler(e))
            }
            AttemptFailure::Timeout(te) => {
                (cfg.retry.should_retry)(&RetryableError::Timeout(te))
            }
            AttemptFailure::Cancelled(_) => false,
        };

        if is_last_attempt || !retryable {
            break match failure {
                AttemptFailure::Handler(e) => Err(PipelineError::Handler(e)),
                AttemptFailure::Timeout(te) => {
                    let throw_on_timeout = cfg
                        .timeout
                        .map(|t| t.throw_on_timeout)
                        .unwrap_or(true);
                    if throw_on_timeout {
                        Err(PipelineError::Timeout(te))
                    } else {
                        Ok(Out::default())
                    }
                }
                AttemptFailure::Cancelled(_) => unreachable!("handled above"),
            };
        }

        let attempt_number = attempt + 1;
        let delay_ms = compute_delay_ms(&cfg.retry, attempt_number);
        retry_delays_ms.push(delay_ms);

        let error_message = match &failure {
            AttemptFailure::Handler(e) => (cfg.err_to_string)(e),
            AttemptFailure::Timeout(te) => te.to_string(),
            AttemptFailure::Cancelled(_) => unreachable!("handled above"),
        };

        tracing::warn!(
            action_id = %cfg.action_id,
            attempt,
            delay_ms,
            "attempt failed, retrying"
        );

        if let Some(observer) = &cfg.event_observer {
            let intermediate = build_event(&EventArgs {
                action_id: cfg.action_id,
                started_at,
                completed_at: None,
                duration_ms: start_instant.elapsed().as_millis() as u64,
                priority: cfg.priority,
                input: cfg.input.clone(),
                output: None,
                error: Some(error_message),
                attachments: ctx.lock().unwrap().attachments_snapshot(),
                trace_id,
                parent_action_id,
                depth,
                child_action_ids: ctx.lock().unwrap().child_action_ids().to_vec(),
                children: Vec::new(),
                child_duration_ms: 0,
                batch_id: cfg.batch_id,
                retry_attempt: Some(attempt),
                total_attempts: Some(total_attempts),
                is_retry: attempt > 0,
                will_retry: true,
                retry_delays_ms: retry_delays_ms.clone(),
                timeout_ms: cfg.timeout.map(|t| t.duration_ms),
                timed_out,
                execution_time_ms: last_execution_time_ms,
                cancelled: false,
                cancel_reason: None,
                cancelled_at: None,
            });
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(intermediate)));
            if result.is_err() {
                (cfg.error_sink)(&PanicPlaceholder);
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                break Err(PipelineError::Cancelled(CancellationError::new(
                    (cfg.cancel_reason)(),
                    CancelState::RetryDelay,
                )));
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }

        attempt += 1;
    };

    let completed_at = Utc::now();
    let duration_ms = start_instant.elapsed().as_millis() as u64;

    let (cancelled, cancel_reason, cancelled_at) = match &outcome {
        Ok(_) => (false, None, None),
        Err(PipelineError::Cancelled(c)) => (true, c.reason.clone(), Some(c.state)),
        Err(_) => (false, None, None),
    };

    let output = outcome
        .as_ref()
        .ok()
        .map(|value| (cfg.out_to_attachment)(value));
    let error = outcome.as_ref().err().map(|e| match e {
        PipelineError::Handler(inner) => (cfg.err_to_string)(inner),
        PipelineError::Timeout(t) => t.to_string(),
        PipelineError::Cancelled(c) => c.to_string(),
    });

    let mut child_events = ctx.lock().unwrap().take_child_events();
    let child_duration_ms = ctx.lock().unwrap().child_duration().as_millis() as u64;
    let attachments_snapshot = ctx.lock().unwrap().attachments_snapshot();
    let child_action_ids = ctx.lock().unwrap().child_action_ids().to_vec();
    child_events.sort_by_key(|e| e.started_at);

    let mut terminal = build_event(&EventArgs {
        action_id: cfg.action_id,
        started_at,
        completed_at: Some(completed_at),
        duration_ms,
        priority: cfg.priority,
        input: cfg.input,
        output,
        error,
        attachments: attachments_snapshot,
        trace_id,
        parent_action_id,
        depth,
        child_action_ids,
        children: child_events,
        child_duration_ms,
        batch_id: cfg.batch_id,
        retry_attempt: if total_attempts > 0 {
            Some(total_attempts - 1)
        } else {
            None
        },
        total_attempts: Some(total_attempts),
        is_retry: total_attempts > 1,
        will_retry: false,
        retry_delays_ms,
        timeout_ms: cfg.timeout.map(|t| t.duration_ms),
        timed_out,
        execution_time_ms: last_execution_time_ms,
        cancelled,
        cancel_reason,
        cancelled_at,
    });
    terminal.compute_self_duration();

    if let Some(observer) = &cfg.event_observer {
        let event_clone = terminal.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(event_clone)));
        if result.is_err() {
            (cfg.error_sink)(&PanicPlaceholder);
        }
    }

    (outcome, terminal)
}

/// A placeholder error value routed to the error sink when an observer or
/// the spawned handler task panics; we cannot reconstruct the panic payload
/// as a `std::error::Error`.
#[derive(Debug)]
struct PanicPlaceholder;

impl std::fmt::Display for PanicPlaceholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a callback or handler task panicked")
    }
}

impl std::error::Error for PanicPlaceholder {}

#[allow(clippy::too_many_arguments)]
struct EventArgs {
    action_id: Uuid,
    started_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
    duration_ms: u64,
    priority: u8,
    input: AttachmentValue,
    output: Option<AttachmentValue>,
    error: Option<String>,
    attachments: AttachmentValue,
    trace_id: Uuid,
    parent_action_id: Option<Uuid>,
    depth: usize,
    child_action_ids: Vec<Uuid>,
    children: Vec<WideEvent>,
    child_duration_ms: u64,
    batch_id: Option<Uuid>,
    retry_attempt: Option<u32>,
    total_attempts: Option<u32>,
    is_retry: bool,
    will_retry: bool,
    retry_delays_ms: Vec<u64>,
    timeout_ms: Option<u64>,
    timed_out: bool,
    execution_time_ms: Option<u64>,
    cancelled: bool,
    cancel_reason: Option<String>,
    cancelled_at: Option<CancelState>,
}

fn build_event(args: &EventArgs) -> WideEvent {
    WideEvent {
        action_id: args.action_id,
        started_at: args.started_at,
        completed_at: args.completed_at,
        duration_ms: args.duration_ms,
        priority: args.priority,
        input: args.input.clone(),
        output: args.output.clone(),
        error: args.error.clone(),
        attachments: args.attachments.clone(),
        trace_id: args.trace_id,
        parent_action_id: args.parent_action_id,
        depth: args.depth,
        child_action_ids: args.child_action_ids.clone(),
        children: args.children.clone(),
        child_duration_ms: args.child_duration_ms,
        self_duration_ms: 0,
        batch_id: args.batch_id,
        retry_attempt: args.retry_attempt,
        total_attempts: args.total_attempts,
        is_retry: args.is_retry,
        will_retry: args.will_retry,
        retry_delays_ms: args.retry_delays_ms.clone(),
        timeout_ms: args.timeout_ms,
        timed_out: args.timed_out,
        execution_time_ms: args.execution_time_ms,
        cancelled: args.cancelled,
        cancel_reason: args.cancel_reason.clone(),
        cancelled_at: args.cancelled_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{InvocationContext, WarningThresholds};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_ctx() -> SharedContext {
        Arc::new(std::sync::Mutex::new(InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_millis(100),
        )))
    }

    fn no_op_sink() -> Arc<dyn Fn(&dyn std::error::Error) + Send + Sync> {
        Arc::new(|_| {})
    }

    fn identity_out() -> Arc<dyn Fn(&String) -> AttachmentValue + Send + Sync> {
        Arc::new(|s: &String| AttachmentValue::String(s.clone()))
    }

    fn identity_err() -> Arc<dyn Fn(&String) -> String + Send + Sync> {
        Arc::new(|e: &String| e.clone())
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_with_no_retries() {
        let attempt_fn: AttemptFn<String, String> =
            Box::new(|_ctx, _token| Box::pin(async { Ok("ok".to_string()) }));

        let cfg = AttemptLoopConfig {
            action_id: Uuid::new_v4(),
            priority: 50,
            batch_id: None,
            input: AttachmentValue::Null,
            attempt_fn,
            retry: RetryPolicy::default(),
            timeout: None,
            event_observer: None,
            error_sink: no_op_sink(),
            out_to_attachment: identity_out(),
            err_to_string: identity_err(),
            cancel_reason: Arc::new(|| None),
        };

        let (result, event) = run_attempt_loop(cfg, test_ctx(), CancellationToken::new()).await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(event.total_attempts, Some(1));
        assert!(!event.is_retry);
    }

    #[tokio::test]
    async fn retries_on_failure_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let attempt_fn: AttemptFn<String, String> = Box::new(move |_ctx, _token| {
            let calls = Arc::clone(&calls2);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("boom".to_string())
                } else {
                    Ok("ok".to_string())
                }
            })
        });

        let cfg = AttemptLoopConfig {
            action_id: Uuid::new_v4(),
            priority: 50,
            batch_id: None,
            input: AttachmentValue::Null,
            attempt_fn,
            retry: RetryPolicy {
                max_retries: 3,
                backoff: BackoffKind::Linear,
                base_delay_ms: 5,
                max_delay_ms: 1000,
                jitter: false,
                should_retry: Arc::new(|_| true),
            },
            timeout: None,
            event_observer: None,
            error_sink: no_op_sink(),
            out_to_attachment: identity_out(),
            err_to_string: identity_err(),
            cancel_reason: Arc::new(|| None),
        };

        let (result, event) = run_attempt_loop(cfg, test_ctx(), CancellationToken::new()).await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(event.total_attempts, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn max_retries_zero_means_one_attempt() {
        let attempt_fn: AttemptFn<String, String> =
            Box::new(|_ctx, _token| Box::pin(async { Err("nope".to_string()) }));

        let cfg = AttemptLoopConfig {
            action_id: Uuid::new_v4(),
            priority: 50,
            batch_id: None,
            input: AttachmentValue::Null,
            attempt_fn,
            retry: RetryPolicy::default(),
            timeout: None,
            event_observer: None,
            error_sink: no_op_sink(),
            out_to_attachment: identity_out(),
            err_to_string: identity_err(),
            cancel_reason: Arc::new(|| None),
        };

        let (result, event) = run_attempt_loop(cfg, test_ctx(), CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::Handler(_))));
        assert_eq!(event.total_attempts, Some(1));
    }

    #[tokio::test]
    async fn timeout_fires_and_reports_duration() {
        let attempt_fn: AttemptFn<String, String> = Box::new(|_ctx, _token| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("too slow".to_string())
            })
        });

        let cfg = AttemptLoopConfig {
            action_id: Uuid::new_v4(),
            priority: 50,
            batch_id: None,
            input: AttachmentValue::Null,
            attempt_fn,
            retry: RetryPolicy::default(),
            timeout: Some(TimeoutPolicy {
                duration_ms: 20,
                throw_on_timeout: true,
                abort_signal: false,
            }),
            event_observer: None,
            error_sink: no_op_sink(),
            out_to_attachment: identity_out(),
            err_to_string: identity_err(),
            cancel_reason: Arc::new(|| None),
        };

        let (result, event) = run_attempt_loop(cfg, test_ctx(), CancellationToken::new()).await;
        match result {
            Err(PipelineError::Timeout(t)) => assert_eq!(t.duration, Duration::from_millis(20)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(event.timed_out);
    }

    #[tokio::test]
    async fn non_throwing_timeout_materializes_default_output() {
        let attempt_fn: AttemptFn<String, String> = Box::new(|_ctx, _token| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("too slow".to_string())
            })
        });

        let cfg = AttemptLoopConfig {
            action_id: Uuid::new_v4(),
            priority: 50,
            batch_id: None,
            input: AttachmentValue::Null,
            attempt_fn,
            retry: RetryPolicy::default(),
            timeout: Some(TimeoutPolicy {
                duration_ms: 20,
                throw_on_timeout: false,
                abort_signal: false,
            }),
            event_observer: None,
            error_sink: no_op_sink(),
            out_to_attachment: identity_out(),
            err_to_string: identity_err(),
            cancel_reason: Arc::new(|| None),
        };

        let (result, event) = run_attempt_loop(cfg, test_ctx(), CancellationToken::new()).await;
        assert_eq!(result.unwrap(), String::default());
        assert!(event.timed_out);
    }

    #[tokio::test]
    async fn cancellation_is_never_retried() {
        let token = CancellationToken::new();
        token.cancel();

        let attempt_fn: AttemptFn<String, String> =
            Box::new(|_ctx, _token| Box::pin(async { Ok("ok".to_string()) }));

        let last_reason: Arc<StdMutex<Option<String>>> =
            Arc::new(StdMutex::new(Some("stop".to_string())));
        let reason_for_cb = Arc::clone(&last_reason);

        let cfg = AttemptLoopConfig {
            action_id: Uuid::new_v4(),
            priority: 50,
            batch_id: None,
            input: AttachmentValue::Null,
            attempt_fn,
            retry: RetryPolicy {
                max_retries: 5,
                ..RetryPolicy::default()
            },
            timeout: None,
            event_observer: None,
            error_sink: no_op_sink(),
            out_to_attachment: identity_out(),
            err_to_string: identity_err(),
            cancel_reason: Arc::new(move || reason_for_cb.lock().unwrap().clone()),
        };

        let (result, _event) = run_attempt_loop(cfg, test_ctx(), token).await;
        match result {
            Err(PipelineError::Cancelled(c)) => {
                assert_eq!(c.reason.as_deref(), Some("stop"));
                assert_eq!(c.state, CancelState::Queued);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
