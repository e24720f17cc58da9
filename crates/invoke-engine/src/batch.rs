//! Batch orchestrator (spec §4.G): `invoke_all` runs every payload as its
//! own invocation sharing one batch-id and waits for all of them, indexed by
//! input position; `invoke_stream` yields the same results in completion
//! order instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::action::{Action, InvokeOptions};
use crate::attachment::AttachmentValue;
use crate::context::{InvocationContext, WarningThresholds};
use crate::error::PipelineError;
use crate::priority::Priority;

/// One element of a batch result, indexed (in `invoke_stream`) or positioned
/// (in `invoke_all`) by the input's original slot. Exactly one of `data` /
/// `error` is populated, matching the spec's `{data, error: null}` shape.
#[derive(Debug)]
pub struct BatchEntry<Out, E> {
    pub data: Option<Out>,
    pub error: Option<PipelineError<E>>,
}

impl<Out, E> BatchEntry<Out, E> {
    fn ok(data: Out) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    fn err(error: PipelineError<E>) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

/// Options shared by every invocation created for one batch.
#[derive(Default, Clone)]
pub struct BatchOptions {
    pub priority: Option<Priority>,
    pub metadata: Option<AttachmentValue>,
    /// Throttle for the batch-level progress observer; defaults to the
    /// action's own `.onProgress` throttle if unset.
    pub progress_throttle: Option<Duration>,
}

type BatchProgressTracker = Arc<Mutex<InvocationContext>>;

impl<In, Out, E> Action<In, Out, E>
where
    In: Clone + Serialize + Send + 'static,
    Out: Default + Serialize + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create N invocations sharing one batch-id, all at the same priority
    /// and metadata; resolves once every one has settled. Results are
    /// ordered by input position, not completion order. One failure never
    /// cancels its siblings. Empty input resolves immediately to `[]`.
    pub async fn invoke_all(&self, payloads: Vec<In>, options: BatchOptions) -> Vec<BatchEntry<Out, E>> {
        if payloads.is_empty() {
            return Vec::new();
        }
        let total = payloads.len();
        let tracker = self.new_batch_progress_tracker(total, &options);

        let mut pending = self.spawn_batch(payloads, &options);
        let mut slots: Vec<Option<BatchEntry<Out, E>>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = pending.next().await {
            self.advance_batch_progress(&tracker);
            slots[index] = Some(outcome_to_entry(outcome));
        }
        slots
            .into_iter()
            .map(|slot| slot.expect("every batch index settles exactly once"))
            .collect()
    }

    /// Like `invoke_all`, but yields `(original_index, entry)` pairs in
    /// completion order as a lazy, finite stream rather than waiting for the
    /// whole batch. Empty input yields an empty stream immediately.
    pub fn invoke_stream(
        &self,
        payloads: Vec<In>,
        options: BatchOptions,
    ) -> Pin<Box<dyn Stream<Item = (usize, BatchEntry<Out, E>)> + Send>> {
        if payloads.is_empty() {
            return Box::pin(futures::stream::empty());
        }
        let total = payloads.len();
        let tracker = self.new_batch_progress_tracker(total, &options);
        let pending = self.spawn_batch(payloads, &options);

        let action = self.clone();
        Box::pin(pending.map(move |(index, outcome)| {
            action.advance_batch_progress(&tracker);
            (index, outcome_to_entry(outcome))
        }))
    }

    /// Submit every payload as its own invocation under one shared batch-id
    /// and return a completion-ordered stream of `(index, outcome)`.
    fn spawn_batch(
        &self,
        payloads: Vec<In>,
        options: &BatchOptions,
    ) -> FuturesUnordered<Pin<Box<dyn Future<Output = (usize, Result<Out, PipelineError<E>>)> + Send>>>
    {
        let batch_id = Uuid::new_v4();
        let pending = FuturesUnordered::new();
        for (index, payload) in payloads.into_iter().enumerate() {
            let handle = self.invoke_with_batch(
                payload,
                InvokeOptions {
                    priority: options.priority,
                    metadata: options.metadata.clone(),
                },
                Some(batch_id),
            );
            let fut: Pin<Box<dyn Future<Output = (usize, Result<Out, PipelineError<E>>)> + Send>> =
                Box::pin(async move { (index, handle.result().await) });
            pending.push(fut);
        }
        pending
    }

    /// Even without handler-level progress calls, the batch tracks
    /// completed/total across its children using the same throttle rules as
    /// `.onProgress` (spec §4.D); only constructed if an observer is set.
    fn new_batch_progress_tracker(
        &self,
        total: usize,
        options: &BatchOptions,
    ) -> Option<BatchProgressTracker> {
        self.progress_observer.as_ref().map(|(_, default_throttle)| {
            let throttle = options.progress_throttle.unwrap_or(*default_throttle);
            let ctx = Arc::new(Mutex::new(InvocationContext::new_root(
                Uuid::new_v4(),
                WarningThresholds::default(),
                throttle,
            )));
            ctx.lock().unwrap().set_total(total as f64);
            ctx
        })
    }

    fn advance_batch_progress(&self, tracker: &Option<BatchProgressTracker>) {
        if let (Some(tracker), Some((observer, _))) = (tracker, &self.progress_observer) {
            if let Some(update) = tracker.lock().unwrap().increment_progress(None) {
                observer(update);
            }
        }
    }
}

fn outcome_to_entry<Out, E>(outcome: Result<Out, PipelineError<E>>) -> BatchEntry<Out, E> {
    match outcome {
        Ok(data) => BatchEntry::ok(data),
        Err(err) => BatchEntry::err(err),
    }
}
