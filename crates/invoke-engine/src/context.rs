//! Per-invocation context: attachments, progress, parent chain, child roll-up.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::attachment::AttachmentValue;
use crate::event::WideEvent;

/// Immutable view of an ancestor's identity and attachments, captured at the
/// moment a child context is created. Children never reach back into the
/// parent's live, mutable state.
#[derive(Debug, Clone)]
pub struct ParentSnapshot {
    pub action_id: Uuid,
    pub trace_id: Uuid,
    pub depth: usize,
    pub attachments: AttachmentValue,
}

/// Optional limits that, when first crossed, fire a single warning for the
/// invocation and are then suppressed for the rest of its lifetime.
#[derive(Debug, Clone, Default)]
pub struct WarningThresholds {
    pub max_attachment_bytes: Option<usize>,
    pub max_depth: Option<usize>,
}

/// A crossed context-warning threshold, reported at most once per invocation.
#[derive(Debug, Clone, Copy)]
pub enum ContextWarning {
    AttachmentBytesExceeded { actual: usize, max: usize },
    DepthExceeded { actual: usize, max: usize },
}

/// A progress update ready to hand to the `.onProgress` observer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub completed: f64,
    pub total: f64,
    pub percentage: f64,
    pub rate: f64,
    pub eta_seconds: Option<f64>,
    pub label: Option<String>,
}

/// Exponentially-smoothed rate tracker with throttled emission.
struct Progress {
    total: f64,
    completed: f64,
    start_time: Instant,
    last_emit_time: Instant,
    last_emit_percent: f64,
    smoothed_rate: f64,
    throttle: Duration,
    pending_first_emit: bool,
}

impl Progress {
    fn new(throttle: Duration) -> Self {
        let now = Instant::now();
        Self {
            total: 0.0,
            completed: 0.0,
            start_time: now,
            last_emit_time: now,
            last_emit_percent: 0.0,
            smoothed_rate: 0.0,
            throttle,
            pending_first_emit: false,
        }
    }

    /// Resets `completed` and the start-time clock; the next update after
    /// this always emits.
    fn set_total(&mut self, total: f64) {
        self.total = total.max(0.0);
        self.completed = 0.0;
        self.start_time = Instant::now();
        self.last_emit_time = self.start_time;
        self.last_emit_percent = 0.0;
        self.smoothed_rate = 0.0;
        self.pending_first_emit = true;
    }

    fn report(&mut self, completed: f64, label: Option<String>) -> Option<ProgressUpdate> {
        let clamped = completed.max(0.0).min(self.total);
        self.update(clamped, label)
    }

    fn increment(&mut self, label: Option<String>) -> Option<ProgressUpdate> {
        let next = (self.completed + 1.0).min(self.total);
        self.update(next, label)
    }

    fn update(&mut self, completed: f64, label: Option<String>) -> Option<ProgressUpdate> {
        // total == 0 means progress was never configured; never emit.
        if self.total <= 0.0 {
            self.completed = completed;
            return None;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.start_time).as_secs_f64();
        let instant_rate = if elapsed > 0.0 { completed / elapsed } else { 0.0 };
        self.smoothed_rate = 0.7 * self.smoothed_rate + 0.3 * instant_rate;
        self.completed = completed;

        let percentage = (completed / self.total) * 100.0;
        let is_first = self.pending_first_emit;
        let is_complete = completed >= self.total;
        let big_jump = (percentage - self.last_emit_percent).abs() >= 5.0;
        let stale = now.duration_since(self.last_emit_time) >= self.throttle;

        if !(is_first || is_complete || big_jump || stale) {
            return None;
        }

        self.pending_first_emit = false;
        self.last_emit_time = now;
        self.last_emit_percent = percentage;

        let remaining = (self.total - completed).max(0.0);
        let eta_seconds = if self.smoothed_rate > 0.0 {
            Some(remaining / self.smoothed_rate)
        } else {
            None
        };

        Some(ProgressUpdate {
            completed,
            total: self.total,
            percentage,
            rate: self.smoothed_rate,
            eta_seconds,
            label,
        })
    }
}

/// Per-invocation context propagated (ambiently, see [`crate::ambient`]) to
/// nested invocations started from within a handler.
pub struct InvocationContext {
    pub action_id: Uuid,
    pub trace_id: Uuid,
    pub depth: usize,
    pub parent: Option<ParentSnapshot>,

    attachments: AttachmentValue,
    child_action_ids: Vec<Uuid>,
    child_events: Vec<WideEvent>,
    child_duration: Duration,

    progress: Progress,
    warning_thresholds: WarningThresholds,
    warning_fired: bool,
}

impl InvocationContext {
    /// Start a fresh root context: new trace-id, depth 0, no parent.
    pub fn new_root(
        action_id: Uuid,
        warning_thresholds: WarningThresholds,
        progress_throttle: Duration,
    ) -> Self {
        let mut ctx = Self {
            action_id,
            trace_id: Uuid::new_v4(),
            depth: 0,
            parent: None,
            attachments: AttachmentValue::record(),
            child_action_ids: Vec::new(),
            child_events: Vec::new(),
            child_duration: Duration::ZERO,
            progress: Progress::new(progress_throttle),
            warning_thresholds,
            warning_fired: false,
        };
        ctx.check_thresholds();
        ctx
    }

    /// Start a context nested under `parent`, inheriting its trace-id and
    /// incrementing depth. The parent's attachments are snapshotted, not
    /// shared.
    pub fn new_child(
        action_id: Uuid,
        parent: &InvocationContext,
        warning_thresholds: WarningThresholds,
        progress_throttle: Duration,
    ) -> Self {
        let mut ctx = Self {
            action_id,
            trace_id: parent.trace_id,
            depth: parent.depth + 1,
            parent: Some(ParentSnapshot {
                action_id: parent.action_id,
                trace_id: parent.trace_id,
                depth: parent.depth,
                attachments: parent.attachments_snapshot(),
            }),
            attachments: AttachmentValue::record(),
            child_action_ids: Vec::new(),
            child_events: Vec::new(),
            child_duration: Duration::ZERO,
            progress: Progress::new(progress_throttle),
            warning_thresholds,
            warning_fired: false,
        };
        ctx.check_thresholds();
        ctx
    }

    /// Merge `value` under `key` into the attachment tree (deep-merge if
    /// both sides are records), returning a warning the first time a
    /// configured threshold is crossed.
    pub fn attach(
        &mut self,
        key: impl Into<String>,
        value: AttachmentValue,
    ) -> Option<ContextWarning> {
        let key = key.into();
        if let AttachmentValue::Record(map) = &mut self.attachments {
            match map.get_mut(&key) {
                Some(existing) => existing.merge(value),
                None => {
                    map.insert(key, value);
                }
            }
        }
        self.check_thresholds()
    }

    /// Deep-merge a whole record at the attachment root.
    pub fn attach_record(&mut self, record: AttachmentValue) -> Option<ContextWarning> {
        self.attachments.merge(record);
        self.check_thresholds()
    }

    pub fn attachments_snapshot(&self) -> AttachmentValue {
        self.attachments.clone()
    }

    pub fn set_total(&mut self, total: f64) {
        self.progress.set_total(total);
    }

    pub fn report_progress(&mut self, completed: f64, label: Option<String>) -> Option<ProgressUpdate> {
        self.progress.report(completed, label)
    }

    pub fn increment_progress(&mut self, label: Option<String>) -> Option<ProgressUpdate> {
        self.progress.increment(label)
    }

    /// Register `child_action_id` as a child of this context at the moment
    /// the nested invocation begins. Idempotent.
    pub fn register_child_start(&mut self, child_action_id: Uuid) {
        if !self.child_action_ids.contains(&child_action_id) {
            self.child_action_ids.push(child_action_id);
        }
    }

    /// Roll a terminated child's wide event up into this context: append it
    /// to the child list and fold its duration into `child_duration`.
    pub fn register_child_complete(&mut self, event: WideEvent) {
        self.child_duration += Duration::from_millis(event.duration_ms);
        self.child_events.push(event);
    }

    pub fn child_action_ids(&self) -> &[Uuid] {
        &self.child_action_ids
    }

    pub fn take_child_events(&mut self) -> Vec<WideEvent> {
        std::mem::take(&mut self.child_events)
    }

    pub fn child_duration(&self) -> Duration {
        self.child_duration
    }

    fn check_thresholds(&mut self) -> Option<ContextWarning> {
        if self.warning_fired {
            return None;
        }
        if let Some(max_depth) = self.warning_thresholds.max_depth {
            if self.depth > max_depth {
                self.warning_fired = true;
                return Some(ContextWarning::DepthExceeded {
                    actual: self.depth,
                    max: max_depth,
                });
            }
        }
        if let Some(max_bytes) = self.warning_thresholds.max_attachment_bytes {
            let actual = self.attachments.estimated_size();
            if actual > max_bytes {
                self.warning_fired = true;
                return Some(ContextWarning::AttachmentBytesExceeded {
                    actual,
                    max: max_bytes,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_non_record_overwrites() {
        let mut ctx = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_millis(100),
        );
        ctx.attach("k", AttachmentValue::from("a"));
        ctx.attach("k", AttachmentValue::from("b"));
        if let AttachmentValue::Record(top) = ctx.attachments_snapshot() {
            assert_eq!(top.get("k"), Some(&AttachmentValue::String("b".into())));
        } else {
            panic!("expected root record");
        }
    }

    #[test]
    fn attach_sequence_matches_property_10() {
        let mut ctx = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_millis(100),
        );
        let mut a1 = std::collections::BTreeMap::new();
        a1.insert("a".to_string(), AttachmentValue::Number(1.0));
        ctx.attach("k", AttachmentValue::Record(a1));
        let mut a2 = std::collections::BTreeMap::new();
        a2.insert("b".to_string(), AttachmentValue::Number(2.0));
        ctx.attach("k", AttachmentValue::Record(a2));

        if let AttachmentValue::Record(top) = ctx.attachments_snapshot() {
            if let Some(AttachmentValue::Record(k)) = top.get("k") {
                assert_eq!(k.get("a"), Some(&AttachmentValue::Number(1.0)));
                assert_eq!(k.get("b"), Some(&AttachmentValue::Number(2.0)));
                return;
            }
        }
        panic!("expected merged record under k");
    }

    #[test]
    fn child_registration_is_deduplicated() {
        let mut ctx = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_millis(100),
        );
        let child_id = Uuid::new_v4();
        ctx.register_child_start(child_id);
        ctx.register_child_start(child_id);
        assert_eq!(ctx.child_action_ids().len(), 1);
    }

    #[test]
    fn new_child_inherits_trace_id_and_increments_depth() {
        let parent = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_millis(100),
        );
        let child = InvocationContext::new_child(
            Uuid::new_v4(),
            &parent,
            WarningThresholds::default(),
            Duration::from_millis(100),
        );
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.depth, parent.depth + 1);
    }

    #[test]
    fn no_progress_emitted_when_total_is_zero() {
        let mut ctx = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_millis(100),
        );
        assert!(ctx.report_progress(0.0, None).is_none());
        assert!(ctx.increment_progress(None).is_none());
    }

    #[test]
    fn progress_always_emits_first_update_and_completion() {
        let mut ctx = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds::default(),
            Duration::from_secs(10),
        );
        ctx.set_total(10.0);
        let first = ctx.report_progress(1.0, None);
        assert!(first.is_some());
        let last = ctx.report_progress(10.0, None);
        let update = last.unwrap();
        assert_eq!(update.percentage, 100.0);
        assert_eq!(update.completed, update.total);
    }

    #[test]
    fn depth_warning_fires_once() {
        let parent = InvocationContext::new_root(
            Uuid::new_v4(),
            WarningThresholds {
                max_depth: Some(0),
                max_attachment_bytes: None,
            },
            Duration::from_millis(100),
        );
        let mut child = InvocationContext::new_child(
            Uuid::new_v4(),
            &parent,
            WarningThresholds {
                max_depth: Some(0),
                max_attachment_bytes: None,
            },
            Duration::from_millis(100),
        );
        // new_child already checked thresholds once at construction; a
        // further attach must not refire.
        assert!(child.attach("x", AttachmentValue::Bool(true)).is_none());
    }
}
