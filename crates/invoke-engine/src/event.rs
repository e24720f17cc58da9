//! The wide event: one structured record per attempt or per invocation.
//!
//! Durations are carried as integer milliseconds rather than
//! `std::time::Duration` so the record serializes directly with `serde`
//! without a custom shim.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::attachment::AttachmentValue;
use crate::error::CancelState;

/// A terminal (or intermediate-retry) structured observability record.
///
/// Emitted once per failed-and-retried attempt (`is_retry = true`,
/// `will_retry = true`) and exactly once per invocation at settlement
/// (terminal). `self_duration_ms` excludes time spent in nested
/// invocations, so a parent handler that spends most of its wall time
/// awaiting children reports a small self-duration and a large
/// child-duration.
#[derive(Debug, Clone, Serialize)]
pub struct WideEvent {
    pub action_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub priority: u8,

    pub input: AttachmentValue,
    pub output: Option<AttachmentValue>,
    pub error: Option<String>,

    pub attachments: AttachmentValue,

    pub trace_id: Uuid,
    pub parent_action_id: Option<Uuid>,
    pub depth: usize,
    pub child_action_ids: Vec<Uuid>,
    pub children: Vec<WideEvent>,
    pub child_duration_ms: u64,
    pub self_duration_ms: u64,

    pub batch_id: Option<Uuid>,

    pub retry_attempt: Option<u32>,
    pub total_attempts: Option<u32>,
    pub is_retry: bool,
    pub will_retry: bool,
    pub retry_delays_ms: Vec<u64>,

    pub timeout_ms: Option<u64>,
    pub timed_out: bool,
    pub execution_time_ms: Option<u64>,

    pub cancelled: bool,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<CancelState>,
}

impl WideEvent {
    /// `self_duration = max(0, duration - child_duration)`, computed once
    /// the final `duration_ms` and accumulated `child_duration_ms` are
    /// known.
    pub fn compute_self_duration(&mut self) {
        self.self_duration_ms = self.duration_ms.saturating_sub(self.child_duration_ms);
    }
}
