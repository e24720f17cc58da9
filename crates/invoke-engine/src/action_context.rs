//! The context-wrapper handle a `context`-shaped handler is invoked with.
//!
//! Thin wrapper over the live [`SharedContext`] that routes attach/progress
//! calls through their throttling and warning-threshold logic and, when
//! configured, forwards the results to the action's progress/warning
//! observers. Nested invocations made from inside the handler do *not* go
//! through this type: they pick up their parent via [`crate::ambient`]
//! regardless of which handler shape is in use.

use std::sync::Arc;

use uuid::Uuid;

use crate::ambient::SharedContext;
use crate::attachment::AttachmentValue;
use crate::context::{ContextWarning, ProgressUpdate};

/// Handle passed to a context-shaped handler (`Fn(ActionContext, In) -> ...`).
#[derive(Clone)]
pub struct ActionContext {
    shared: SharedContext,
    progress_observer: Option<(Arc<dyn Fn(ProgressUpdate) + Send + Sync>, std::time::Duration)>,
    warning_sink: Option<Arc<dyn Fn(ContextWarning) + Send + Sync>>,
}

impl ActionContext {
    pub(crate) fn new(
        shared: SharedContext,
        progress_observer: Option<(Arc<dyn Fn(ProgressUpdate) + Send + Sync>, std::time::Duration)>,
        warning_sink: Option<Arc<dyn Fn(ContextWarning) + Send + Sync>>,
    ) -> Self {
        Self {
            shared,
            progress_observer,
            warning_sink,
        }
    }

    pub fn action_id(&self) -> Uuid {
        self.shared.lock().unwrap().action_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.shared.lock().unwrap().trace_id
    }

    pub fn depth(&self) -> usize {
        self.shared.lock().unwrap().depth
    }

    /// Deep-merge `value` under `key` into the running attachment tree.
    pub fn attach(&self, key: impl Into<String>, value: AttachmentValue) {
        let warning = self.shared.lock().unwrap().attach(key, value);
        self.emit_warning(warning);
    }

    /// Deep-merge a whole record at the attachment root.
    pub fn attach_record(&self, record: AttachmentValue) {
        let warning = self.shared.lock().unwrap().attach_record(record);
        self.emit_warning(warning);
    }

    pub fn set_total(&self, total: f64) {
        self.shared.lock().unwrap().set_total(total);
    }

    pub fn report_progress(&self, completed: f64, label: Option<String>) {
        let update = self.shared.lock().unwrap().report_progress(completed, label);
        self.emit_progress(update);
    }

    pub fn increment_progress(&self, label: Option<String>) {
        let update = self.shared.lock().unwrap().increment_progress(label);
        self.emit_progress(update);
    }

    fn emit_progress(&self, update: Option<ProgressUpdate>) {
        if let (Some(update), Some((observer, _throttle))) = (update, &self.progress_observer) {
            observer(update);
        }
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
    use crate::context::InvocationContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn shared(thresholds: crate::context::WarningThresholds) -> SharedContext {
        Arc::new(std::sync::Mutex::new(InvocationContext::new_root(
            Uuid::new_v4(),
            thresholds,
            Duration::from_millis(10),
        )))
    }

    #[test]
    fn attach_is_visible_on_the_underlying_context() {
        let shared_ctx = shared(Default::default());
        let action_ctx = ActionContext::new(Arc::clone(&shared_ctx), None, None);
        action_ctx.attach("k", AttachmentValue::from("v"));
        if let AttachmentValue::Record(top) = shared_ctx.lock().unwrap().attachments_snapshot() {
            assert_eq!(top.get("k"), Some(&AttachmentValue::String("v".into())));
        } else {
            panic!("expected root record");
        }
    }

    #[test]
    fn progress_forwards_to_observer() {
        let shared_ctx = shared(Default::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let action_ctx = ActionContext::new(
            shared_ctx,
            Some((
                Arc::new(move |_update| {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(10),
            )),
            None,
        );
        action_ctx.set_total(10.0);
        action_ctx.increment_progress(None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attachment_byte_warning_forwards_to_sink_once() {
        let shared_ctx = shared(crate::context::WarningThresholds {
            max_depth: None,
            max_attachment_bytes: Some(1),
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let action_ctx = ActionContext::new(
            Arc::clone(&shared_ctx),
            None,
            Some(Arc::new(move |_warning| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        action_ctx.attach("k", AttachmentValue::String("far past one byte".into()));
        action_ctx.attach("k2", AttachmentValue::Bool(true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
