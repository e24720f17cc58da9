//! Ambient propagation of the current invocation context to nested
//! invocations, via tokio's task-local storage.
//!
//! A handler that calls another action's `invoke` does not pass its context
//! explicitly: the pipeline consults this module to find the enclosing
//! invocation (if any), inherits its trace-id, computes `depth + 1`, and
//! registers itself as a child. `tokio::task_local!` restores the binding
//! across every suspension point inside the scoped future, which is what
//! makes this correct for async handlers that `.await` arbitrarily deep.

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::context::InvocationContext;

/// A context shared between an invocation and its ambient binding so nested
/// invocations can register themselves as children of the live (not
/// snapshotted) parent.
pub type SharedContext = Arc<Mutex<InvocationContext>>;

tokio::task_local! {
    static CURRENT_CONTEXT: SharedContext;
}

/// Run `fut` with `ctx` bound as the ambient current context. Any nested
/// invocation awaited from within `fut` observes `ctx` via [`current`].
pub async fn scoped<F: Future>(ctx: SharedContext, fut: F) -> F::Output {
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// The ambient context of the invocation currently executing on this task,
/// if any. `None` at the root: the caller should start a fresh trace.
pub fn current() -> Option<SharedContext> {
    CURRENT_CONTEXT.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WarningThresholds;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn nested_invocation_sees_parent_as_ambient_current() {
        assert!(current().is_none());

        let root_id = Uuid::new_v4();
        let root_ctx: SharedContext = Arc::new(Mutex::new(InvocationContext::new_root(
            root_id,
            WarningThresholds::default(),
            Duration::from_millis(100),
        )));

        let observed_trace_id = scoped(Arc::clone(&root_ctx), async {
            let parent = current().expect("ambient context should be bound");
            let trace_id = parent.lock().unwrap().trace_id;

            // Simulate crossing a suspension point before reading ambient state.
            tokio::task::yield_now().await;
            assert!(current().is_some(), "binding must survive an await point");

            trace_id
        })
        .await;

        assert_eq!(observed_trace_id, root_ctx.lock().unwrap().trace_id);
        assert!(current().is_none(), "binding must not leak outside its scope");
    }
}
