//! A library-embedded action execution engine: priority-ordered,
//! concurrency- and rate-limited scheduling layered under a retry/timeout/
//! cancellation/observability invocation pipeline.
//!
//! There is no server loop, no wire protocol, and no CLI here — `Action` is
//! a value you construct once with [`create_action`] (or its context/token
//! variants) and then call [`Action::invoke`] on repeatedly from ordinary
//! async code.
//!
//! ```no_run
//! use invoke_engine::{create_action, InvokeOptions};
//!
//! # async fn run() {
//! let action = create_action(|n: i32| async move { Ok::<_, std::io::Error>(n * 2) })
//!     .set_concurrency(4).unwrap()
//!     .build();
//! let handle = action.invoke(21, InvokeOptions::default());
//! let doubled = handle.result().await.unwrap();
//! assert_eq!(doubled, 42);
//! # }
//! ```

mod action;
mod action_context;
mod ambient;
mod attachment;
mod batch;
mod context;
mod error;
mod event;
mod handle;
mod handler;
mod pipeline;
mod priority;
mod priority_queue;
mod rate_limit;
mod scheduler;

pub use action::{create_action, create_context_action, create_token_action, Action, ActionBuilder, InvokeOptions};
pub use action_context::ActionContext;
pub use attachment::{to_attachment, AttachmentValue};
pub use batch::{BatchEntry, BatchOptions};
pub use context::{ContextWarning, ProgressUpdate, WarningThresholds};
pub use error::{
    ActionError, CancelState, CancellationError, PipelineError, SchedulerError, TimeoutError,
    ValidationError,
};
pub use event::WideEvent;
pub use handle::Handle;
pub use pipeline::{BackoffKind, RetryPolicy, RetryableError, TimeoutPolicy};
pub use priority::Priority;
pub use scheduler::ShutdownMode;
