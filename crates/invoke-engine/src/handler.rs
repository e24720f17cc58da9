//! The three handler shapes a user can register with an action.
//!
//! Spec §9 calls for discriminating on shape at construction rather than by
//! reflecting on argument count; in Rust that's simply three builder
//! constructors feeding three enum variants, each wrapped to the pipeline's
//! uniform `(SharedContext, CancellationToken) -> Result<Out, E>` call shape.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::action_context::ActionContext;

pub(crate) type BoxFuture<Out, E> = Pin<Box<dyn Future<Output = Result<Out, E>> + Send>>;

/// A plain handler: takes just the invocation's input.
pub type PlainFn<In, Out, E> = Arc<dyn Fn(In) -> BoxFuture<Out, E> + Send + Sync>;

/// A context-shaped handler: takes the invocation's [`ActionContext`] first,
/// for direct attach/progress access without reaching into ambient state.
pub type ContextFn<In, Out, E> = Arc<dyn Fn(ActionContext, In) -> BoxFuture<Out, E> + Send + Sync>;

/// A token-shaped handler: takes a cooperative [`CancellationToken`] first,
/// for handlers that want to race their own internal work against abort.
pub type TokenFn<In, Out, E> =
    Arc<dyn Fn(CancellationToken, In) -> BoxFuture<Out, E> + Send + Sync>;

/// Which of the three call shapes a handler was registered with.
pub enum HandlerKind<In, Out, E> {
    Plain(PlainFn<In, Out, E>),
    Context(ContextFn<In, Out, E>),
    Token(TokenFn<In, Out, E>),
}

// Written by hand rather than derived: the fields are `Arc<dyn Fn>`, cheap to
// clone regardless of whether `In`/`Out`/`E` themselves are `Clone`, but
// `#[derive(Clone)]` would add exactly that (unnecessary) bound to every
// generic parameter.
impl<In, Out, E> Clone for HandlerKind<In, Out, E> {
    fn clone(&self) -> Self {
        match self {
            HandlerKind::Plain(f) => HandlerKind::Plain(Arc::clone(f)),
            HandlerKind::Context(f) => HandlerKind::Context(Arc::clone(f)),
            HandlerKind::Token(f) => HandlerKind::Token(Arc::clone(f)),
        }
    }
}

impl<In, Out, E> HandlerKind<In, Out, E>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
    E: Send + 'static,
{
    /// Adapt this handler to the pipeline's uniform per-attempt call shape.
    /// `action_ctx` is only constructed (and only cloned per attempt) when
    /// the handler is context-shaped.
    pub(crate) fn call(
        &self,
        input: In,
        action_ctx: impl Fn() -> ActionContext + Send + Sync + 'static,
        token: CancellationToken,
    ) -> BoxFuture<Out, E> {
        match self {
            HandlerKind::Plain(f) => f(input),
            HandlerKind::Context(f) => f(action_ctx(), input),
            HandlerKind::Token(f) => f(token, input),
        }
    }
}
