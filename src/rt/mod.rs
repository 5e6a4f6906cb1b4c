//! Runtime components
//!
//! The traits and types within this module are used to allow plugging
//! in runtime types. These include:
//!
//! - Executors
//! - Timers
//!
//! The pool itself never spawns or sleeps directly; everything goes
//! through an [`EventLoop`](crate::EventLoop) built from these traits.

mod timer;
mod tokio;

pub use self::{
    timer::{Sleep, Timer},
    tokio::{TokioExecutor, TokioTimer},
};

/// A boxed future spawned onto an executor.
pub type BoxSendFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// An executor of futures.
///
/// This trait allows abstracting over async runtimes. Implement this
/// trait for your own type.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone)]
/// struct TokioExecutor;
///
/// impl<F> Executor<F> for TokioExecutor
/// where
///     F: Future + Send + 'static,
///     F::Output: Send + 'static,
/// {
///     fn execute(&self, future: F) {
///         tokio::spawn(future);
///     }
/// }
/// ```
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}
