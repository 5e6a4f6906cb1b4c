use std::{
    fmt,
    future::Future,
    hash::{Hash, Hasher},
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::rt::{BoxSendFuture, Executor, Sleep, Timer};

/// Identity of an [`EventLoop`], derived from its shared allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventLoopId(usize);

impl fmt::Debug for EventLoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventLoopId({:#x})", self.0)
    }
}

/// Handle to one event loop of the I/O runtime.
///
/// A connection is pinned to the loop it was dialed on for its entire
/// lifetime. The pool uses loop identity to match queued requests with
/// connections, and uses the handle itself to spawn dial tasks and
/// timers next to the transports they concern.
///
/// Two handles are equal iff they were cloned from the same
/// `EventLoop::new` call.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Box<dyn Executor<BoxSendFuture> + Send + Sync>,
    timer: Box<dyn Timer + Send + Sync>,
}

impl EventLoop {
    /// Bundle an executor and a timer into a loop handle.
    ///
    /// With a multi-threaded runtime this is a logical loop rather
    /// than a physical thread; the pool only relies on the identity
    /// and on `execute`/`sleep` going to the right place.
    pub fn new<E, M>(executor: E, timer: M) -> Self
    where
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
        M: Timer + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                executor: Box::new(executor),
                timer: Box::new(timer),
            }),
        }
    }

    pub fn id(&self) -> EventLoopId {
        EventLoopId(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.executor.execute(Box::pin(fut));
    }

    pub(crate) fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        self.inner.timer.sleep(duration)
    }

    pub(crate) fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
        self.inner.timer.sleep_until(deadline)
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventLoop {}

impl Hash for EventLoop {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventLoop").field(&self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::rt::{TokioExecutor, TokioTimer};

    use super::EventLoop;

    #[test]
    fn clones_share_identity() {
        let event_loop = EventLoop::new(TokioExecutor::new(), TokioTimer::new());
        let clone = event_loop.clone();
        assert_eq!(event_loop, clone);
        assert_eq!(event_loop.id(), clone.id());
    }

    #[test]
    fn separate_loops_differ() {
        let a = EventLoop::new(TokioExecutor::new(), TokioTimer::new());
        let b = EventLoop::new(TokioExecutor::new(), TokioTimer::new());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
