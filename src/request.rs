use std::{fmt, sync::Arc, time::Instant};

use crate::{
    error::Error,
    event_loop::{EventLoop, EventLoopId},
};

/// A request that can be scheduled on a [`Pool`](crate::Pool).
///
/// The pool treats requests as opaque values: it reads the routing and
/// deadline attributes below, reports queueing and failure back, and
/// otherwise hands the request to a connection's transport untouched.
/// Requests are passed around as `Arc`s; their allocation is the
/// identity the pool tracks them by, so cancellation must use the same
/// `Arc` that was scheduled.
pub trait PoolableRequest: Send + Sync + 'static {
    /// The event loop this request would like to run on.
    fn preferred_event_loop(&self) -> &EventLoop;

    /// The event loop this request must run on, if any.
    fn required_event_loop(&self) -> Option<&EventLoop>;

    /// Absolute deadline for obtaining a connection.
    fn connection_deadline(&self) -> Instant;

    /// The request has been parked in the waiting queue.
    fn request_was_queued(&self);

    /// Deliver a pool-level failure to the request's owner.
    ///
    /// Called at most once per scheduling; after a request has been
    /// handed to a transport, failures are the transport's business.
    fn fail(&self, error: Error);
}

/// Stable identity of a scheduled request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    object: usize,
    event_loop: Option<EventLoopId>,
}

impl RequestId {
    pub(crate) fn new<R: PoolableRequest>(request: &Arc<R>) -> Self {
        Self {
            object: Arc::as_ptr(request) as usize,
            event_loop: request.required_event_loop().map(EventLoop::id),
        }
    }

    /// The required event loop baked into the id, used to select the
    /// right sub-queue without touching the request again.
    pub(crate) fn required_event_loop(&self) -> Option<EventLoopId> {
        self.event_loop
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({:#x})", self.object)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::PoolableRequest;
    use crate::{error::Error, event_loop::EventLoop, sync::Mutex};

    pub(crate) struct MockRequest {
        preferred: EventLoop,
        required: Option<EventLoop>,
        deadline: Instant,
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        queued: bool,
        failure: Option<Error>,
    }

    impl MockRequest {
        pub(crate) fn new(
            preferred: EventLoop,
            required: Option<EventLoop>,
            timeout: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                preferred,
                required,
                deadline: Instant::now() + timeout,
                state: Mutex::new(State::default()),
            })
        }

        pub(crate) fn was_queued(&self) -> bool {
            self.state.lock().queued
        }

        pub(crate) fn failure(&self) -> Option<Error> {
            self.state.lock().failure.clone()
        }
    }

    impl PoolableRequest for MockRequest {
        fn preferred_event_loop(&self) -> &EventLoop {
            &self.preferred
        }

        fn required_event_loop(&self) -> Option<&EventLoop> {
            self.required.as_ref()
        }

        fn connection_deadline(&self) -> Instant {
            self.deadline
        }

        fn request_was_queued(&self) {
            self.state.lock().queued = true;
        }

        fn fail(&self, error: Error) {
            let failure = &mut self.state.lock().failure;
            assert!(failure.is_none(), "request failed twice");
            *failure = Some(error);
        }
    }
}
