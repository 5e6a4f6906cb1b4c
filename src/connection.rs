use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::trace;

use crate::event_loop::EventLoop;

/// Identifier of one connection within its pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Hands out monotonically increasing connection ids.
pub(crate) struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// The capabilities a pooled HTTP/1.1 transport exposes to its pool.
///
/// A transport reports back by calling
/// [`Pool::connection_released`](crate::Pool::connection_released)
/// after each finished request and
/// [`Pool::connection_closed`](crate::Pool::connection_closed) when
/// its channel goes away. It should hold a
/// [`WeakPool`](crate::WeakPool) for that purpose; the connection
/// must not keep the pool alive.
pub trait Http1Transport<R>: Send + Sync + 'static {
    /// Run a request on the transport.
    fn execute(&self, request: Arc<R>);

    /// Cancel whatever is running, then close the channel.
    fn shutdown(&self);

    /// Close a transport that is assumed to be idle.
    fn close(&self);

    /// The event loop the transport lives on.
    fn event_loop(&self) -> &EventLoop;
}

/// Uniform handle over the transport variants the pool can hold.
///
/// Identity is the connection id; two handles are equal iff they refer
/// to the same pooled connection.
pub struct Connection<R> {
    id: ConnectionId,
    transport: Transport<R>,
}

enum Transport<R> {
    Http1(Arc<dyn Http1Transport<R>>),
    #[cfg(test)]
    Mock(mock::MockTransport<R>),
}

impl<R: 'static> Connection<R> {
    /// Wrap a freshly established HTTP/1.1 transport.
    ///
    /// `id` must be the id the factory was dialed with; the pool uses
    /// it to find the entry the dial belongs to.
    pub fn http1(id: ConnectionId, transport: Arc<dyn Http1Transport<R>>) -> Self {
        Self {
            id,
            transport: Transport::Http1(transport),
        }
    }

    #[cfg(test)]
    pub(crate) fn mock(id: ConnectionId, transport: mock::MockTransport<R>) -> Self {
        Self {
            id,
            transport: Transport::Mock(transport),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn event_loop(&self) -> &EventLoop {
        match &self.transport {
            Transport::Http1(transport) => transport.event_loop(),
            #[cfg(test)]
            Transport::Mock(transport) => transport.event_loop(),
        }
    }

    pub(crate) fn execute(&self, request: Arc<R>) {
        match &self.transport {
            Transport::Http1(transport) => transport.execute(request),
            #[cfg(test)]
            Transport::Mock(transport) => transport.execute(request),
        }
    }

    pub(crate) fn shutdown(&self) {
        trace!(connection = %self.id, "cancelling connection");
        match &self.transport {
            Transport::Http1(transport) => transport.shutdown(),
            #[cfg(test)]
            Transport::Mock(transport) => transport.shutdown(),
        }
    }

    pub(crate) fn close(&self) {
        trace!(connection = %self.id, "closing connection");
        match &self.transport {
            Transport::Http1(transport) => transport.close(),
            #[cfg(test)]
            Transport::Mock(transport) => transport.close(),
        }
    }
}

impl<R> Clone for Connection<R> {
    fn clone(&self) -> Self {
        let transport = match &self.transport {
            Transport::Http1(transport) => Transport::Http1(transport.clone()),
            #[cfg(test)]
            Transport::Mock(transport) => Transport::Mock(transport.clone()),
        };
        Self {
            id: self.id,
            transport,
        }
    }
}

impl<R> PartialEq for Connection<R> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.transport, &other.transport) {
            // Test stubs are fabricated with hand-picked ids; the loop
            // identity disambiguates stubs from different fixtures.
            #[cfg(test)]
            (Transport::Mock(a), Transport::Mock(b)) => {
                self.id == other.id && a.event_loop().id() == b.event_loop().id()
            }
            _ => self.id == other.id,
        }
    }
}

impl<R> Eq for Connection<R> {}

impl<R> Hash for Connection<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<R> fmt::Debug for Connection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match &self.transport {
            Transport::Http1(_) => "http1",
            #[cfg(test)]
            Transport::Mock(_) => "mock",
        };
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &variant)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Arc;

    use crate::{event_loop::EventLoop, sync::Mutex};

    /// Transport stub that records every capability call.
    pub(crate) struct MockTransport<R> {
        inner: Arc<Inner<R>>,
    }

    struct Inner<R> {
        event_loop: EventLoop,
        state: Mutex<State<R>>,
    }

    struct State<R> {
        executed: Vec<Arc<R>>,
        shutdown_calls: usize,
        close_calls: usize,
    }

    impl<R> MockTransport<R> {
        pub(crate) fn new(event_loop: EventLoop) -> Self {
            Self {
                inner: Arc::new(Inner {
                    event_loop,
                    state: Mutex::new(State {
                        executed: Vec::new(),
                        shutdown_calls: 0,
                        close_calls: 0,
                    }),
                }),
            }
        }

        pub(crate) fn event_loop(&self) -> &EventLoop {
            &self.inner.event_loop
        }

        pub(crate) fn executed(&self) -> Vec<Arc<R>> {
            self.inner.state.lock().executed.clone()
        }

        pub(crate) fn shutdown_calls(&self) -> usize {
            self.inner.state.lock().shutdown_calls
        }

        pub(crate) fn close_calls(&self) -> usize {
            self.inner.state.lock().close_calls
        }

        pub(crate) fn execute(&self, request: Arc<R>) {
            self.inner.state.lock().executed.push(request);
        }

        pub(crate) fn shutdown(&self) {
            self.inner.state.lock().shutdown_calls += 1;
        }

        pub(crate) fn close(&self) {
            self.inner.state.lock().close_calls += 1;
        }
    }

    impl<R> Clone for MockTransport<R> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
}
