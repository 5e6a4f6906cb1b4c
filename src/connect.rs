use std::{fmt, future::Future, pin::Pin, time::Instant};

use crate::{
    connection::{Connection, ConnectionId},
    error::BoxError,
    event_loop::EventLoop,
    origin::Origin,
    request::PoolableRequest,
};

/// Alias for the `Future` type returned by a [`ConnectionFactory`].
pub type Connecting<R> = Pin<Box<dyn Future<Output = Result<Connection<R>, BoxError>> + Send>>;

/// Dials and prepares HTTP/1.1 transports for a pool.
///
/// It differs from a `tower` service in several ways:
///  * It is assumed that `make_connection` will always be ready to
///    poll.
///  * It does not need a mutable reference to `self`.
///  * Since trait objects cannot make use of associated types, it
///    requires wrapping the returned `Future` with `Box`.
///
/// The returned future must resolve to a [`Connection`] carrying the
/// target's id, pinned to the target's event loop. The deadline covers
/// the whole dial, TLS handshake included; on error the pool backs off
/// and retries while there is still demand for the connection.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The request type the produced transports execute.
    type Request: PoolableRequest;

    /// Start establishing one connection.
    fn make_connection(&self, target: ConnectTarget) -> Connecting<Self::Request>;
}

/// Everything a factory needs to dial one connection.
pub struct ConnectTarget {
    origin: Origin,
    id: ConnectionId,
    event_loop: EventLoop,
    deadline: Instant,
}

impl ConnectTarget {
    pub(crate) fn new(
        origin: Origin,
        id: ConnectionId,
        event_loop: EventLoop,
        deadline: Instant,
    ) -> Self {
        Self {
            origin,
            id,
            event_loop,
            deadline,
        }
    }

    /// The origin the pool is bound to.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The id the established connection must report.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The loop the transport must be pinned to.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Absolute deadline for the whole dial.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("origin", &self.origin)
            .field("id", &self.id)
            .field("event_loop", &self.event_loop)
            .finish()
    }
}
