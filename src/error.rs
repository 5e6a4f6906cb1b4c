use std::{error::Error as StdError, fmt, sync::Arc};

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors a pool surfaces to the requests scheduled on it.
///
/// Transport dial failures cross the factory seam as [`BoxError`]s and
/// are reported through [`Error::Connect`] when a waiting request runs
/// out of time.
#[derive(Clone)]
#[non_exhaustive]
pub enum Error {
    /// The pool was already shut down when the request arrived.
    AlreadyShutdown,
    /// The pool shut down while the request was still waiting.
    Cancelled,
    /// The request deadline elapsed while waiting for a connection,
    /// and the pool had at least one established connection.
    GetConnectionFromPoolTimeout,
    /// The request deadline elapsed before any connection was
    /// established, with no dial failure on record.
    ConnectTimeout,
    /// The most recent connection attempt failed with this error.
    Connect(Arc<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn connect(err: BoxError) -> Self {
        Error::Connect(Arc::from(err))
    }

    /// Returns true if the request was cancelled by pool shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if the request timed out waiting for a connection.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::GetConnectionFromPoolTimeout | Error::ConnectTimeout
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyShutdown => f.write_str("pool is already shut down"),
            Error::Cancelled => f.write_str("request was cancelled"),
            Error::GetConnectionFromPoolTimeout => {
                f.write_str("timed out waiting for a connection from the pool")
            }
            Error::ConnectTimeout => f.write_str("timed out establishing a connection"),
            Error::Connect(err) => write!(f, "connection attempt failed: {err}"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyShutdown => f.write_str("AlreadyShutdown"),
            Error::Cancelled => f.write_str("Cancelled"),
            Error::GetConnectionFromPoolTimeout => f.write_str("GetConnectionFromPoolTimeout"),
            Error::ConnectTimeout => f.write_str("ConnectTimeout"),
            Error::Connect(err) => f.debug_tuple("Connect").field(err).finish(),
        }
    }
}

// Payload errors compare by identity: two `Connect` values are equal
// iff they carry the same recorded failure.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::AlreadyShutdown, Error::AlreadyShutdown) => true,
            (Error::Cancelled, Error::Cancelled) => true,
            (Error::GetConnectionFromPoolTimeout, Error::GetConnectionFromPoolTimeout) => true,
            (Error::ConnectTimeout, Error::ConnectTimeout) => true,
            (Error::Connect(a), Error::Connect(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Connect(err) => Some(&**err),
            _ => None,
        }
    }
}
