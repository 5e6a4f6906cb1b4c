//! Per-origin HTTP/1.1 connection pool core.
//!
//! This crate is the decision heart of an HTTP client: for every
//! request it decides whether to run it on an idle connection, queue
//! it until one frees up, or dial a new one. It drives the full
//! connection lifecycle (starting, backing off after a failed dial,
//! idle, leased, closing) under concurrent load, including request
//! and connection timers and orderly teardown.
//!
//! It deliberately does *not* speak HTTP on the wire. The transport,
//! the dialer and the request type are seams the embedding client
//! plugs in:
//!
//! - [`Http1Transport`]: an established connection that can run a
//!   request, be shut down, or be closed; it reports back through
//!   [`Pool::connection_released`] and [`Pool::connection_closed`].
//! - [`ConnectionFactory`]: dials and hands back a [`Connection`].
//! - [`PoolableRequest`]: the scheduled request, opaque apart from
//!   its routing attributes and deadline.
//! - [`EventLoop`]: a handle to the runtime the transports live on,
//!   built from the [`rt`] traits.
//!
//! Internally every event funnels through a single mutex-guarded
//! state machine that only *decides*; all I/O, timer scheduling and
//! callbacks happen after the lock is released. One `Pool` serves one
//! [`Origin`]; a client keeps one pool per origin it talks to.

mod config;
mod connect;
mod connection;
mod error;
mod event_loop;
mod origin;
mod pool;
mod request;
pub mod rt;
mod sync;

pub use self::{
    config::Config,
    connect::{ConnectTarget, Connecting, ConnectionFactory},
    connection::{Connection, ConnectionId, Http1Transport},
    error::{BoxError, Error},
    event_loop::{EventLoop, EventLoopId},
    origin::Origin,
    pool::{Pool, PoolDelegate, WeakPool},
    request::{PoolableRequest, RequestId},
};
