use std::{cmp, sync::Arc, time::Duration};

use rand::Rng;
use tracing::trace;

use super::{
    connections::{CleanupContext, ConnectionUse, Connections, FailedConnectionContext,
        IdleConnectionContext},
    queue::{RequestQueue, Waiter},
};
use crate::{
    connection::{Connection, ConnectionId},
    error::Error,
    event_loop::EventLoop,
    request::{PoolableRequest, RequestId},
};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// The decision engine of the pool.
///
/// Every externally driven event enters through one of the methods
/// below while the executor holds the state lock; each method mutates
/// the connection set and the request queue and returns the side
/// effects to perform once the lock is gone. Nothing in here does I/O,
/// touches a timer, or invokes a callback.
pub(super) struct StateMachine<R> {
    connections: Connections<R>,
    queue: RequestQueue<R>,
    state: LifecycleState,
    failed_consecutive_connection_attempts: usize,
    last_connect_failure: Option<Error>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleState {
    Running,
    ShuttingDown { unclean: bool },
    ShutDown,
}

/// What the executor must do after an event: at most one request-side
/// and one connection-side effect.
pub(super) struct Action<R> {
    pub(super) request: RequestAction<R>,
    pub(super) connection: ConnectionAction<R>,
}

impl<R> Action<R> {
    fn new(request: RequestAction<R>, connection: ConnectionAction<R>) -> Self {
        Self {
            request,
            connection,
        }
    }

    fn none() -> Self {
        Self::new(RequestAction::None, ConnectionAction::None)
    }
}

pub(super) enum RequestAction<R> {
    /// Hand the request to the connection, optionally cancelling its
    /// timeout timer first.
    Execute {
        waiter: Waiter<R>,
        connection: Connection<R>,
        cancel_timeout: bool,
    },
    Fail {
        waiter: Waiter<R>,
        error: Error,
        cancel_timeout: bool,
    },
    /// Fail a batch of waiters and cancel all their timeout timers.
    FailMany {
        waiters: Vec<Waiter<R>>,
        error: Error,
    },
    /// Arm the request-timeout timer on `event_loop` and notify the
    /// request that it has been queued.
    ScheduleTimeout {
        id: RequestId,
        request: Arc<R>,
        event_loop: EventLoop,
    },
    CancelTimeout {
        id: RequestId,
    },
    None,
}

pub(super) enum ConnectionAction<R> {
    /// Dial a new connection through the factory.
    Create {
        id: ConnectionId,
        event_loop: EventLoop,
    },
    ScheduleBackoffTimer {
        id: ConnectionId,
        backoff: Duration,
        event_loop: EventLoop,
    },
    ScheduleIdleTimeoutTimer {
        id: ConnectionId,
        event_loop: EventLoop,
    },
    CancelIdleTimeoutTimer {
        id: ConnectionId,
    },
    Close {
        connection: Connection<R>,
        is_shutdown: IsShutdown,
    },
    Cleanup {
        context: CleanupContext<R>,
        is_shutdown: IsShutdown,
    },
    None,
}

/// Whether an action completes the pool shutdown, and how cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum IsShutdown {
    No,
    Yes { unclean: bool },
}

impl<R: PoolableRequest> StateMachine<R> {
    pub(super) fn new(max_concurrent_connections: usize) -> Self {
        Self {
            connections: Connections::new(max_concurrent_connections),
            queue: RequestQueue::new(),
            state: LifecycleState::Running,
            failed_consecutive_connection_attempts: 0,
            last_connect_failure: None,
        }
    }

    pub(super) fn execute_request(&mut self, request: Arc<R>) -> Action<R> {
        match self.state {
            LifecycleState::Running => match request.required_event_loop().cloned() {
                Some(event_loop) => self.execute_request_on_required_event_loop(request, event_loop),
                None => {
                    let event_loop = request.preferred_event_loop().clone();
                    self.execute_request_on_preferred_event_loop(request, event_loop)
                }
            },
            LifecycleState::ShuttingDown { .. } | LifecycleState::ShutDown => Action::new(
                RequestAction::Fail {
                    waiter: Waiter::new(request),
                    error: Error::AlreadyShutdown,
                    cancel_timeout: false,
                },
                ConnectionAction::None,
            ),
        }
    }

    fn execute_request_on_required_event_loop(
        &mut self,
        request: Arc<R>,
        event_loop: EventLoop,
    ) -> Action<R> {
        if let Some(connection) = self.connections.lease_connection_on_required(event_loop.id()) {
            let id = connection.id();
            return Action::new(
                RequestAction::Execute {
                    waiter: Waiter::new(request),
                    connection,
                    cancel_timeout: false,
                },
                ConnectionAction::CancelIdleTimeoutTimer { id },
            );
        }

        let waiter = Waiter::new(request.clone());
        let id = waiter.id();
        self.queue.push(waiter);
        let request_action = RequestAction::ScheduleTimeout {
            id,
            request,
            event_loop: event_loop.clone(),
        };

        // Dial one bound connection per waiter that no pending dial
        // covers yet. These are overflow connections, outside the cap.
        let starting = self
            .connections
            .starting_event_loop_connections(event_loop.id());
        if starting < self.queue.count(event_loop.id()) {
            let connection_id = self.connections.create_new_overflow_connection(&event_loop);
            trace!(request = ?id, connection = %connection_id, "growing pool for required loop");
            return Action::new(
                request_action,
                ConnectionAction::Create {
                    id: connection_id,
                    event_loop,
                },
            );
        }
        Action::new(request_action, ConnectionAction::None)
    }

    fn execute_request_on_preferred_event_loop(
        &mut self,
        request: Arc<R>,
        event_loop: EventLoop,
    ) -> Action<R> {
        if let Some(connection) = self.connections.lease_connection_on_preferred(event_loop.id()) {
            let id = connection.id();
            return Action::new(
                RequestAction::Execute {
                    waiter: Waiter::new(request),
                    connection,
                    cancel_timeout: false,
                },
                ConnectionAction::CancelIdleTimeoutTimer { id },
            );
        }

        let waiter = Waiter::new(request.clone());
        let id = waiter.id();
        self.queue.push(waiter);
        let request_action = RequestAction::ScheduleTimeout {
            id,
            request,
            event_loop: event_loop.clone(),
        };

        if !self.connections.can_grow() {
            // at capacity; the request waits for a release
            return Action::new(request_action, ConnectionAction::None);
        }
        if self.connections.starting_general_purpose_connections()
            >= self.queue.general_purpose_count()
        {
            // enough dials in flight to cover the queued demand
            return Action::new(request_action, ConnectionAction::None);
        }
        let connection_id = self.connections.create_new_connection(&event_loop);
        trace!(request = ?id, connection = %connection_id, "growing pool");
        Action::new(
            request_action,
            ConnectionAction::Create {
                id: connection_id,
                event_loop,
            },
        )
    }

    pub(super) fn new_http1_connection_established(
        &mut self,
        connection: Connection<R>,
    ) -> Action<R> {
        self.failed_consecutive_connection_attempts = 0;
        self.last_connect_failure = None;
        let (index, context) = self
            .connections
            .new_http1_connection_established(connection);
        self.next_action_for_idle_connection(index, context)
    }

    pub(super) fn failed_to_create_new_connection(
        &mut self,
        error: Error,
        id: ConnectionId,
    ) -> Action<R> {
        self.failed_consecutive_connection_attempts += 1;
        self.last_connect_failure = Some(error);

        match self.state {
            LifecycleState::Running => {
                let event_loop = self.connections.backoff_next_connection_attempt(id);
                let backoff = Self::calculate_backoff(self.failed_consecutive_connection_attempts);
                Action::new(
                    RequestAction::None,
                    ConnectionAction::ScheduleBackoffTimer {
                        id,
                        backoff,
                        event_loop,
                    },
                )
            }
            LifecycleState::ShuttingDown { .. } => {
                let (index, context) = self
                    .connections
                    .fail_connection(id)
                    .expect("dial failure for a connection this pool is not starting");
                self.next_action_for_failed_connection(index, context)
            }
            LifecycleState::ShutDown => panic!("dial attempts cannot outlive the pool"),
        }
    }

    pub(super) fn connection_creation_backoff_done(&mut self, id: ConnectionId) -> Action<R> {
        match self.state {
            LifecycleState::Running => {
                let (index, context) = self
                    .connections
                    .fail_connection(id)
                    .expect("backoff timer fired for an untracked connection");
                self.next_action_for_failed_connection(index, context)
            }
            // shutdown cleanup already cancelled the attempt; losing
            // that race is fine
            LifecycleState::ShuttingDown { .. } | LifecycleState::ShutDown => Action::none(),
        }
    }

    pub(super) fn connection_idle_timeout(&mut self, id: ConnectionId) -> Action<R> {
        match self.connections.close_connection_if_idle(id) {
            Some(connection) => Action::new(
                RequestAction::None,
                ConnectionAction::Close {
                    connection,
                    is_shutdown: IsShutdown::No,
                },
            ),
            // lost the race against a lease
            None => Action::none(),
        }
    }

    pub(super) fn http1_connection_released(&mut self, id: ConnectionId) -> Action<R> {
        let (index, context) = self.connections.release_connection(id);
        self.next_action_for_idle_connection(index, context)
    }

    pub(super) fn connection_closed(&mut self, id: ConnectionId) -> Action<R> {
        match self.connections.fail_connection(id) {
            Some((index, context)) => self.next_action_for_failed_connection(index, context),
            // pool-initiated close; the entry is already gone
            None => Action::none(),
        }
    }

    pub(super) fn timeout_request(&mut self, id: RequestId) -> Action<R> {
        let Some(waiter) = self.queue.remove(id) else {
            // already dispatched or cancelled
            return Action::none();
        };
        let error = if let Some(error) = self.last_connect_failure.clone() {
            error
        } else if !self.connections.has_active_connections() {
            Error::ConnectTimeout
        } else {
            Error::GetConnectionFromPoolTimeout
        };
        Action::new(
            RequestAction::Fail {
                waiter,
                error,
                cancel_timeout: false,
            },
            ConnectionAction::None,
        )
    }

    pub(super) fn cancel_request(&mut self, id: RequestId) -> Action<R> {
        match self.queue.remove(id) {
            // The canceller already knows; only the timer needs to go.
            Some(_waiter) => Action::new(
                RequestAction::CancelTimeout { id },
                ConnectionAction::None,
            ),
            // already on a connection; cancellation is now the
            // transport's business
            None => Action::none(),
        }
    }

    pub(super) fn shutdown(&mut self) -> Action<R> {
        assert!(
            self.state == LifecycleState::Running,
            "shutdown may only be called once"
        );

        let waiters = self.queue.remove_all();
        let cleanup = self.connections.shutdown();
        let unclean = !(cleanup.cancel.is_empty() && waiters.is_empty());

        let request_action = if waiters.is_empty() {
            RequestAction::None
        } else {
            RequestAction::FailMany {
                waiters,
                error: Error::Cancelled,
            }
        };

        let is_shutdown = if self.connections.is_empty() {
            self.state = LifecycleState::ShutDown;
            IsShutdown::Yes { unclean }
        } else {
            self.state = LifecycleState::ShuttingDown { unclean };
            IsShutdown::No
        };
        Action::new(
            request_action,
            ConnectionAction::Cleanup {
                context: cleanup,
                is_shutdown,
            },
        )
    }

    fn next_action_for_idle_connection(
        &mut self,
        index: usize,
        context: IdleConnectionContext,
    ) -> Action<R> {
        match self.state {
            LifecycleState::Running => match context.use_case {
                ConnectionUse::GeneralPurpose => {
                    self.next_action_for_idle_general_purpose_connection(index, context)
                }
                ConnectionUse::EventLoopBound => {
                    self.next_action_for_idle_event_loop_connection(index, context)
                }
            },
            LifecycleState::ShuttingDown { unclean } => {
                debug_assert!(self.queue.is_empty());
                let connection = self.connections.close_connection_at(index);
                if self.connections.is_empty() {
                    self.state = LifecycleState::ShutDown;
                    return Action::new(
                        RequestAction::None,
                        ConnectionAction::Close {
                            connection,
                            is_shutdown: IsShutdown::Yes { unclean },
                        },
                    );
                }
                Action::new(
                    RequestAction::None,
                    ConnectionAction::Close {
                        connection,
                        is_shutdown: IsShutdown::No,
                    },
                )
            }
            LifecycleState::ShutDown => {
                panic!("connections cannot become idle after shutdown completed")
            }
        }
    }

    fn next_action_for_idle_general_purpose_connection(
        &mut self,
        index: usize,
        context: IdleConnectionContext,
    ) -> Action<R> {
        // general-purpose waiters first, then waiters bound to this
        // connection's loop, then park
        if let Some(waiter) = self.queue.pop_first(None) {
            let connection = self.connections.lease_connection_at(index);
            return Action::new(
                RequestAction::Execute {
                    waiter,
                    connection,
                    cancel_timeout: true,
                },
                ConnectionAction::None,
            );
        }
        if let Some(waiter) = self.queue.pop_first(Some(context.event_loop.id())) {
            let connection = self.connections.lease_connection_at(index);
            return Action::new(
                RequestAction::Execute {
                    waiter,
                    connection,
                    cancel_timeout: true,
                },
                ConnectionAction::None,
            );
        }
        let (id, event_loop) = self.connections.park_connection_at(index);
        Action::new(
            RequestAction::None,
            ConnectionAction::ScheduleIdleTimeoutTimer { id, event_loop },
        )
    }

    fn next_action_for_idle_event_loop_connection(
        &mut self,
        index: usize,
        context: IdleConnectionContext,
    ) -> Action<R> {
        if let Some(waiter) = self.queue.pop_first(Some(context.event_loop.id())) {
            let connection = self.connections.lease_connection_at(index);
            return Action::new(
                RequestAction::Execute {
                    waiter,
                    connection,
                    cancel_timeout: true,
                },
                ConnectionAction::None,
            );
        }
        // overflow connections are not parked
        let connection = self.connections.close_connection_at(index);
        Action::new(
            RequestAction::None,
            ConnectionAction::Close {
                connection,
                is_shutdown: IsShutdown::No,
            },
        )
    }

    fn next_action_for_failed_connection(
        &mut self,
        index: usize,
        context: FailedConnectionContext,
    ) -> Action<R> {
        match self.state {
            LifecycleState::Running => {
                let demand = match context.use_case {
                    ConnectionUse::GeneralPurpose => self.queue.general_purpose_count(),
                    ConnectionUse::EventLoopBound => self.queue.count(context.event_loop.id()),
                };
                if context.connections_starting_for_use_case < demand {
                    let (id, event_loop) = self.connections.replace_connection_at(index);
                    return Action::new(
                        RequestAction::None,
                        ConnectionAction::Create { id, event_loop },
                    );
                }
                self.connections.remove_connection_at(index);
                Action::none()
            }
            LifecycleState::ShuttingDown { unclean } => {
                self.connections.remove_connection_at(index);
                if self.connections.is_empty() {
                    self.state = LifecycleState::ShutDown;
                    return Action::new(
                        RequestAction::None,
                        ConnectionAction::Cleanup {
                            context: CleanupContext::new(),
                            is_shutdown: IsShutdown::Yes { unclean },
                        },
                    );
                }
                Action::none()
            }
            LifecycleState::ShutDown => {
                panic!("connections cannot fail after shutdown completed")
            }
        }
    }

    /// `min(60s, 100ms * 1.25^(attempts - 1))`, jittered by a uniform
    /// sample in ±3% of the delay. Saturates around attempt 29.
    fn calculate_backoff(attempts: usize) -> Duration {
        let exponential = BACKOFF_BASE.as_nanos() as f64 * 1.25f64.powi(attempts as i32 - 1);
        let backoff = cmp::min(BACKOFF_CAP, Duration::from_nanos(exponential as u64));

        let jitter_range = (backoff.as_nanos() as i64 / 100) * 3;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        if jitter < 0 {
            backoff - Duration::from_nanos(jitter.unsigned_abs())
        } else {
            backoff + Duration::from_nanos(jitter as u64)
        }
    }

    #[cfg(test)]
    pub(super) fn stats(&self) -> super::connections::Stats {
        self.connections.stats()
    }
}
