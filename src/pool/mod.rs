//! The per-origin pool: lock owner and side-effect layer.
//!
//! All decisions are made by the [`state_machine`] while the state
//! lock is held; everything with a side effect (dialing, timer
//! arming, transport calls, request callbacks) happens here, after
//! the lock is released.

mod connections;
mod queue;
mod state_machine;

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use futures_util::future::{self, Either};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use self::{
    connections::CleanupContext,
    state_machine::{Action, ConnectionAction, IsShutdown, RequestAction, StateMachine},
};
use crate::{
    config::Config,
    connect::{ConnectTarget, ConnectionFactory},
    connection::{Connection, ConnectionId},
    error::{BoxError, Error},
    event_loop::EventLoop,
    origin::Origin,
    request::{PoolableRequest, RequestId},
    sync::Mutex,
};

/// Receives the pool lifecycle notification.
pub trait PoolDelegate: Send + Sync + 'static {
    /// The pool finished shutting down. Delivered exactly once;
    /// `unclean` is true if requests were still waiting or connections
    /// were mid-request when shutdown began.
    fn pool_did_shutdown(&self, unclean: bool);
}

/// A connection pool for one origin.
///
/// The pool multiplexes requests over a capped set of HTTP/1.1
/// connections: an arriving request is executed on an idle connection
/// if one fits, queued while a new connection is dialed, or failed
/// when its deadline passes first. Dial failures are retried with
/// exponential backoff while demand remains. `Pool` is cheap to clone
/// and may be driven from any thread.
pub struct Pool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

/// A pool handle that does not keep the pool alive.
///
/// Transports hold one of these to report release and closure without
/// creating a reference cycle back to the pool that owns them.
pub struct WeakPool<F: ConnectionFactory> {
    shared: Weak<Shared<F>>,
}

struct Shared<F: ConnectionFactory> {
    origin: Origin,
    config: Config,
    factory: F,
    delegate: Arc<dyn PoolDelegate>,
    /// Guards the decision engine. Never held across callbacks, I/O
    /// or timer scheduling.
    state: Mutex<StateMachine<F::Request>>,
    /// Guards the timer maps, and nothing else. Never held while
    /// taking `state`; the fire path claims its entry here first,
    /// releases, then takes `state`.
    timers: Mutex<Timers>,
}

/// Dropping the sender wakes the scheduled task, which exits without
/// firing. A firing task removes its own entry first; whoever removes
/// an entry owns the fire.
type TimerHandle = oneshot::Sender<Infallible>;

struct Timers {
    request_timeouts: HashMap<RequestId, TimerHandle>,
    idle_timeouts: HashMap<ConnectionId, TimerHandle>,
    backoffs: HashMap<ConnectionId, TimerHandle>,
}

impl Timers {
    fn new() -> Self {
        Self {
            request_timeouts: HashMap::new(),
            idle_timeouts: HashMap::new(),
            backoffs: HashMap::new(),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    pub fn new(origin: Origin, config: Config, factory: F, delegate: Arc<dyn PoolDelegate>) -> Self {
        Self {
            shared: Arc::new(Shared {
                origin,
                factory,
                delegate,
                state: Mutex::new(StateMachine::new(config.max_concurrent_connections)),
                timers: Mutex::new(Timers::new()),
                config,
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    pub fn downgrade(&self) -> WeakPool<F> {
        WeakPool {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Schedule a request: execute it on an idle connection, or queue
    /// it and grow the pool if its demand is not yet covered.
    ///
    /// The request's `Arc` allocation is its identity; pass the same
    /// `Arc` to [`cancel_request`](Self::cancel_request).
    pub fn execute_request(&self, request: Arc<F::Request>) {
        let action = self.shared.state.lock().execute_request(request);
        self.run(action);
    }

    /// Withdraw a request that has not been handed to a connection
    /// yet. Requests already running are cancelled through their
    /// transport, not the pool.
    pub fn cancel_request(&self, request: &Arc<F::Request>) {
        let id = RequestId::new(request);
        let action = self.shared.state.lock().cancel_request(id);
        self.run(action);
    }

    /// Tear the pool down. Waiting requests fail with
    /// [`Error::Cancelled`]; running requests are cancelled through
    /// their transports. The delegate is notified once every
    /// connection is gone. Calling this twice is a programmer error.
    pub fn shutdown(&self) {
        debug!(origin = %self.shared.origin, "shutting down pool");
        let action = self.shared.state.lock().shutdown();
        self.run(action);
    }

    /// A transport finished its request and can take the next one.
    pub fn connection_released(&self, id: ConnectionId) {
        let action = self.shared.state.lock().http1_connection_released(id);
        self.run(action);
    }

    /// A transport's channel went away without the pool asking for it.
    /// No-op for closes the pool initiated itself.
    pub fn connection_closed(&self, id: ConnectionId) {
        let action = self.shared.state.lock().connection_closed(id);
        self.run(action);
    }

    // ===== factory and timer re-entry =====

    fn connection_established(&self, connection: Connection<F::Request>) {
        trace!(origin = %self.shared.origin, connection = %connection.id(), "connection established");
        let action = self
            .shared
            .state
            .lock()
            .new_http1_connection_established(connection);
        self.run(action);
    }

    fn connection_failed(&self, id: ConnectionId, error: BoxError) {
        debug!(origin = %self.shared.origin, connection = %id, %error, "connection attempt failed");
        let action = self
            .shared
            .state
            .lock()
            .failed_to_create_new_connection(Error::connect(error), id);
        self.run(action);
    }

    fn request_timed_out(&self, id: RequestId) {
        let action = self.shared.state.lock().timeout_request(id);
        self.run(action);
    }

    fn idle_timeout_fired(&self, id: ConnectionId) {
        let action = self.shared.state.lock().connection_idle_timeout(id);
        self.run(action);
    }

    fn backoff_done(&self, id: ConnectionId) {
        let action = self.shared.state.lock().connection_creation_backoff_done(id);
        self.run(action);
    }

    // ===== action translation, performed outside the state lock =====

    fn run(&self, action: Action<F::Request>) {
        self.run_connection_action(action.connection);
        self.run_request_action(action.request);
    }

    fn run_connection_action(&self, action: ConnectionAction<F::Request>) {
        match action {
            ConnectionAction::Create { id, event_loop } => self.create_connection(id, event_loop),
            ConnectionAction::ScheduleBackoffTimer {
                id,
                backoff,
                event_loop,
            } => self.schedule_backoff_timer(id, backoff, event_loop),
            ConnectionAction::ScheduleIdleTimeoutTimer { id, event_loop } => {
                self.schedule_idle_timeout_timer(id, event_loop)
            }
            ConnectionAction::CancelIdleTimeoutTimer { id } => {
                self.shared.timers.lock().idle_timeouts.remove(&id);
            }
            ConnectionAction::Close {
                connection,
                is_shutdown,
            } => {
                connection.close();
                if let IsShutdown::Yes { unclean } = is_shutdown {
                    self.notify_shutdown(unclean);
                }
            }
            ConnectionAction::Cleanup {
                context,
                is_shutdown,
            } => self.cleanup_connections(context, is_shutdown),
            ConnectionAction::None => {}
        }
    }

    fn run_request_action(&self, action: RequestAction<F::Request>) {
        match action {
            RequestAction::Execute {
                waiter,
                connection,
                cancel_timeout,
            } => {
                if cancel_timeout {
                    self.cancel_request_timeout(waiter.id());
                }
                connection.execute(waiter.into_request());
            }
            RequestAction::Fail {
                waiter,
                error,
                cancel_timeout,
            } => {
                if cancel_timeout {
                    self.cancel_request_timeout(waiter.id());
                }
                waiter.into_request().fail(error);
            }
            RequestAction::FailMany { waiters, error } => {
                {
                    let mut timers = self.shared.timers.lock();
                    for waiter in &waiters {
                        timers.request_timeouts.remove(&waiter.id());
                    }
                }
                for waiter in waiters {
                    waiter.into_request().fail(error.clone());
                }
            }
            RequestAction::ScheduleTimeout {
                id,
                request,
                event_loop,
            } => self.schedule_request_timeout(id, request, event_loop),
            RequestAction::CancelTimeout { id } => self.cancel_request_timeout(id),
            RequestAction::None => {}
        }
    }

    fn create_connection(&self, id: ConnectionId, event_loop: EventLoop) {
        trace!(origin = %self.shared.origin, connection = %id, "dialing new connection");
        let deadline = Instant::now() + self.shared.config.connect_timeout;
        let target = ConnectTarget::new(
            self.shared.origin.clone(),
            id,
            event_loop.clone(),
            deadline,
        );
        let dial = self.shared.factory.make_connection(target);
        let pool = self.downgrade();
        event_loop.execute(async move {
            let result = dial.await;
            let Some(pool) = pool.upgrade() else {
                // the pool is gone; don't leak an established transport
                if let Ok(connection) = result {
                    connection.close();
                }
                return;
            };
            match result {
                Ok(connection) => {
                    debug_assert_eq!(connection.id(), id, "factory returned a foreign id");
                    pool.connection_established(connection);
                }
                Err(error) => pool.connection_failed(id, error),
            }
        });
    }

    fn cleanup_connections(&self, context: CleanupContext<F::Request>, is_shutdown: IsShutdown) {
        let CleanupContext {
            close,
            cancel,
            connect_backoff,
        } = context;
        for connection in close {
            connection.close();
        }
        for connection in cancel {
            connection.shutdown();
        }
        if !connect_backoff.is_empty() {
            // remove and cancel under one critical section, so a timer
            // firing right now cannot find its entry anymore
            let mut timers = self.shared.timers.lock();
            for id in connect_backoff {
                timers.backoffs.remove(&id);
            }
        }
        if let IsShutdown::Yes { unclean } = is_shutdown {
            self.notify_shutdown(unclean);
        }
    }

    fn notify_shutdown(&self, unclean: bool) {
        debug!(origin = %self.shared.origin, unclean, "pool did shut down");
        self.shared.delegate.pool_did_shutdown(unclean);
    }

    fn schedule_request_timeout(&self, id: RequestId, request: Arc<F::Request>, event_loop: EventLoop) {
        let deadline = request.connection_deadline();
        let (handle, cancelled) = oneshot::channel();
        self.shared
            .timers
            .lock()
            .request_timeouts
            .insert(id, handle);

        let sleep = event_loop.sleep_until(deadline);
        let pool = self.downgrade();
        event_loop.execute(async move {
            if let Either::Left(..) = future::select(cancelled, sleep).await {
                return;
            }
            let Some(pool) = pool.upgrade() else { return };
            if pool.shared.timers.lock().request_timeouts.remove(&id).is_none() {
                // a cancellation claimed the entry first
                return;
            }
            pool.request_timed_out(id);
        });

        request.request_was_queued();
    }

    fn cancel_request_timeout(&self, id: RequestId) {
        self.shared.timers.lock().request_timeouts.remove(&id);
    }

    fn schedule_idle_timeout_timer(&self, id: ConnectionId, event_loop: EventLoop) {
        trace!(connection = %id, "parking idle connection");
        let (handle, cancelled) = oneshot::channel();
        self.shared.timers.lock().idle_timeouts.insert(id, handle);

        let sleep = event_loop.sleep(self.shared.config.idle_timeout);
        let pool = self.downgrade();
        event_loop.execute(async move {
            if let Either::Left(..) = future::select(cancelled, sleep).await {
                return;
            }
            let Some(pool) = pool.upgrade() else { return };
            if pool.shared.timers.lock().idle_timeouts.remove(&id).is_none() {
                return;
            }
            pool.idle_timeout_fired(id);
        });
    }

    fn schedule_backoff_timer(&self, id: ConnectionId, backoff: Duration, event_loop: EventLoop) {
        trace!(connection = %id, ?backoff, "backing off next connection attempt");
        let (handle, cancelled) = oneshot::channel();
        self.shared.timers.lock().backoffs.insert(id, handle);

        let sleep = event_loop.sleep(backoff);
        let pool = self.downgrade();
        event_loop.execute(async move {
            if let Either::Left(..) = future::select(cancelled, sleep).await {
                return;
            }
            let Some(pool) = pool.upgrade() else { return };
            if pool.shared.timers.lock().backoffs.remove(&id).is_none() {
                return;
            }
            pool.backoff_done(id);
        });
    }
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: ConnectionFactory> WeakPool<F> {
    pub fn upgrade(&self) -> Option<Pool<F>> {
        self.shared.upgrade().map(|shared| Pool { shared })
    }
}

impl<F: ConnectionFactory> Clone for WeakPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::oneshot;

    use super::{Pool, PoolDelegate};
    use crate::{
        config::Config,
        connect::{ConnectTarget, Connecting, ConnectionFactory},
        connection::{Connection, ConnectionId, mock::MockTransport},
        error::{BoxError, Error},
        event_loop::EventLoop,
        origin::Origin,
        request::mock::MockRequest,
        rt::{TokioExecutor, TokioTimer},
        sync::Mutex,
    };

    fn origin() -> Origin {
        Origin::new(http::uri::Scheme::HTTP, "example.com".parse().unwrap())
    }

    fn event_loop() -> EventLoop {
        EventLoop::new(TokioExecutor::new(), TokioTimer::new())
    }

    fn pool_with(
        config: Config,
    ) -> (Pool<MockFactory>, MockFactory, Arc<MockDelegate>, EventLoop) {
        let event_loop = event_loop();
        let factory = MockFactory::default();
        let delegate = Arc::new(MockDelegate::default());
        let pool = Pool::new(origin(), config, factory.clone(), delegate.clone());
        (pool, factory, delegate, event_loop)
    }

    fn request(event_loop: &EventLoop, timeout: Duration) -> Arc<MockRequest> {
        MockRequest::new(event_loop.clone(), None, timeout)
    }

    /// Let the spawned dial and timer tasks make progress without
    /// advancing the paused clock.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[derive(Default)]
    struct MockDelegate {
        notifications: Mutex<Vec<bool>>,
    }

    impl MockDelegate {
        fn notifications(&self) -> Vec<bool> {
            self.notifications.lock().clone()
        }
    }

    impl PoolDelegate for MockDelegate {
        fn pool_did_shutdown(&self, unclean: bool) {
            self.notifications.lock().push(unclean);
        }
    }

    /// One dial the factory has been asked for, completed by the test.
    struct Dial {
        id: ConnectionId,
        event_loop: EventLoop,
        tx: oneshot::Sender<Result<Connection<MockRequest>, BoxError>>,
    }

    impl Dial {
        fn succeed(self) -> MockTransport<MockRequest> {
            let transport = MockTransport::new(self.event_loop.clone());
            let connection = Connection::mock(self.id, transport.clone());
            assert!(self.tx.send(Ok(connection)).is_ok());
            transport
        }

        fn fail(self, message: &str) {
            assert!(self.tx.send(Err(message.into())).is_ok());
        }
    }

    #[derive(Clone, Default)]
    struct MockFactory {
        dials: Arc<Mutex<Vec<Dial>>>,
    }

    impl MockFactory {
        fn take_dial(&self) -> Dial {
            let mut dials = self.dials.lock();
            assert!(!dials.is_empty(), "no dial pending");
            dials.remove(0)
        }

        fn pending_dials(&self) -> usize {
            self.dials.lock().len()
        }
    }

    impl ConnectionFactory for MockFactory {
        type Request = MockRequest;

        fn make_connection(&self, target: ConnectTarget) -> Connecting<MockRequest> {
            let (tx, rx) = oneshot::channel();
            self.dials.lock().push(Dial {
                id: target.id(),
                event_loop: target.event_loop().clone(),
                tx,
            });
            Box::pin(async move { rx.await.expect("dial abandoned by the test") })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_queued_request_when_dial_completes() {
        let (pool, factory, _delegate, event_loop) = pool_with(Config::default());

        let request = request(&event_loop, Duration::from_secs(10));
        pool.execute_request(request.clone());
        settle().await;

        assert!(request.was_queued());
        let transport = factory.take_dial().succeed();
        settle().await;

        assert_eq!(transport.executed().len(), 1);
        assert!(Arc::ptr_eq(&transport.executed()[0], &request));
        assert!(request.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_surfaces_last_dial_failure() {
        let (pool, factory, _delegate, event_loop) = pool_with(Config::default());

        let request = request(&event_loop, Duration::from_millis(500));
        pool.execute_request(request.clone());
        settle().await;

        factory.take_dial().fail("connection refused");
        settle().await;
        // the failure stays on record; nothing surfaces yet
        assert!(request.failure().is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        match request.failure() {
            Some(Error::Connect(error)) => assert_eq!(error.to_string(), "connection refused"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_redials_while_demand_remains() {
        let (pool, factory, _delegate, event_loop) = pool_with(Config::default());

        let request = request(&event_loop, Duration::from_secs(30));
        pool.execute_request(request.clone());
        settle().await;

        factory.take_dial().fail("connection refused");
        settle().await;
        assert_eq!(factory.pending_dials(), 0);

        // first backoff is ~100ms; the retry dial appears after it
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(factory.pending_dials(), 1);

        let transport = factory.take_dial().succeed();
        settle().await;
        assert_eq!(transport.executed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hands_connection_to_next_waiter_on_release() {
        let config = Config {
            max_concurrent_connections: 1,
            ..Config::default()
        };
        let (pool, factory, _delegate, event_loop) = pool_with(config);

        let first = request(&event_loop, Duration::from_secs(30));
        let second = request(&event_loop, Duration::from_secs(30));

        pool.execute_request(first.clone());
        settle().await;
        let dial = factory.take_dial();
        let id = dial.id;
        let transport = dial.succeed();
        settle().await;
        assert_eq!(transport.executed().len(), 1);

        // the cap is reached; the second request waits without dialing
        pool.execute_request(second.clone());
        settle().await;
        assert!(second.was_queued());
        assert_eq!(factory.pending_dials(), 0);

        pool.connection_released(id);
        settle().await;
        assert_eq!(transport.executed().len(), 2);
        assert!(Arc::ptr_eq(&transport.executed()[1], &second));
    }

    #[tokio::test(start_paused = true)]
    async fn closes_idle_connection_after_timeout() {
        let (pool, factory, _delegate, event_loop) = pool_with(Config::default());

        let request = request(&event_loop, Duration::from_secs(10));
        pool.execute_request(request.clone());
        settle().await;
        let dial = factory.take_dial();
        let id = dial.id;
        let transport = dial.succeed();
        settle().await;

        pool.connection_released(id);
        settle().await;
        assert_eq!(transport.close_calls(), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(transport.shutdown_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_leaves_no_timer_behind() {
        let (pool, factory, _delegate, event_loop) = pool_with(Config::default());

        let request = request(&event_loop, Duration::from_millis(500));
        pool.execute_request(request.clone());
        settle().await;

        pool.cancel_request(&request);
        settle().await;

        // past the deadline: the cancelled timer must not fire
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(request.failure().is_none());

        // the dial that was already in flight parks unused
        let transport = factory.take_dial().succeed();
        settle().await;
        assert!(transport.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_waiters_and_running_requests() {
        let config = Config {
            max_concurrent_connections: 1,
            ..Config::default()
        };
        let (pool, factory, delegate, event_loop) = pool_with(config);

        let running = request(&event_loop, Duration::from_secs(30));
        let waiting = request(&event_loop, Duration::from_secs(30));

        pool.execute_request(running.clone());
        settle().await;
        let dial = factory.take_dial();
        let id = dial.id;
        let transport = dial.succeed();
        settle().await;
        pool.execute_request(waiting.clone());
        settle().await;

        pool.shutdown();
        settle().await;

        assert_eq!(waiting.failure(), Some(Error::Cancelled));
        assert!(running.failure().is_none());
        assert_eq!(transport.shutdown_calls(), 1);
        // the delegate waits for the last connection to report closed
        assert!(delegate.notifications().is_empty());

        pool.connection_closed(id);
        settle().await;
        assert_eq!(delegate.notifications(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_of_an_empty_pool_is_clean_and_immediate() {
        let (pool, _factory, delegate, event_loop) = pool_with(Config::default());

        pool.shutdown();
        assert_eq!(delegate.notifications(), vec![false]);

        // late requests fail without touching the factory
        let late = request(&event_loop, Duration::from_secs(30));
        pool.execute_request(late.clone());
        assert_eq!(late.failure(), Some(Error::AlreadyShutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_timer_fire_after_shutdown_is_a_no_op() {
        let (pool, factory, delegate, event_loop) = pool_with(Config::default());

        let request = request(&event_loop, Duration::from_secs(30));
        pool.execute_request(request.clone());
        settle().await;
        factory.take_dial().fail("connection refused");
        settle().await;

        pool.shutdown();
        settle().await;
        // waiter cancelled, backoff timer torn down, shutdown complete
        assert_eq!(request.failure(), Some(Error::Cancelled));
        assert_eq!(delegate.notifications(), vec![true]);

        // past the backoff deadline: no retry dial appears
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(factory.pending_dials(), 0);
    }
}
