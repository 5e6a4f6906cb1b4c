use std::mem;

use tracing::trace;

use crate::{
    connection::{Connection, ConnectionId, IdGenerator},
    event_loop::{EventLoop, EventLoopId},
};

/// Why a connection exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ConnectionUse {
    /// Counted against the pool cap; may serve any request compatible
    /// with its loop.
    GeneralPurpose,
    /// Created for a request with a required event loop; not counted
    /// against the cap and closed as soon as no bound requests remain.
    EventLoopBound,
}

enum EntryState<R> {
    /// Dial in flight.
    Starting,
    /// Dial failed; waiting for the backoff timer.
    BackingOff,
    /// Established, no active request. The executor arms the idle
    /// timer when the entry is parked.
    Idle { connection: Connection<R> },
    /// Executing a request. The connection handle has been handed out;
    /// only the id stays behind.
    Leased { connection: Connection<R> },
    /// Terminal. Entries only pass through this state within a single
    /// event; they are replaced or removed before it returns.
    Closed,
}

struct Entry<R> {
    id: ConnectionId,
    event_loop: EventLoop,
    use_case: ConnectionUse,
    state: EntryState<R>,
}

impl<R> Entry<R> {
    fn starting(id: ConnectionId, event_loop: EventLoop, use_case: ConnectionUse) -> Self {
        Self {
            id,
            event_loop,
            use_case,
            state: EntryState::Starting,
        }
    }

    /// A dial is pending for this entry, either on the wire or behind
    /// a backoff timer.
    fn is_connecting(&self) -> bool {
        matches!(self.state, EntryState::Starting | EntryState::BackingOff)
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, EntryState::Idle { .. })
    }
}

/// Running totals over the entry states, kept in sync on every
/// transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct Stats {
    pub(super) starting: usize,
    pub(super) backing_off: usize,
    pub(super) idle: usize,
    pub(super) leased: usize,
}

/// Context the state machine dispatches on after a connection became
/// idle (established or released).
pub(super) struct IdleConnectionContext {
    pub(super) use_case: ConnectionUse,
    pub(super) event_loop: EventLoop,
}

/// Context the state machine dispatches on after a connection failed
/// or closed.
pub(super) struct FailedConnectionContext {
    pub(super) use_case: ConnectionUse,
    pub(super) event_loop: EventLoop,
    /// Dials still pending in the same use-case bucket, measured after
    /// the failed entry left it.
    pub(super) connections_starting_for_use_case: usize,
}

/// What shutdown found: handles safe to close, handles with requests
/// to cancel, and backoff timers to tear down.
pub(super) struct CleanupContext<R> {
    pub(super) close: Vec<Connection<R>>,
    pub(super) cancel: Vec<Connection<R>>,
    pub(super) connect_backoff: Vec<ConnectionId>,
}

impl<R> CleanupContext<R> {
    pub(super) fn new() -> Self {
        Self {
            close: Vec::new(),
            cancel: Vec::new(),
            connect_backoff: Vec::new(),
        }
    }
}

/// The set of connections one pool knows about.
///
/// General-purpose entries occupy `entries[..overflow_index]`,
/// event-loop-bound entries the tail; `can_grow` is therefore an index
/// comparison and never sees overflow connections.
pub(super) struct Connections<R> {
    max_concurrent: usize,
    generator: IdGenerator,
    entries: Vec<Entry<R>>,
    overflow_index: usize,
    stats: Stats,
}

impl<R: 'static> Connections<R> {
    pub(super) fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            generator: IdGenerator::new(),
            entries: Vec::new(),
            overflow_index: 0,
            stats: Stats::default(),
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn can_grow(&self) -> bool {
        self.overflow_index < self.max_concurrent
    }

    /// At least one established connection exists (idle or leased).
    pub(super) fn has_active_connections(&self) -> bool {
        self.stats.idle + self.stats.leased > 0
    }

    #[cfg(test)]
    pub(super) fn stats(&self) -> Stats {
        self.stats
    }

    /// General-purpose dials in flight, backoffs included.
    pub(super) fn starting_general_purpose_connections(&self) -> usize {
        self.entries[..self.overflow_index]
            .iter()
            .filter(|entry| entry.is_connecting())
            .count()
    }

    /// Event-loop-bound dials in flight for one loop, backoffs
    /// included.
    pub(super) fn starting_event_loop_connections(&self, event_loop: EventLoopId) -> usize {
        self.entries[self.overflow_index..]
            .iter()
            .filter(|entry| entry.is_connecting() && entry.event_loop.id() == event_loop)
            .count()
    }

    fn index_of(&self, id: ConnectionId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Insert a fresh general-purpose entry in `starting` on
    /// `event_loop`.
    pub(super) fn create_new_connection(&mut self, event_loop: &EventLoop) -> ConnectionId {
        assert!(self.can_grow(), "pool tried to grow past its cap");
        let id = self.generator.next_id();
        self.entries.insert(
            self.overflow_index,
            Entry::starting(id, event_loop.clone(), ConnectionUse::GeneralPurpose),
        );
        self.overflow_index += 1;
        self.stats.starting += 1;
        self.assert_invariants();
        id
    }

    /// Insert a fresh event-loop-bound entry. These never count
    /// against the general cap.
    pub(super) fn create_new_overflow_connection(&mut self, event_loop: &EventLoop) -> ConnectionId {
        let id = self.generator.next_id();
        self.entries.push(Entry::starting(
            id,
            event_loop.clone(),
            ConnectionUse::EventLoopBound,
        ));
        self.stats.starting += 1;
        self.assert_invariants();
        id
    }

    /// Lease an idle connection on the preferred loop, or failing
    /// that, any idle general-purpose connection.
    pub(super) fn lease_connection_on_preferred(
        &mut self,
        event_loop: EventLoopId,
    ) -> Option<Connection<R>> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.is_idle() && entry.event_loop.id() == event_loop)
            .or_else(|| {
                self.entries[..self.overflow_index]
                    .iter()
                    .position(Entry::is_idle)
            })?;
        Some(self.lease_connection_at(index))
    }

    /// Lease an idle connection bound to exactly this loop.
    pub(super) fn lease_connection_on_required(
        &mut self,
        event_loop: EventLoopId,
    ) -> Option<Connection<R>> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.is_idle() && entry.event_loop.id() == event_loop)?;
        Some(self.lease_connection_at(index))
    }

    pub(super) fn lease_connection_at(&mut self, index: usize) -> Connection<R> {
        let entry = &mut self.entries[index];
        match mem::replace(&mut entry.state, EntryState::Closed) {
            EntryState::Idle { connection, .. } => {
                trace!(connection = %entry.id, "leasing connection");
                entry.state = EntryState::Leased {
                    connection: connection.clone(),
                };
                self.stats.idle -= 1;
                self.stats.leased += 1;
                connection
            }
            _ => panic!("connection must be idle to be leased"),
        }
    }

    /// Leave an idle entry in the set; the caller arms its idle timer.
    pub(super) fn park_connection_at(&mut self, index: usize) -> (ConnectionId, EventLoop) {
        let entry = &self.entries[index];
        debug_assert!(entry.is_idle(), "only idle connections can be parked");
        (entry.id, entry.event_loop.clone())
    }

    /// A pending dial succeeded.
    pub(super) fn new_http1_connection_established(
        &mut self,
        connection: Connection<R>,
    ) -> (usize, IdleConnectionContext) {
        let index = self
            .index_of(connection.id())
            .expect("established connection is not tracked by this pool");
        let entry = &mut self.entries[index];
        match entry.state {
            EntryState::Starting => {
                entry.state = EntryState::Idle { connection };
                self.stats.starting -= 1;
                self.stats.idle += 1;
            }
            _ => panic!("connection established twice"),
        }
        let context = IdleConnectionContext {
            use_case: entry.use_case,
            event_loop: entry.event_loop.clone(),
        };
        (index, context)
    }

    /// A request finished on a leased connection.
    pub(super) fn release_connection(&mut self, id: ConnectionId) -> (usize, IdleConnectionContext) {
        let index = self
            .index_of(id)
            .expect("released connection is not tracked by this pool");
        let entry = &mut self.entries[index];
        match mem::replace(&mut entry.state, EntryState::Closed) {
            EntryState::Leased { connection } => {
                entry.state = EntryState::Idle { connection };
                self.stats.leased -= 1;
                self.stats.idle += 1;
            }
            _ => panic!("released connection was not leased"),
        }
        let context = IdleConnectionContext {
            use_case: entry.use_case,
            event_loop: entry.event_loop.clone(),
        };
        (index, context)
    }

    /// Close an idle entry by id. Returns nothing if the entry is gone
    /// or no longer idle, meaning the timer lost its race to a lease.
    pub(super) fn close_connection_if_idle(&mut self, id: ConnectionId) -> Option<Connection<R>> {
        let index = self.index_of(id)?;
        if !self.entries[index].is_idle() {
            return None;
        }
        Some(self.close_connection_at(index))
    }

    /// Close an entry assumed to be idle, removing it from the set.
    /// A later unsolicited closed event for the same id finds nothing
    /// and no-ops.
    pub(super) fn close_connection_at(&mut self, index: usize) -> Connection<R> {
        let entry = self.remove_entry(index);
        match entry.state {
            EntryState::Idle { connection } => {
                self.stats.idle -= 1;
                self.assert_invariants();
                connection
            }
            _ => panic!("connection must be idle to be closed"),
        }
    }

    /// Mark an entry closed from whatever non-terminal state it is in.
    /// Returns nothing for untracked ids (pool-initiated closes).
    pub(super) fn fail_connection(
        &mut self,
        id: ConnectionId,
    ) -> Option<(usize, FailedConnectionContext)> {
        let index = self.index_of(id)?;
        let entry = &mut self.entries[index];
        match mem::replace(&mut entry.state, EntryState::Closed) {
            EntryState::Starting => self.stats.starting -= 1,
            EntryState::BackingOff => self.stats.backing_off -= 1,
            EntryState::Idle { .. } => self.stats.idle -= 1,
            EntryState::Leased { .. } => self.stats.leased -= 1,
            EntryState::Closed => panic!("connection failed twice"),
        }
        let use_case = self.entries[index].use_case;
        let event_loop = self.entries[index].event_loop.clone();
        let connections_starting_for_use_case = match use_case {
            ConnectionUse::GeneralPurpose => self.starting_general_purpose_connections(),
            ConnectionUse::EventLoopBound => self.starting_event_loop_connections(event_loop.id()),
        };
        let context = FailedConnectionContext {
            use_case,
            event_loop,
            connections_starting_for_use_case,
        };
        self.assert_invariants();
        Some((index, context))
    }

    /// Replace a closed entry in place with a fresh `starting` entry
    /// on the same loop, for the same use.
    pub(super) fn replace_connection_at(&mut self, index: usize) -> (ConnectionId, EventLoop) {
        let entry = &mut self.entries[index];
        assert!(
            matches!(entry.state, EntryState::Closed),
            "only closed entries are replaced"
        );
        let id = self.generator.next_id();
        trace!(old = %entry.id, new = %id, "replacing failed connection");
        *entry = Entry::starting(id, entry.event_loop.clone(), entry.use_case);
        self.stats.starting += 1;
        let event_loop = self.entries[index].event_loop.clone();
        (id, event_loop)
    }

    /// Erase a closed entry.
    pub(super) fn remove_connection_at(&mut self, index: usize) {
        let entry = self.remove_entry(index);
        assert!(
            matches!(entry.state, EntryState::Closed),
            "only closed entries are removed"
        );
    }

    /// A dial failed while the pool is running; hold the slot until
    /// the backoff timer fires.
    pub(super) fn backoff_next_connection_attempt(&mut self, id: ConnectionId) -> EventLoop {
        let index = self
            .index_of(id)
            .expect("dial failure for a connection this pool is not starting");
        let entry = &mut self.entries[index];
        match entry.state {
            EntryState::Starting => {
                entry.state = EntryState::BackingOff;
                self.stats.starting -= 1;
                self.stats.backing_off += 1;
            }
            _ => panic!("only starting connections can back off"),
        }
        entry.event_loop.clone()
    }

    /// Sweep the set for shutdown. Idle and backing-off entries leave
    /// immediately; starting and leased entries stay until their
    /// terminal event arrives.
    pub(super) fn shutdown(&mut self) -> CleanupContext<R> {
        let mut context = CleanupContext::new();
        let mut index = 0;
        while index < self.entries.len() {
            match &self.entries[index].state {
                EntryState::Starting => index += 1,
                EntryState::Leased { connection } => {
                    context.cancel.push(connection.clone());
                    index += 1;
                }
                EntryState::BackingOff => {
                    let entry = self.remove_entry(index);
                    self.stats.backing_off -= 1;
                    context.connect_backoff.push(entry.id);
                }
                EntryState::Idle { .. } => {
                    let entry = self.remove_entry(index);
                    self.stats.idle -= 1;
                    match entry.state {
                        EntryState::Idle { connection, .. } => context.close.push(connection),
                        _ => unreachable!(),
                    }
                }
                EntryState::Closed => panic!("closed entries are removed within their event"),
            }
        }
        self.assert_invariants();
        context
    }

    fn remove_entry(&mut self, index: usize) -> Entry<R> {
        if index < self.overflow_index {
            self.overflow_index -= 1;
        }
        self.entries.remove(index)
    }

    fn assert_invariants(&self) {
        debug_assert!(self.overflow_index <= self.entries.len());
        debug_assert_eq!(
            self.stats.starting + self.stats.backing_off + self.stats.idle + self.stats.leased,
            self.entries
                .iter()
                .filter(|entry| !matches!(entry.state, EntryState::Closed))
                .count(),
        );
    }
}
