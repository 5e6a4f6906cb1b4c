use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{
    event_loop::EventLoopId,
    request::{PoolableRequest, RequestId},
};

/// One queued request.
///
/// The state machine routes waiters by id, loop and deadline alone;
/// the request itself stays opaque until the executor hands it to a
/// connection or fails it.
pub(super) struct Waiter<R> {
    request: Arc<R>,
    id: RequestId,
}

impl<R: PoolableRequest> Waiter<R> {
    pub(super) fn new(request: Arc<R>) -> Self {
        let id = RequestId::new(&request);
        Self { request, id }
    }

    pub(super) fn id(&self) -> RequestId {
        self.id
    }

    pub(super) fn into_request(self) -> Arc<R> {
        self.request
    }

    fn required_event_loop(&self) -> Option<EventLoopId> {
        self.id.required_event_loop()
    }
}

impl<R> fmt::Debug for Waiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Waiter").field(&self.id).finish()
    }
}

/// Waiting requests, partitioned by event-loop affinity.
///
/// FIFO order is kept within each sub-queue. No order is promised
/// across sub-queues; the dispatch rules in the state machine decide
/// which sub-queue a freed connection serves first.
pub(super) struct RequestQueue<R> {
    general_purpose: VecDeque<Waiter<R>>,
    event_loop_bound: HashMap<EventLoopId, VecDeque<Waiter<R>>>,
}

impl<R: PoolableRequest> RequestQueue<R> {
    pub(super) fn new() -> Self {
        Self {
            general_purpose: VecDeque::new(),
            event_loop_bound: HashMap::new(),
        }
    }

    /// Enqueue at the tail of the sub-queue selected by the waiter's
    /// required event loop.
    pub(super) fn push(&mut self, waiter: Waiter<R>) {
        match waiter.required_event_loop() {
            Some(event_loop) => self
                .event_loop_bound
                .entry(event_loop)
                .or_default()
                .push_back(waiter),
            None => self.general_purpose.push_back(waiter),
        }
    }

    /// Dequeue the head of the general queue, or of the bound queue
    /// for `event_loop` if one is given.
    pub(super) fn pop_first(&mut self, event_loop: Option<EventLoopId>) -> Option<Waiter<R>> {
        match event_loop {
            None => self.general_purpose.pop_front(),
            Some(event_loop) => {
                let queue = self.event_loop_bound.get_mut(&event_loop)?;
                let waiter = queue.pop_front();
                if queue.is_empty() {
                    self.event_loop_bound.remove(&event_loop);
                }
                waiter
            }
        }
    }

    /// Remove a waiter by id, wherever it sits in its sub-queue. Used
    /// for cancellation and timeout; returns nothing if the waiter was
    /// already dispatched.
    pub(super) fn remove(&mut self, id: RequestId) -> Option<Waiter<R>> {
        match id.required_event_loop() {
            None => Self::remove_from(&mut self.general_purpose, id),
            Some(event_loop) => {
                let queue = self.event_loop_bound.get_mut(&event_loop)?;
                let waiter = Self::remove_from(queue, id);
                if queue.is_empty() {
                    self.event_loop_bound.remove(&event_loop);
                }
                waiter
            }
        }
    }

    fn remove_from(queue: &mut VecDeque<Waiter<R>>, id: RequestId) -> Option<Waiter<R>> {
        let index = queue.iter().position(|waiter| waiter.id() == id)?;
        queue.remove(index)
    }

    /// Drain everything. Per-queue FIFO order is preserved; the order
    /// across sub-queues is unspecified.
    pub(super) fn remove_all(&mut self) -> Vec<Waiter<R>> {
        let mut drained: Vec<_> = self.general_purpose.drain(..).collect();
        for (_, mut queue) in self.event_loop_bound.drain() {
            drained.extend(queue.drain(..));
        }
        drained
    }

    /// Waiters a connection on `event_loop` could serve: the general
    /// queue plus the queue bound to that loop.
    pub(super) fn count(&self, event_loop: EventLoopId) -> usize {
        self.general_purpose.len()
            + self
                .event_loop_bound
                .get(&event_loop)
                .map_or(0, VecDeque::len)
    }

    pub(super) fn general_purpose_count(&self) -> usize {
        self.general_purpose.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.general_purpose.is_empty() && self.event_loop_bound.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RequestQueue, Waiter};
    use crate::{
        event_loop::EventLoop,
        request::{RequestId, mock::MockRequest},
        rt::{TokioExecutor, TokioTimer},
    };

    fn event_loop() -> EventLoop {
        EventLoop::new(TokioExecutor::new(), TokioTimer::new())
    }

    fn waiter(preferred: &EventLoop, required: Option<&EventLoop>) -> Waiter<MockRequest> {
        Waiter::new(MockRequest::new(
            preferred.clone(),
            required.cloned(),
            Duration::from_secs(30),
        ))
    }

    #[test]
    fn general_purpose_queue_is_fifo() {
        let event_loop = event_loop();
        let mut queue = RequestQueue::new();

        let first = waiter(&event_loop, None);
        let second = waiter(&event_loop, None);
        let (first_id, second_id) = (first.id(), second.id());
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.general_purpose_count(), 2);
        assert_eq!(queue.pop_first(None).unwrap().id(), first_id);
        assert_eq!(queue.pop_first(None).unwrap().id(), second_id);
        assert!(queue.pop_first(None).is_none());
    }

    #[test]
    fn bound_waiters_do_not_mix_with_general_purpose() {
        let loop_a = event_loop();
        let loop_b = event_loop();
        let mut queue = RequestQueue::new();

        let general = waiter(&loop_a, None);
        let bound = waiter(&loop_a, Some(&loop_b));
        let (general_id, bound_id) = (general.id(), bound.id());
        queue.push(general);
        queue.push(bound);

        assert_eq!(queue.general_purpose_count(), 1);
        assert_eq!(queue.count(loop_a.id()), 1);
        assert_eq!(queue.count(loop_b.id()), 2);

        assert!(queue.pop_first(Some(loop_a.id())).is_none());
        assert_eq!(queue.pop_first(Some(loop_b.id())).unwrap().id(), bound_id);
        assert_eq!(queue.pop_first(None).unwrap().id(), general_id);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_targets_the_right_sub_queue() {
        let loop_a = event_loop();
        let loop_b = event_loop();
        let mut queue = RequestQueue::new();

        let general = waiter(&loop_a, None);
        let bound = waiter(&loop_a, Some(&loop_b));
        let bound_id = bound.id();
        queue.push(general);
        queue.push(bound);

        assert_eq!(queue.remove(bound_id).unwrap().id(), bound_id);
        assert!(queue.remove(bound_id).is_none());
        assert_eq!(queue.count(loop_b.id()), 1);
        assert_eq!(queue.general_purpose_count(), 1);
    }

    #[test]
    fn remove_of_unknown_id_is_none() {
        let event_loop = event_loop();
        let mut queue = RequestQueue::<MockRequest>::new();
        queue.push(waiter(&event_loop, None));

        let other = MockRequest::new(event_loop.clone(), None, Duration::from_secs(30));
        assert!(queue.remove(RequestId::new(&other)).is_none());
        assert_eq!(queue.general_purpose_count(), 1);
    }

    #[test]
    fn remove_all_drains_both_partitions() {
        let loop_a = event_loop();
        let loop_b = event_loop();
        let mut queue = RequestQueue::new();

        queue.push(waiter(&loop_a, None));
        queue.push(waiter(&loop_a, Some(&loop_b)));
        queue.push(waiter(&loop_b, Some(&loop_b)));

        let drained = queue.remove_all();
        assert_eq!(drained.len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.count(loop_b.id()), 0);
    }
}
