//! Request correlation
//!
//! Owns the bounded outbound queue and the table of in-flight requests. The
//! dispatcher never runs continuations itself: every operation that finishes a
//! request hands the continuation back to the caller together with its
//! [`Reply`], so completion code is free to enqueue more work.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Command, Reply, Request, RequestError, RequestId, REQUEST_ID_MODULUS};
use crate::scheduler::{Scheduler, TimerEvent, TimerHandle};

/// A request waiting in the outbound queue
#[derive(Debug)]
pub struct Outbound<H> {
    /// Envelope to write
    pub request: Request,
    /// Continuation for the reply
    pub handler: H,
    timeout: TimerHandle,
}

impl<H> Outbound<H> {
    /// Request id
    pub fn id(&self) -> RequestId {
        self.request.id
    }
}

#[derive(Debug)]
struct Pending<H> {
    handler: H,
    timeout: TimerHandle,
}

/// Outbound queue plus correlation table
#[derive(Debug)]
pub struct Dispatcher<H> {
    queue: VecDeque<Outbound<H>>,
    in_flight: HashMap<RequestId, Pending<H>>,
    next_id: RequestId,
    capacity: usize,
    request_timeout: Duration,
}

impl<H> Dispatcher<H> {
    /// Queue holding at most `capacity` unsent requests
    pub fn new(capacity: usize, request_timeout: Duration) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            in_flight: HashMap::new(),
            next_id: 0,
            capacity: capacity.max(1),
            request_timeout,
        }
    }

    /// Hand out the next request id, wrapping at [`REQUEST_ID_MODULUS`]
    pub fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id = (self.next_id + 1) % REQUEST_ID_MODULUS;
        id
    }

    /// Queue a command and arm its response timeout
    ///
    /// When the queue is full every queued (unsent) entry is failed with
    /// [`RequestError::QueueOverflow`] first; those continuations are returned.
    pub fn enqueue(
        &mut self,
        scheduler: &mut dyn Scheduler,
        command: Command,
        handler: H,
    ) -> (RequestId, Vec<(H, Reply)>) {
        let mut overflowed = Vec::new();
        if self.queue.len() >= self.capacity {
            warn!(dropped = self.queue.len(), "request queue overflow, clearing");
            for entry in self.queue.drain(..) {
                scheduler.cancel(entry.timeout);
                overflowed.push((entry.handler, Err(RequestError::QueueOverflow)));
            }
        }

        let id = self.next_request_id();
        let request = command.into_request(id);
        let timeout = scheduler.schedule_in(self.request_timeout, TimerEvent::RequestTimeout(id));
        debug!(id, method = %request.method, "request queued");
        self.queue.push_back(Outbound {
            request,
            handler,
            timeout,
        });
        (id, overflowed)
    }

    /// Take the head of the queue for transmission
    pub fn next_outbound(&mut self) -> Option<Outbound<H>> {
        self.queue.pop_front()
    }

    /// Record a transmitted request as awaiting its response
    pub fn mark_sent(&mut self, outbound: Outbound<H>) {
        let id = outbound.request.id;
        if self.in_flight.contains_key(&id) {
            warn!(id, "request id reused while a response is outstanding");
        }
        self.in_flight.insert(
            id,
            Pending {
                handler: outbound.handler,
                timeout: outbound.timeout,
            },
        );
    }

    /// Put a request that failed to transmit back at the front of the queue
    pub fn requeue_front(&mut self, outbound: Outbound<H>) {
        self.queue.push_front(outbound);
    }

    /// Fail a request that never reached the wire
    pub fn fail_unsent(
        &mut self,
        scheduler: &mut dyn Scheduler,
        outbound: Outbound<H>,
        error: RequestError,
    ) -> (H, Reply) {
        scheduler.cancel(outbound.timeout);
        (outbound.handler, Err(error))
    }

    /// Match a response id to its in-flight request
    pub fn resolve(&mut self, scheduler: &mut dyn Scheduler, id: RequestId) -> Option<H> {
        let pending = self.in_flight.remove(&id)?;
        scheduler.cancel(pending.timeout);
        Some(pending.handler)
    }

    /// Response deadline passed; no-op when the request already completed
    pub fn on_timeout(&mut self, id: RequestId) -> Option<(H, Reply)> {
        let handler = match self.in_flight.remove(&id) {
            Some(pending) => pending.handler,
            None => {
                let pos = self.queue.iter().position(|o| o.request.id == id)?;
                self.queue.remove(pos)?.handler
            }
        };
        warn!(id, "request timed out");
        Some((handler, Err(RequestError::Timeout { id })))
    }

    /// Forget every in-flight request without completing it
    ///
    /// Queued requests stay queued and are sent after the link comes back.
    pub fn abandon_in_flight(&mut self, scheduler: &mut dyn Scheduler) -> usize {
        let count = self.in_flight.len();
        for (_, pending) in self.in_flight.drain() {
            scheduler.cancel(pending.timeout);
        }
        if count > 0 {
            debug!(count, "abandoned in-flight requests");
        }
        count
    }

    /// Unsent requests
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Sent requests awaiting a reply
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether `id` was sent and not yet resolved
    pub fn is_in_flight(&self, id: RequestId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Queue bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ManualClock, TimerQueue};

    fn setup(capacity: usize) -> (Dispatcher<&'static str>, TimerQueue<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let timers = TimerQueue::new(clock.clone());
        (
            Dispatcher::new(capacity, Duration::from_secs(2)),
            timers,
            clock,
        )
    }

    #[test]
    fn test_id_wraparound() {
        let (mut dispatcher, _, _) = setup(4);
        let mut last = 0;
        for _ in 0..300_001 {
            last = dispatcher.next_request_id();
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn test_overflow_fails_only_unsent() {
        let (mut dispatcher, mut timers, _) = setup(2);
        let (sent_id, _) = dispatcher.enqueue(&mut timers, Command::GetInfo, "sent");
        let outbound = dispatcher.next_outbound().unwrap();
        assert_eq!(outbound.id(), sent_id);
        dispatcher.mark_sent(outbound);

        dispatcher.enqueue(&mut timers, Command::GetStatus, "a");
        let (_, overflow) = dispatcher.enqueue(&mut timers, Command::GetStatus, "b");
        assert!(overflow.is_empty());

        let (_, overflow) = dispatcher.enqueue(&mut timers, Command::GetStatus, "c");
        let failed: Vec<_> = overflow.iter().map(|(h, _)| *h).collect();
        assert_eq!(failed, vec!["a", "b"]);
        assert!(overflow
            .iter()
            .all(|(_, r)| *r == Err(RequestError::QueueOverflow)));
        assert_eq!(dispatcher.queued_len(), 1);
        assert!(dispatcher.is_in_flight(sent_id));
        // sent + c armed; a and b cancelled
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn test_timeout_then_late_response() {
        let (mut dispatcher, mut timers, clock) = setup(4);
        let (id, _) = dispatcher.enqueue(&mut timers, Command::GetStatus, "status");
        let outbound = dispatcher.next_outbound().unwrap();
        dispatcher.mark_sent(outbound);

        clock.advance(Duration::from_secs(2));
        assert_eq!(timers.pop_due(), Some(TimerEvent::RequestTimeout(id)));
        let (handler, reply) = dispatcher.on_timeout(id).unwrap();
        assert_eq!(handler, "status");
        assert_eq!(reply, Err(RequestError::Timeout { id }));

        assert!(dispatcher.resolve(&mut timers, id).is_none());
        assert!(dispatcher.on_timeout(id).is_none());
    }

    #[test]
    fn test_resolve_cancels_timeout() {
        let (mut dispatcher, mut timers, _) = setup(4);
        let (id, _) = dispatcher.enqueue(&mut timers, Command::GetInfo, "info");
        let outbound = dispatcher.next_outbound().unwrap();
        dispatcher.mark_sent(outbound);
        assert_eq!(dispatcher.resolve(&mut timers, id), Some("info"));
        assert!(timers.is_empty());
        assert!(dispatcher.on_timeout(id).is_none());
    }

    #[test]
    fn test_timeout_while_still_queued() {
        let (mut dispatcher, mut timers, _) = setup(4);
        let (id, _) = dispatcher.enqueue(&mut timers, Command::GetInfo, "queued");
        let (handler, _) = dispatcher.on_timeout(id).unwrap();
        assert_eq!(handler, "queued");
        assert_eq!(dispatcher.queued_len(), 0);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let (mut dispatcher, mut timers, _) = setup(4);
        dispatcher.enqueue(&mut timers, Command::GetInfo, "first");
        dispatcher.enqueue(&mut timers, Command::GetStatus, "second");
        let head = dispatcher.next_outbound().unwrap();
        dispatcher.requeue_front(head);
        assert_eq!(dispatcher.next_outbound().unwrap().handler, "first");
        assert_eq!(dispatcher.next_outbound().unwrap().handler, "second");
    }

    #[test]
    fn test_abandon_in_flight_keeps_queue() {
        let (mut dispatcher, mut timers, _) = setup(4);
        dispatcher.enqueue(&mut timers, Command::GetInfo, "sent");
        let outbound = dispatcher.next_outbound().unwrap();
        dispatcher.mark_sent(outbound);
        dispatcher.enqueue(&mut timers, Command::GetStatus, "queued");

        assert_eq!(dispatcher.abandon_in_flight(&mut timers), 1);
        assert_eq!(dispatcher.in_flight_len(), 0);
        assert_eq!(dispatcher.queued_len(), 1);
        assert_eq!(timers.len(), 1);
    }
}
