//! Request bookkeeping.
//!
//! A request is a one-shot operation record: connect, write, shutdown,
//! work, filesystem op, address lookup. Each one counts toward loop
//! liveness from creation until its callback has run, so `run` in default
//! mode cannot return while any operation is still in flight.

/// Identifier of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request(pub(crate) u64);

pub(crate) struct Requests {
    next_id: u64,
    in_flight: usize,
}

impl Requests {
    pub(crate) fn new() -> Self {
        Requests {
            next_id: 0,
            in_flight: 0,
        }
    }

    pub(crate) fn create(&mut self) -> Request {
        self.next_id += 1;
        self.in_flight += 1;
        Request(self.next_id)
    }

    /// Marks one request finished. Called exactly once per request, right
    /// before its callback is dispatched.
    pub(crate) fn complete(&mut self) {
        debug_assert!(self.in_flight > 0, "request completion underflow");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }
}
