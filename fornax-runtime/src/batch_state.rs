//! Scheduler queue state
//!
//! Four queues under two mutexes. The buffer queue is contended by client
//! threads calling enqueue and is drained into the waiting queue at the top
//! of every schedule pass; the main queues are guarded by a single mutex
//! held only inside `schedule()` and the between-step commit.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::request::InferRequest;

/// The three scheduler-owned queues. Requests move waiting → running ⇌
/// swapped and leave when finished. Strong ownership lives here.
pub struct Queues {
    /// Admitted requests that do not yet hold blocks. FIFO.
    pub waiting: VecDeque<InferRequest>,
    /// Requests that execute in the next step, in arrival order.
    pub running: Vec<InferRequest>,
    /// Requests paused with their KV blocks on the host. FIFO.
    pub swapped: VecDeque<InferRequest>,
}

impl Queues {
    fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            running: Vec::new(),
            swapped: VecDeque::new(),
        }
    }

    /// Whether nothing is admitted, running, or swapped.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty() && self.swapped.is_empty()
    }
}

/// Queue storage shared between producers and the driver thread.
pub struct BatchState {
    buffer: Mutex<VecDeque<InferRequest>>,
    queues: Mutex<Queues>,
}

impl BatchState {
    /// Create empty queue state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            queues: Mutex::new(Queues::new()),
        }
    }

    /// Append a request group to the buffer queue in arrival order.
    pub fn push_buffer(&self, group: Vec<InferRequest>) {
        let mut buffer = self.buffer.lock().expect("buffer mutex poisoned");
        buffer.extend(group);
    }

    /// Requests waiting for admission, counting both the buffer and the
    /// waiting queue. Used by the enqueue backpressure gate.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        let buffered = self.buffer.lock().expect("buffer mutex poisoned").len();
        let waiting = self.queues.lock().expect("queue mutex poisoned").waiting.len();
        buffered + waiting
    }

    /// Lock the main queues. Held for the duration of a schedule pass.
    #[must_use]
    pub fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().expect("queue mutex poisoned")
    }

    /// Drain the buffer queue into `queues.waiting`, preserving arrival
    /// order. Call with the main queue lock held.
    pub fn drain_buffer_into(&self, queues: &mut Queues) {
        let mut buffer = self.buffer.lock().expect("buffer mutex poisoned");
        queues.waiting.extend(buffer.drain(..));
    }

    /// Drain every queue for shutdown, returning all owned requests.
    #[must_use]
    pub fn drain_all(&self) -> Vec<InferRequest> {
        let mut queues = self.lock_queues();
        self.drain_buffer_into(&mut queues);
        let mut requests: Vec<InferRequest> = queues.waiting.drain(..).collect();
        requests.extend(queues.running.drain(..));
        requests.extend(queues.swapped.drain(..));
        requests
    }
}

impl Default for BatchState {
    fn default() -> Self {
        Self::new()
    }
}
