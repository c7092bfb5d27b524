//! Buffering of remote ICE candidates
//!
//! Candidates can arrive before the remote description is applied; adding
//! them to the peer connection at that point fails. The queue holds them in
//! arrival order until [`IceCandidateQueue::drain_into`] is called, then
//! switches to passthrough for the rest of the session.

use crate::types::IceCandidate;
use std::collections::VecDeque;
use std::fmt;

/// Current mode of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Remote description not applied yet; candidates are held
    Buffering,
    /// Remote description applied; candidates are applied on arrival
    Passthrough,
}

type ApplyFn<T> = Box<dyn FnMut(T) + Send>;

/// FIFO of pending candidates with a one-way switch to passthrough
pub struct IceCandidateQueue<T = IceCandidate> {
    pending: VecDeque<T>,
    apply: Option<ApplyFn<T>>,
}

impl<T> IceCandidateQueue<T> {
    /// Create an empty queue in buffering mode
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            apply: None,
        }
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> QueueMode {
        if self.apply.is_some() {
            QueueMode::Passthrough
        } else {
            QueueMode::Buffering
        }
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffer a candidate, or apply it right away once drained
    ///
    /// Duplicates are kept; the ICE agent tolerates them.
    pub fn enqueue(&mut self, candidate: T) {
        match self.apply.as_mut() {
            Some(apply) => apply(candidate),
            None => self.pending.push_back(candidate),
        }
    }

    /// Deliver every buffered candidate in order and switch to passthrough
    ///
    /// Only the first call has any effect; `apply` is kept for candidates
    /// enqueued afterwards. Returns the number of candidates delivered.
    pub fn drain_into<F>(&mut self, apply: F) -> usize
    where
        F: FnMut(T) + Send + 'static,
    {
        if self.apply.is_some() {
            tracing::warn!("Candidate queue already drained; ignoring second drain");
            return 0;
        }

        let mut apply: ApplyFn<T> = Box::new(apply);
        let delivered = self.pending.len();
        for candidate in self.pending.drain(..) {
            apply(candidate);
        }
        self.apply = Some(apply);

        tracing::debug!(delivered, "Candidate queue drained, passthrough enabled");
        delivered
    }

    /// Drop buffered candidates and detach the apply function
    ///
    /// The queue stays in passthrough-off state: later candidates are
    /// buffered and never applied. Returns the number of candidates dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.apply = None;
        dropped
    }
}

impl<T> Default for IceCandidateQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for IceCandidateQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceCandidateQueue")
            .field("mode", &self.mode())
            .field("pending", &self.pending.len())
            .finish()
    }
}
