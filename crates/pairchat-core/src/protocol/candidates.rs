//! Remote candidate buffer
//!
//! Holds candidates that arrive before the remote description is applied.
//! The buffer drains exactly once; afterwards candidates are applied directly.

use smallvec::SmallVec;

use super::signal::IceCandidate;

/// FIFO of remote candidates awaiting the remote description
#[derive(Debug, Clone, Default)]
pub struct CandidateBuffer {
    pending: SmallVec<[IceCandidate; 8]>,
    drained: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate in receipt order.
    ///
    /// Returns the candidate back if the buffer has already drained; the caller
    /// must apply it directly.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.drained {
            return Some(candidate);
        }
        self.pending.push(candidate);
        None
    }

    /// Take every buffered candidate in order. Only the first call yields.
    pub fn drain(&mut self) -> Option<Vec<IceCandidate>> {
        if self.drained {
            return None;
        }
        self.drained = true;
        Some(self.pending.drain(..).collect())
    }

    /// Discard everything and re-arm for a new negotiation
    pub fn clear(&mut self) {
        self.pending.clear();
        self.drained = false;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}
