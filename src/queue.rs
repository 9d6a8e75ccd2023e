use crate::media::MediaConnection;
use crate::message::{Candidate, PeerId};
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 50;

/// Connectivity candidates which arrived before the remote description was installed.
///
/// Bounded: once full, further candidates are dropped.
#[derive(Debug)]
pub struct CandidateQueue {
    pending: VecDeque<Candidate>,
    capacity: usize,
}

impl CandidateQueue {
    pub fn new(capacity: usize) -> Self {
        CandidateQueue {
            pending: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffers a candidate. Returns false if it was dropped because the queue is full.
    pub fn enqueue(&mut self, peer: &PeerId, candidate: Candidate) -> bool {
        if self.pending.len() >= self.capacity {
            log::warn!(
                "candidate queue for {} is full ({} entries), dropping candidate",
                peer,
                self.capacity
            );
            false
        } else {
            self.pending.push_back(candidate);
            log::debug!("queued candidate from {} ({} pending)", peer, self.pending.len());
            true
        }
    }

    /// Applies every queued candidate in arrival order and empties the queue. Failures are
    /// reported individually and don't stop the drain. Returns the number of candidates
    /// successfully applied.
    pub async fn drain_into<C: MediaConnection>(&mut self, peer: &PeerId, conn: &C) -> usize {
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match conn.add_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("queued candidate from {} rejected: {}", peer, e),
            }
        }
        if applied > 0 {
            log::debug!("applied {} queued candidates from {}", applied, peer);
        }
        applied
    }

    /// Discards every pending candidate.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        CandidateQueue::new(DEFAULT_CAPACITY)
    }
}
