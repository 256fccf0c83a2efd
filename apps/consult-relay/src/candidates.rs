use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_QUEUE_CAP: usize = 256;

/// Outcome of handing a candidate to a [`CandidateQueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The consumer already applied a remote description; forward now.
    Forward(Value),
    /// Held until the next flush; `depth` is the queue length afterwards.
    Queued { depth: usize },
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("candidate queue is full ({cap} pending)")]
pub struct QueueFull {
    pub cap: usize,
}

/// ICE candidates flowing in one direction of a peer pair.
///
/// The queue starts in buffering mode. `flush` drains it in FIFO order and
/// switches to pass-through until `reopen` is called for a renegotiation.
#[derive(Debug, Clone)]
pub struct CandidateQueue {
    pending: VecDeque<Value>,
    buffering: bool,
    cap: usize,
}

impl CandidateQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            buffering: true,
            cap: cap.max(1),
        }
    }

    pub fn enqueue(&mut self, candidate: Value) -> Result<Admission, QueueFull> {
        if !self.buffering {
            return Ok(Admission::Forward(candidate));
        }
        if self.pending.len() >= self.cap {
            return Err(QueueFull { cap: self.cap });
        }
        self.pending.push_back(candidate);
        Ok(Admission::Queued {
            depth: self.pending.len(),
        })
    }

    /// Drains every held candidate in arrival order and stops buffering.
    pub fn flush(&mut self) -> Vec<Value> {
        self.buffering = false;
        self.pending.drain(..).collect()
    }

    /// Resumes buffering; candidates still held are kept.
    pub fn reopen(&mut self) {
        self.buffering = true;
    }

    /// Discards held candidates, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAP)
    }
}
