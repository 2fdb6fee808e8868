//! Batched request containers.
//!
//! Requests move through the inter-thread queues packed into messages, so
//! one queue operation amortises over a whole batch.

use std::collections::VecDeque;

use crate::io::request::IoRequest;
use crate::params::IO_MSG_SIZE;

#[derive(Debug)]
pub struct Message {
    reqs: VecDeque<IoRequest>,
    cap: usize,
}

impl Message {
    pub fn new() -> Self {
        Self::with_capacity(IO_MSG_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            reqs: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Append a request; hands it back when the message is full.
    pub fn add(&mut self, req: IoRequest) -> Result<(), IoRequest> {
        if self.reqs.len() >= self.cap {
            return Err(req);
        }
        self.reqs.push_back(req);
        Ok(())
    }

    /// Take the next request, front to back.
    pub fn next(&mut self) -> Option<IoRequest> {
        self.reqs.pop_front()
    }

    pub fn has_next(&self) -> bool {
        !self.reqs.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Move every remaining request out, preserving order.
    pub fn take_requests(&mut self) -> Vec<IoRequest> {
        self.reqs.drain(..).collect()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}
