//! The asynchronous I/O engine abstraction.
//!
//! The real submission mechanism (libaio, io_uring) lives behind this trait;
//! the service only cares about depth accounting and completion waits. An
//! engine is constructed for one file partition with a fixed per-file depth
//! and a NUMA node, and delivers completions to each request's endpoint.

use crate::io::request::IoRequest;

pub trait AsyncIo: Send {
    /// One-time setup on the service thread (after NUMA binding).
    fn init(&mut self) {}

    /// Submit a batch of requests, preserving their order.
    fn submit(&mut self, requests: Vec<IoRequest>);

    /// Block until at least `min` in-flight operations complete.
    fn wait_for_complete(&mut self, min: usize);

    /// Free submission slots out of the fixed depth.
    fn available_slots(&self) -> usize;

    /// Submitted, not yet completed operations.
    fn pending_ios(&self) -> usize;

    /// Push buffered submissions down to the kernel.
    fn flush_submissions(&mut self);
}
