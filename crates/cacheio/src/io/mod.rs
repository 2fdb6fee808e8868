//! Request plumbing: messages, queues, the engine seam, and the per-disk
//! service thread.

pub mod engine;
pub mod filter;
pub mod message;
pub mod queue;
pub mod request;
pub mod service;
pub mod stats;

pub use engine::AsyncIo;
pub use filter::{DirtyPageFilter, FileMapper};
pub use message::Message;
pub use queue::MsgQueue;
pub use request::{IoEndpoint, IoOp, IoRequest, Priority, RequestOwner};
pub use service::{DiskIoService, ServiceConfig, ServiceHandle};
pub use stats::{ServiceStats, StatsSnapshot};
