//! Globally bounded download pipeline for attachment content.

mod pool;
mod processor;
mod queue;

pub use pool::{WorkerPool, WorkerSlot};
pub use processor::{AttachmentProcessor, FsAttachmentProcessor};
pub use queue::{AttachmentJobQueue, AttachmentQueueConfig, JobTarget};
