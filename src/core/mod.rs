//! Concurrency substrate of the pipeline: bounded work queues and the
//! coalescable job graph built on top of them.

pub mod job;
pub mod queue;

pub use job::{DependencyHandle, Job, JobEvent, JobSubscription};
pub use queue::{ItemState, QueueEvent, WorkContext, WorkItem, WorkQueue};
