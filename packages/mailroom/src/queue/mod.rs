//! Producer-facing queue surface.

pub mod service;

pub use service::{
    JobDescriptor, JobView, QueueHealth, QueueService, SubmitError, SubmitReceipt, WorkerStatus,
};
