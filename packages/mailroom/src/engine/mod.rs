//! Engine loops: dispatcher, worker pool, scheduler, and maintenance
//! tasks, plus the service host they run under.
//!
//! ```text
//! Producers ──► Store (email_queue)
//!                  │
//!   Scheduler ─────┤  (due plans → queue jobs, wake)
//!                  ▼
//!   Dispatcher ─► claim batch ─► WorkerPool ─► compose → send → record
//!                  │                               │
//!   reclaim_stale ─┘                               ├─► History
//!                                                  └─► Metrics
//! ```

pub mod archiver;
pub mod dispatcher;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use archiver::{run_daily_purge, run_monthly_archive, start_archiver};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use service::{Service, ServiceHost};
pub use worker::{JobWorker, WorkerPool, WorkerSettings};
