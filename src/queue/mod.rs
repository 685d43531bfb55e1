//! Task Queue Layer: asynchronous, retryable, status-queryable processing.
//!
//! ```text
//! enqueue ─▶ TaskRegistry (PENDING) ─▶ Broker ─▶ worker ─▶ Pipeline::process
//!                                         ▲                     │
//!                                         └──── requeue (RETRY) ┘
//! ```
//!
//! - [`task`]: `Task`, `TaskStatus` and the legal transitions
//! - [`registry`]: status storage that enforces those transitions
//! - [`broker`]: job delivery with visibility-timeout leases
//! - [`worker`]: `TaskQueue`: enqueue, status, worker pool, task retry

pub mod broker;
pub mod registry;
pub mod task;
pub mod worker;

pub use broker::{Broker, Job, Lease, MemoryBroker};
pub use registry::TaskRegistry;
pub use task::{Task, TaskError, TaskStatus};
pub use worker::TaskQueue;
