//! Job lifecycle: model, state machine and the durable priority queue.

pub mod model;
pub mod queue;

pub use model::{DEFAULT_PRIORITY, EnqueueOutcome, Job, JobSpec, JobStatus, JobType, QueueStats};
pub use queue::{FailOutcome, JobQueue, RetryPolicy};
