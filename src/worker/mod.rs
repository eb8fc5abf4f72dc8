//! Job execution: handler registry, worker pool and maintenance sweep.

pub mod handler;
pub mod maintenance;
pub mod pool;

pub use handler::{Handler, HandlerContext, HandlerOutput, HandlerRegistry, MemoryEffect};
pub use maintenance::{Maintenance, SweepReport, spawn_maintenance_task};
pub use pool::{JobRun, WorkerConfig, WorkerPool};
