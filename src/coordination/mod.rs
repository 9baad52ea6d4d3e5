//! Coordination layer for extrinsic operations
//!
//! The coordination layer:
//! 1. Expresses each operation as a task graph with one target unit
//! 2. Hands graphs to a scheduler that can cancel them as a whole
//! 3. Delivers every outcome exactly once on the caller's execution context
//! 4. Expands batch outcomes to one result per index

pub mod context;
pub mod dependency;
pub mod engine;
pub mod fanout;
pub mod scheduler;

pub use context::{DispatchContext, Immediate, Job, SerialQueue};
pub use dependency::{Completion, Dependency, GraphBuilder, TaskGraph, Unit};
pub use engine::ExtrinsicService;
pub use fanout::fan_out;
pub use scheduler::{GraphHandle, ManualScheduler, Scheduler, TokioScheduler};
