#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! esd-engine: the pilot driver's orchestration logic (spec.md §4) —
//! job/range lifecycle management, the payload worker-farm supervisor,
//! the scheduler loop, stage-out, and crash recovery.

pub mod lifecycle;
pub mod payload;
pub mod recovery;
pub mod scheduler;
pub mod stageout;

pub use lifecycle::{HpcJobRecord, Lifecycle};
pub use payload::PayloadSupervisor;
pub use recovery::recover;
pub use scheduler::Scheduler;
pub use stageout::StageoutPipeline;
