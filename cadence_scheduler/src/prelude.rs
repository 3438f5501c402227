//! Common re-exports for convenience.
//!
//! ```rust
//! use cadence_scheduler::prelude::*;
//! ```

pub use cadence_common::prelude::*;

pub use crate::clock::{ManualClock, MonotonicClock, TimeSource};
pub use crate::command::{Command, CommandBuilder, NamingStage};
pub use crate::conflict::{Conflict, ConflictError, ensure_no_conflicts, find_all_conflicts};
pub use crate::coroutine::Coroutine;
pub use crate::cycle::{CycleError, CycleStats, JsonLinesSink, TelemetrySink, TickLoop};
pub use crate::error::{BindingSite, BoxError, CommandFailure, CommandResult, SchedulerError};
pub use crate::event::SchedulerEvent;
pub use crate::group::{ParallelGroupBuilder, SequentialGroupBuilder, parallel, race, sequence};
pub use crate::mechanism::Mechanism;
pub use crate::scheduler::{RunId, ScheduleResult, Scheduler};
pub use crate::state_machine::{State, StateMachine};
pub use crate::trigger::{BindingScope, BindingType, Trigger};
