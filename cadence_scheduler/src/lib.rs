//! # Cadence Scheduler
//!
//! Cooperative, priority-aware command scheduler for robot control loops.
//! Behaviors are written as `async` command bodies that suspend only at
//! explicit points; one [`Scheduler::run`] call advances every mounted
//! command by exactly one slice.
//!
//! ## Building Blocks
//!
//! 1. **Mechanism**: a named, exclusively held resource
//! 2. **Command**: an immutable descriptor (name, priority, requirements, body)
//! 3. **Coroutine**: what a running body uses to yield, wait, fork and await
//! 4. **Scheduler**: the run-forest, the on-deck queue and the tick protocol
//! 5. **Trigger**: edge-detecting signals bound to commands
//! 6. **Groups and StateMachine**: compositions that are commands themselves
//!
//! ## Determinism
//!
//! Everything runs on the calling thread. Time comes from an injected
//! [`TimeSource`](clock::TimeSource); tests drive a
//! [`ManualClock`](clock::ManualClock) by hand.

pub mod clock;
pub mod command;
pub mod conflict;
pub mod coroutine;
pub mod cycle;
pub mod error;
pub mod event;
pub mod group;
pub mod mechanism;
pub mod prelude;
pub mod scheduler;
pub mod state_machine;
pub mod trigger;

pub use command::Command;
pub use coroutine::Coroutine;
pub use error::{BoxError, CommandResult, SchedulerError};
pub use mechanism::Mechanism;
pub use scheduler::{RunId, ScheduleResult, Scheduler};
pub use trigger::Trigger;
