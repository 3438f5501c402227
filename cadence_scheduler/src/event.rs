//! Scheduler event log.
//!
//! Every observable state transition of a command run is recorded as a
//! [`SchedulerEvent`]. Events are buffered while a tick is in progress and
//! handed to listeners in order once it ends; calls made outside a tick
//! deliver their events before returning.

use std::rc::Rc;

use crate::command::Command;
use crate::error::CommandFailure;

/// One state transition of a command run.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Placed on deck, or forked straight into the running set.
    Scheduled { command: Command, timestamp_us: u64 },
    /// About to execute a slice.
    Mounted { command: Command, timestamp_us: u64 },
    /// Suspended at the end of a slice.
    Yielded { command: Command, timestamp_us: u64 },
    /// Body returned normally.
    Completed { command: Command, timestamp_us: u64 },
    /// Body returned an error.
    CompletedWithError {
        command: Command,
        failure: Rc<CommandFailure>,
        timestamp_us: u64,
    },
    /// Removed before completing, or discarded from the deck.
    Canceled { command: Command, timestamp_us: u64 },
    /// Preempted by a higher-priority command. Followed by `Canceled`.
    Interrupted {
        command: Command,
        interrupter: Command,
        timestamp_us: u64,
    },
}

impl SchedulerEvent {
    pub fn command(&self) -> &Command {
        match self {
            Self::Scheduled { command, .. }
            | Self::Mounted { command, .. }
            | Self::Yielded { command, .. }
            | Self::Completed { command, .. }
            | Self::CompletedWithError { command, .. }
            | Self::Canceled { command, .. }
            | Self::Interrupted { command, .. } => command,
        }
    }

    pub fn timestamp_us(&self) -> u64 {
        match self {
            Self::Scheduled { timestamp_us, .. }
            | Self::Mounted { timestamp_us, .. }
            | Self::Yielded { timestamp_us, .. }
            | Self::Completed { timestamp_us, .. }
            | Self::CompletedWithError { timestamp_us, .. }
            | Self::Canceled { timestamp_us, .. }
            | Self::Interrupted { timestamp_us, .. } => *timestamp_us,
        }
    }

    /// Short lowercase tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scheduled { .. } => "scheduled",
            Self::Mounted { .. } => "mounted",
            Self::Yielded { .. } => "yielded",
            Self::Completed { .. } => "completed",
            Self::CompletedWithError { .. } => "completed_with_error",
            Self::Canceled { .. } => "canceled",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

/// Receives the ordered event stream.
pub type EventListener = Box<dyn FnMut(&SchedulerEvent)>;
