//! Scheduler error taxonomy.
//!
//! Three families:
//! - configuration errors (missing initial state, conflicting parallel set,
//!   bad default command) raised at the offending call;
//! - self-cancellation, raised to the canceling body and surfaced from `run()`;
//! - body errors, wrapped in [`CommandFailure`] with the binding trace of the
//!   failing command and surfaced exactly once from `run()`.

use std::error::Error;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use cadence_common::config::ConfigError;
use cadence_common::consts::BINDING_TRACE_HEADER;
use thiserror::Error;

use crate::conflict::ConflictError;
use crate::scheduler::RunId;

/// Error type returned by command bodies.
pub type BoxError = Box<dyn Error + 'static>;

/// Result type returned by command bodies.
pub type CommandResult = Result<(), BoxError>;

/// Where a command instance was scheduled, forked or bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSite(&'static Location<'static>);

impl BindingSite {
    /// Site of the caller of the enclosing `#[track_caller]` function.
    #[track_caller]
    pub fn caller() -> Self {
        Self(Location::caller())
    }

    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Display for BindingSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

/// One frame of a binding trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub command: String,
    pub site: BindingSite,
}

/// A command body returned an error.
///
/// Frames run from the failing command outwards through its ancestors.
#[derive(Debug)]
pub struct CommandFailure {
    command: String,
    run_id: RunId,
    trace: Vec<TraceFrame>,
    source: BoxError,
}

impl CommandFailure {
    pub(crate) fn new(command: String, run_id: RunId, trace: Vec<TraceFrame>, source: BoxError) -> Self {
        Self {
            command,
            run_id,
            trace,
            source,
        }
    }

    /// Name of the command whose body failed.
    pub fn command_name(&self) -> &str {
        &self.command
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn binding_trace(&self) -> &[TraceFrame] {
        &self.trace
    }

    /// Site where the failing command itself was scheduled or forked.
    pub fn binding_site(&self) -> Option<BindingSite> {
        self.trace.first().map(|frame| frame.site)
    }

    /// The error returned by the body.
    pub fn source_error(&self) -> &(dyn Error + 'static) {
        self.source.as_ref()
    }

    /// Downcast the body error.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.source)?;
        write!(f, "{BINDING_TRACE_HEADER}")?;
        for frame in &self.trace {
            write!(f, "\n    at {} ({})", frame.command, frame.site)?;
        }
        Ok(())
    }
}

impl Error for CommandFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Errors raised by the scheduler and its composition layers.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A command body returned an error.
    #[error("{0}")]
    CommandFailed(Rc<CommandFailure>),

    /// A command tried to cancel itself while executing.
    #[error("Command `{command}` is mounted and cannot be canceled")]
    SelfCancel { command: String },

    /// A coroutine primitive was used by a command that is no longer running.
    #[error("Command `{command}` is no longer mounted")]
    Unmounted { command: String },

    /// Commands that must run together share requirements.
    #[error(transparent)]
    Conflicts(#[from] ConflictError),

    /// A state machine was ticked before an initial state was chosen.
    #[error("{machine} does not have an initial state. Use .set_initial_state() to provide one.")]
    MissingInitialState { machine: String },

    /// A state belonging to another state machine was used.
    #[error("state `{state}` does not belong to state machine `{machine}`")]
    ForeignState { machine: String, state: String },

    /// A default command that does not fit its mechanism.
    #[error("`{command}` cannot be the default command of `{mechanism}`: {reason}")]
    InvalidDefaultCommand {
        mechanism: String,
        command: String,
        reason: String,
    },

    /// A sideload callback returned an error.
    #[error("sideload failed: {0}")]
    SideloadFailed(Rc<BoxError>),

    /// `run()` was called from inside a tick.
    #[error("run() cannot be called while a tick is in progress")]
    NestedRun,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SchedulerError {
    /// The command failure, if this error wraps one.
    pub fn failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::CommandFailed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Downcast the innermost body error of a command failure.
    ///
    /// Failures nested through several composition layers are unwrapped until
    /// a body error of type `E` is found.
    pub fn downcast_failure<E: Error + 'static>(&self) -> Option<&E> {
        let mut failure = self.failure()?;
        loop {
            if let Some(found) = failure.downcast_ref::<E>() {
                return Some(found);
            }
            failure = failure.downcast_ref::<SchedulerError>()?.failure()?;
        }
    }
}
