//! Binding scopes and edge policies.

use std::fmt;
use std::rc::Rc;

use crate::command::Command;
use crate::error::BindingSite;
use crate::scheduler::{RunId, Scheduler};

/// How long a binding stays alive.
#[derive(Clone)]
pub enum BindingScope {
    /// For the lifetime of the trigger.
    Global,
    /// While the given run is mounted. Commands the binding schedules become
    /// children of that run.
    ForCommand(RunId),
    /// While the predicate holds.
    When(Rc<dyn Fn() -> bool>),
}

impl BindingScope {
    pub fn when(predicate: impl Fn() -> bool + 'static) -> Self {
        Self::When(Rc::new(predicate))
    }

    pub(crate) fn is_active(&self, scheduler: &Scheduler) -> bool {
        match self {
            Self::Global => true,
            Self::ForCommand(id) => scheduler.is_run_alive(*id),
            Self::When(predicate) => predicate(),
        }
    }

    /// Parent run for commands scheduled through this scope.
    pub(crate) fn owner(&self) -> Option<RunId> {
        match self {
            Self::ForCommand(id) => Some(*id),
            Self::Global | Self::When(_) => None,
        }
    }
}

impl fmt::Debug for BindingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("Global"),
            Self::ForCommand(id) => write!(f, "ForCommand({id})"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Edge policy of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    /// Schedule on low → high and let the command finish on its own.
    ScheduleOnRisingEdge,
    /// Schedule on high → low and let the command finish on its own.
    ScheduleOnFallingEdge,
    /// Schedule on low → high, cancel on high → low.
    RunWhileHigh,
    /// Schedule on high → low, cancel on low → high.
    RunWhileLow,
    /// Alternate schedule and cancel on every low → high.
    ToggleOnRisingEdge,
    /// Alternate schedule and cancel on every high → low.
    ToggleOnFallingEdge,
}

/// What a binding does to its command on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeAction {
    Schedule,
    Cancel,
    Toggle,
}

/// Policy groups applied on a rising edge, in order.
pub(crate) const RISING: [(BindingType, EdgeAction); 4] = [
    (BindingType::ScheduleOnRisingEdge, EdgeAction::Schedule),
    (BindingType::RunWhileHigh, EdgeAction::Schedule),
    (BindingType::RunWhileLow, EdgeAction::Cancel),
    (BindingType::ToggleOnRisingEdge, EdgeAction::Toggle),
];

/// Policy groups applied on a falling edge, in order.
pub(crate) const FALLING: [(BindingType, EdgeAction); 4] = [
    (BindingType::ScheduleOnFallingEdge, EdgeAction::Schedule),
    (BindingType::RunWhileLow, EdgeAction::Schedule),
    (BindingType::RunWhileHigh, EdgeAction::Cancel),
    (BindingType::ToggleOnFallingEdge, EdgeAction::Toggle),
];

#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) id: u64,
    pub(crate) scope: BindingScope,
    pub(crate) kind: BindingType,
    pub(crate) command: Command,
    pub(crate) site: BindingSite,
}
