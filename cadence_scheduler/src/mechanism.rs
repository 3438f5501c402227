//! Exclusive resources.
//!
//! A [`Mechanism`] stands for one physical subsystem. At most one running
//! command may require it at a time; the scheduler enforces that at
//! promotion and fork time. A mechanism belongs to exactly one scheduler and
//! may carry a default command that the scheduler re-arms whenever the
//! mechanism is left without a claimant.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use cadence_common::consts::{IDLE_SUFFIX, LOWEST_PRIORITY};

use crate::command::{Command, NamingStage};
use crate::coroutine::Coroutine;
use crate::error::{BindingSite, CommandResult, SchedulerError};
use crate::scheduler::{Scheduler, SchedulerCore};

pub(crate) struct MechanismInner {
    name: String,
    scheduler: Weak<SchedulerCore>,
    default_command: RefCell<Option<(Command, BindingSite)>>,
}

/// Named exclusive resource.
#[derive(Clone)]
pub struct Mechanism {
    inner: Rc<MechanismInner>,
}

impl Mechanism {
    /// Create a mechanism owned by `scheduler`.
    pub fn new(name: impl Into<String>, scheduler: &Scheduler) -> Self {
        let mechanism = Self {
            inner: Rc::new(MechanismInner {
                name: name.into(),
                scheduler: scheduler.downgrade(),
                default_command: RefCell::new(None),
            }),
        };
        scheduler.register_mechanism(&mechanism);
        mechanism
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The owning scheduler, if it still exists.
    pub fn scheduler(&self) -> Option<Scheduler> {
        Scheduler::upgrade(&self.inner.scheduler)
    }

    /// Start building a command that requires this mechanism.
    pub fn run<F, Fut>(&self, body: F) -> NamingStage
    where
        F: Fn(Coroutine) -> Fut + 'static,
        Fut: Future<Output = CommandResult> + 'static,
    {
        Command::requiring([self]).executing(body)
    }

    /// A command that holds this mechanism forever at the lowest priority.
    pub fn idle(&self) -> Command {
        self.run(|co| async move { co.park().await })
            .with_priority(LOWEST_PRIORITY)
            .named(format!("{}{IDLE_SUFFIX}", self.name()))
    }

    /// Replace the default command.
    ///
    /// The command must require this mechanism and nothing else. If the
    /// mechanism is currently unclaimed the default is queued right away.
    #[track_caller]
    pub fn set_default_command(&self, command: Command) -> Result<(), SchedulerError> {
        if command.requirements() != std::slice::from_ref(self) {
            return Err(SchedulerError::InvalidDefaultCommand {
                mechanism: self.name().to_string(),
                command: command.name().to_string(),
                reason: "a default command must require exactly its mechanism".to_string(),
            });
        }
        *self.inner.default_command.borrow_mut() = Some((command, BindingSite::caller()));
        if let Some(scheduler) = self.scheduler() {
            scheduler.rearm_default(self);
        }
        Ok(())
    }

    pub fn default_command(&self) -> Option<Command> {
        self.inner
            .default_command
            .borrow()
            .as_ref()
            .map(|(command, _)| command.clone())
    }

    pub(crate) fn default_binding(&self) -> Option<(Command, BindingSite)> {
        self.inner.default_command.borrow().clone()
    }

    /// Running commands that hold this mechanism.
    pub fn running_commands(&self) -> Vec<Command> {
        self.scheduler()
            .map(|scheduler| scheduler.running_commands_for(self))
            .unwrap_or_default()
    }

    pub(crate) fn downgrade(&self) -> Weak<MechanismInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<MechanismInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl PartialEq for Mechanism {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Mechanism {}

impl Hash for Mechanism {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mechanism({})", self.inner.name)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
