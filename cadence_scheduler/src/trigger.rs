//! Edge-detecting boolean signals bound to commands.
//!
//! A [`Trigger`] samples its condition once per tick, before any command
//! resumes, as long as it has a live binding (or a derived trigger that
//! depends on it has one). Each binding couples a scope, an edge policy and
//! a target command.
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use cadence_scheduler::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let pressed = Rc::new(Cell::new(false));
//! let button = pressed.clone();
//! let intake = Command::no_requirements()
//!     .executing(|co| async move { co.park().await })
//!     .named("Intake");
//!
//! Trigger::new(&scheduler, move || button.get()).while_true(&intake);
//! pressed.set(true);
//! scheduler.run().unwrap();
//! assert!(scheduler.is_running(&intake));
//! ```

mod binding;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::warn;

use crate::clock::duration_to_us;
use crate::command::Command;
use crate::error::BindingSite;
use crate::scheduler::{Scheduler, SchedulerCore};

pub use binding::{BindingScope, BindingType};
use binding::{Binding, EdgeAction, FALLING, RISING};

/// Sampled state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Before the first poll.
    Unknown,
    Low,
    High,
}

impl From<bool> for Signal {
    fn from(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

struct TriggerInner {
    scheduler: Weak<SchedulerCore>,
    condition: Box<dyn Fn() -> bool>,
    cached: Cell<Signal>,
    previous: Cell<Signal>,
    bindings: RefCell<Vec<Binding>>,
    next_binding_id: Cell<u64>,
    /// Polled first so derived triggers see this tick's signal.
    dependencies: Vec<Trigger>,
    dependents: Cell<usize>,
    registered: Cell<bool>,
}

/// Boolean signal with edge-driven command bindings.
#[derive(Clone)]
pub struct Trigger {
    inner: Rc<TriggerInner>,
}

impl Trigger {
    /// A trigger on `scheduler` sampling `condition`.
    pub fn new(scheduler: &Scheduler, condition: impl Fn() -> bool + 'static) -> Self {
        Self::derived(scheduler.downgrade(), Box::new(condition), Vec::new())
    }

    fn derived(
        scheduler: Weak<SchedulerCore>,
        condition: Box<dyn Fn() -> bool>,
        dependencies: Vec<Trigger>,
    ) -> Self {
        Self {
            inner: Rc::new(TriggerInner {
                scheduler,
                condition,
                cached: Cell::new(Signal::Unknown),
                previous: Cell::new(Signal::Unknown),
                bindings: RefCell::new(Vec::new()),
                next_binding_id: Cell::new(0),
                dependencies,
                dependents: Cell::new(0),
                registered: Cell::new(false),
            }),
        }
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        Scheduler::upgrade(&self.inner.scheduler)
    }

    /// Whether the last poll sampled high.
    pub fn is_high(&self) -> bool {
        self.inner.cached.get() == Signal::High
    }

    /// Number of live bindings.
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.borrow().len()
    }

    fn evaluate(&self) -> bool {
        (self.inner.condition)()
    }

    pub(crate) fn same_as(&self, other: &Trigger) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ─── Bindings ───────────────────────────────────────────────────

    /// Schedule `command` on each rising edge.
    #[track_caller]
    pub fn on_true(&self, command: &Command) -> &Self {
        self.bind(BindingType::ScheduleOnRisingEdge, command, BindingSite::caller())
    }

    /// Schedule `command` on each falling edge.
    #[track_caller]
    pub fn on_false(&self, command: &Command) -> &Self {
        self.bind(BindingType::ScheduleOnFallingEdge, command, BindingSite::caller())
    }

    /// Run `command` while the signal is high.
    #[track_caller]
    pub fn while_true(&self, command: &Command) -> &Self {
        self.bind(BindingType::RunWhileHigh, command, BindingSite::caller())
    }

    /// Run `command` while the signal is low.
    #[track_caller]
    pub fn while_false(&self, command: &Command) -> &Self {
        self.bind(BindingType::RunWhileLow, command, BindingSite::caller())
    }

    /// Start `command` on a rising edge, stop it on the next one.
    #[track_caller]
    pub fn toggle_on_true(&self, command: &Command) -> &Self {
        self.bind(BindingType::ToggleOnRisingEdge, command, BindingSite::caller())
    }

    /// Start `command` on a falling edge, stop it on the next one.
    #[track_caller]
    pub fn toggle_on_false(&self, command: &Command) -> &Self {
        self.bind(BindingType::ToggleOnFallingEdge, command, BindingSite::caller())
    }

    /// Add a binding with an explicit scope.
    #[track_caller]
    pub fn add_binding(&self, scope: BindingScope, kind: BindingType, command: &Command) -> &Self {
        self.push_binding(scope, kind, command, BindingSite::caller())
    }

    /// Bindings made inside a command body are scoped to that command.
    fn bind(&self, kind: BindingType, command: &Command, site: BindingSite) -> &Self {
        let scope = self
            .scheduler()
            .and_then(|scheduler| scheduler.current_run())
            .map_or(BindingScope::Global, BindingScope::ForCommand);
        self.push_binding(scope, kind, command, site)
    }

    fn push_binding(
        &self,
        scope: BindingScope,
        kind: BindingType,
        command: &Command,
        site: BindingSite,
    ) -> &Self {
        let id = self.inner.next_binding_id.get();
        self.inner.next_binding_id.set(id + 1);
        self.inner.bindings.borrow_mut().push(Binding {
            id,
            scope,
            kind,
            command: command.clone(),
            site,
        });
        if let Some(scheduler) = self.scheduler() {
            self.ensure_registered(&scheduler);
        }
        self
    }

    fn ensure_registered(&self, scheduler: &Scheduler) {
        if self.inner.registered.replace(true) {
            return;
        }
        for dependency in &self.inner.dependencies {
            dependency.ensure_registered(scheduler);
            dependency
                .inner
                .dependents
                .set(dependency.inner.dependents.get() + 1);
        }
        scheduler.register_trigger(self);
    }

    // ─── Combinators ────────────────────────────────────────────────

    /// High when both conditions are.
    pub fn and(&self, other: &Trigger) -> Trigger {
        let (a, b) = (self.clone(), other.clone());
        Self::derived(
            self.inner.scheduler.clone(),
            Box::new(move || a.evaluate() && b.evaluate()),
            vec![self.clone(), other.clone()],
        )
    }

    /// High when either condition is.
    pub fn or(&self, other: &Trigger) -> Trigger {
        let (a, b) = (self.clone(), other.clone());
        Self::derived(
            self.inner.scheduler.clone(),
            Box::new(move || a.evaluate() || b.evaluate()),
            vec![self.clone(), other.clone()],
        )
    }

    /// High when this condition is not.
    pub fn negate(&self) -> Trigger {
        let base = self.clone();
        Self::derived(
            self.inner.scheduler.clone(),
            Box::new(move || !base.evaluate()),
            vec![self.clone()],
        )
    }

    /// High only on the tick where this trigger went from low to high.
    pub fn rising_edge(&self) -> Trigger {
        let base = self.clone();
        Self::derived(
            self.inner.scheduler.clone(),
            Box::new(move || {
                base.inner.cached.get() == Signal::High && base.inner.previous.get() == Signal::Low
            }),
            vec![self.clone()],
        )
    }

    /// High only on the tick where this trigger went from high to low.
    pub fn falling_edge(&self) -> Trigger {
        let base = self.clone();
        Self::derived(
            self.inner.scheduler.clone(),
            Box::new(move || {
                base.inner.cached.get() == Signal::Low && base.inner.previous.get() == Signal::High
            }),
            vec![self.clone()],
        )
    }

    /// High once the condition has held continuously for `duration`.
    /// Drops to low as soon as the condition does.
    pub fn debounce(&self, duration: Duration) -> Trigger {
        let base = self.clone();
        let scheduler = self.inner.scheduler.clone();
        let hold_us = duration_to_us(duration);
        let high_since: Cell<Option<u64>> = Cell::new(None);
        Self::derived(
            self.inner.scheduler.clone(),
            Box::new(move || {
                if !base.evaluate() {
                    high_since.set(None);
                    return false;
                }
                let Some(now) = Scheduler::upgrade(&scheduler).map(|s| s.now_us()) else {
                    return false;
                };
                let since = high_since.get().unwrap_or(now);
                high_since.set(Some(since));
                now.saturating_sub(since) >= hold_us
            }),
            vec![self.clone()],
        )
    }

    // ─── Polling ────────────────────────────────────────────────────

    pub(crate) fn poll(&self) {
        let Some(scheduler) = self.scheduler() else {
            return;
        };
        if self.binding_count() == 0 && self.inner.dependents.get() == 0 {
            return;
        }
        self.clear_stale_bindings(&scheduler);

        let sample = Signal::from(self.evaluate());
        let previous = self.inner.cached.replace(sample);
        self.inner.previous.set(previous);
        if sample == previous {
            return;
        }

        let table = match sample {
            Signal::High => &RISING,
            Signal::Low => &FALLING,
            Signal::Unknown => return,
        };
        let bindings = self.inner.bindings.borrow().clone();
        for (kind, action) in table {
            for binding in bindings.iter().filter(|b| b.kind == *kind) {
                Self::apply(&scheduler, binding, *action);
            }
        }
    }

    fn apply(scheduler: &Scheduler, binding: &Binding, action: EdgeAction) {
        let cancel = |scheduler: &Scheduler| {
            if let Err(error) = scheduler.cancel(&binding.command) {
                warn!(command = binding.command.name(), %error, "binding failed to cancel its command");
            }
        };
        match action {
            EdgeAction::Schedule => {
                scheduler.schedule_scoped(&binding.command, binding.scope.owner(), binding.site);
            }
            EdgeAction::Cancel => cancel(scheduler),
            EdgeAction::Toggle => {
                if scheduler.is_scheduled_or_running(&binding.command) {
                    cancel(scheduler);
                } else {
                    scheduler.schedule_scoped(&binding.command, binding.scope.owner(), binding.site);
                }
            }
        }
    }

    /// Drop bindings whose scope ended and cancel their commands.
    fn clear_stale_bindings(&self, scheduler: &Scheduler) {
        let scopes: Vec<(u64, BindingScope)> = self
            .inner
            .bindings
            .borrow()
            .iter()
            .map(|binding| (binding.id, binding.scope.clone()))
            .collect();
        let stale: Vec<u64> = scopes
            .into_iter()
            .filter(|(_, scope)| !scope.is_active(scheduler))
            .map(|(id, _)| id)
            .collect();
        if stale.is_empty() {
            return;
        }

        let mut removed = Vec::new();
        self.inner.bindings.borrow_mut().retain(|binding| {
            if stale.contains(&binding.id) {
                removed.push(binding.command.clone());
                false
            } else {
                true
            }
        });
        for command in removed {
            if let Err(error) = scheduler.cancel(&command) {
                warn!(command = command.name(), %error, "stale binding failed to cancel its command");
            }
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("signal", &self.inner.cached.get())
            .field("bindings", &self.binding_count())
            .finish()
    }
}
