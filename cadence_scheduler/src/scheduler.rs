//! The command scheduler.
//!
//! One [`Scheduler`] owns a run-forest of mounted commands, an on-deck queue,
//! the registered triggers, sideloads and periodic callbacks, and the time
//! source. Each call to [`Scheduler::run`] performs exactly one tick:
//!
//! 1. poll triggers that have bindings
//! 2. drain one-shot sideloads
//! 3. run periodic callbacks
//! 4. resume mounted commands, one slice each, parents before children
//! 5. promote on-deck commands in FIFO order, arbitrating conflicts by priority
//! 6. re-arm default commands of unclaimed mechanisms for the next tick
//!
//! then records telemetry and hands the tick's events to listeners.
//!
//! Everything is single-threaded. Handles are cheap `Rc` clones; mechanisms,
//! triggers and coroutines only hold weak references back to the scheduler.

mod forest;
mod lifecycle;
mod snapshot;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use cadence_common::config::SchedulerConfig;
use tracing::{debug, trace};

use crate::clock::{MonotonicClock, TimeSource, us_to_ms};
use crate::command::Command;
use crate::coroutine::Coroutine;
use crate::error::{BindingSite, CommandResult, SchedulerError};
use crate::event::{EventListener, SchedulerEvent};
use crate::mechanism::{Mechanism, MechanismInner};
use crate::trigger::Trigger;

pub(crate) use forest::Suspension;
use forest::{OnDeck, RunForest};

/// Identifier of one scheduling of a command. Assigned when the command is
/// placed on deck (or forked) and kept for the lifetime of that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u32);

impl RunId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// Placed on deck, or forked and given its first slice.
    Success,
    /// Already on deck or running; nothing changed.
    AlreadyRunning,
    /// Conflicts with a command of equal or higher priority.
    LowerPriorityThanRunningCommand,
}

type Sideload = Box<dyn FnOnce(&Coroutine) -> CommandResult>;
type Periodic = Rc<RefCell<Box<dyn FnMut()>>>;

pub(crate) struct SchedulerState {
    next_run_id: u32,
    tick: u64,
    in_tick: bool,
    queue: VecDeque<OnDeck>,
    forest: RunForest,
    /// Runs whose slice is on the call stack, innermost last.
    executing: Vec<RunId>,
    sideloads: Vec<Sideload>,
    periodics: Vec<Periodic>,
    mechanisms: Vec<Weak<MechanismInner>>,
    triggers: Vec<Trigger>,
    events: VecDeque<SchedulerEvent>,
    failure: Option<SchedulerError>,
    last_tick_us: Option<u64>,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            next_run_id: 0,
            tick: 0,
            in_tick: false,
            queue: VecDeque::new(),
            forest: RunForest::default(),
            executing: Vec::new(),
            sideloads: Vec::new(),
            periodics: Vec::new(),
            mechanisms: Vec::new(),
            triggers: Vec::new(),
            events: VecDeque::new(),
            failure: None,
            last_tick_us: None,
        }
    }

    fn allocate_run_id(&mut self) -> RunId {
        self.next_run_id += 1;
        RunId(self.next_run_id)
    }

    fn is_queued(&self, command: &Command) -> bool {
        self.queue.iter().any(|entry| &entry.command == command)
    }

    fn is_scheduled_or_running(&self, command: &Command) -> bool {
        self.is_queued(command) || self.forest.find(command).is_some()
    }

    fn emit(&mut self, event: SchedulerEvent) {
        let command = event.command().name();
        match &event {
            SchedulerEvent::Mounted { .. } | SchedulerEvent::Yielded { .. } => {
                trace!(command, event = event.kind(), "slice");
            }
            SchedulerEvent::Interrupted { interrupter, .. } => {
                debug!(command, interrupter = interrupter.name(), "command interrupted");
            }
            _ => debug!(command, event = event.kind(), "command lifecycle"),
        }
        self.events.push_back(event);
    }
}

pub(crate) struct SchedulerCore {
    name: String,
    clock: Box<dyn TimeSource>,
    state: RefCell<SchedulerState>,
    listeners: RefCell<Vec<EventListener>>,
}

/// Handle to an isolated scheduler instance.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<SchedulerCore>,
}

impl Scheduler {
    /// Scheduler on the process monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }

    /// Scheduler on an injected time source.
    pub fn with_clock(clock: impl TimeSource + 'static) -> Self {
        Self::build("scheduler".to_string(), Box::new(clock))
    }

    /// Validate `config` and build a scheduler named after its service.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self::build(
            config.shared.service_name.clone(),
            Box::new(MonotonicClock::new()),
        ))
    }

    fn build(name: String, clock: Box<dyn TimeSource>) -> Self {
        Self {
            core: Rc::new(SchedulerCore {
                name,
                clock,
                state: RefCell::new(SchedulerState::new()),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current reading of the scheduler's time source [µs].
    pub fn now_us(&self) -> u64 {
        self.core.clock.now_us()
    }

    pub(crate) fn downgrade(&self) -> Weak<SchedulerCore> {
        Rc::downgrade(&self.core)
    }

    pub(crate) fn upgrade(weak: &Weak<SchedulerCore>) -> Option<Self> {
        weak.upgrade().map(|core| Self { core })
    }

    pub(crate) fn register_mechanism(&self, mechanism: &Mechanism) {
        self.core
            .state
            .borrow_mut()
            .mechanisms
            .push(mechanism.downgrade());
    }

    pub(crate) fn register_trigger(&self, trigger: &Trigger) {
        let mut state = self.core.state.borrow_mut();
        if !state.triggers.iter().any(|t| t.same_as(trigger)) {
            state.triggers.push(trigger.clone());
        }
    }

    // ─── Scheduling ─────────────────────────────────────────────────

    /// Schedule `command`.
    ///
    /// Outside a tick the command goes on deck and is promoted by the next
    /// [`run`](Self::run). From inside a command body it is forked as a child
    /// of the executing command and gets its first slice before this returns.
    #[track_caller]
    pub fn schedule(&self, command: &Command) -> ScheduleResult {
        let site = BindingSite::caller();
        let result = self.schedule_scoped(command, None, site);
        self.flush_events();
        result
    }

    /// Schedule with an explicit parent. Forks when a slice is executing.
    pub(crate) fn schedule_scoped(
        &self,
        command: &Command,
        parent: Option<RunId>,
        site: BindingSite,
    ) -> ScheduleResult {
        let current = self.core.state.borrow().executing.last().copied();
        match current {
            Some(current) => {
                // A failing first slice is recorded and surfaces from run().
                self.fork_run(parent.or(Some(current)), command, site)
                    .unwrap_or(ScheduleResult::Success)
            }
            None => self.enqueue(parent, command, site),
        }
    }

    /// Cancel `command`.
    ///
    /// A queued command is discarded without running its cancel hooks. A
    /// mounted command is removed together with all of its descendants,
    /// firing each one's hooks parents first. Canceling the command whose
    /// slice is executing is an error; that command is then torn down as if
    /// its body had failed.
    #[must_use = "a cancel error means the command was not canceled cleanly"]
    pub fn cancel(&self, command: &Command) -> Result<(), SchedulerError> {
        let result = self.cancel_command(command);
        self.flush_events();
        result
    }

    /// Cancel every mounted command and clear the deck.
    ///
    /// Default commands are placed back on deck right away, so the next
    /// [`run`](Self::run) remounts them.
    pub fn cancel_all(&self) {
        self.cancel_everything();
        self.rearm_defaults();
        self.flush_events();
    }

    /// Queue a one-shot callback for the next tick.
    pub fn sideload(&self, sideload: impl FnOnce(&Coroutine) -> CommandResult + 'static) {
        self.core
            .state
            .borrow_mut()
            .sideloads
            .push(Box::new(sideload));
    }

    /// Register a callback invoked once per tick, after sideloads.
    pub fn add_periodic(&self, periodic: impl FnMut() + 'static) {
        self.core
            .state
            .borrow_mut()
            .periodics
            .push(Rc::new(RefCell::new(Box::new(periodic))));
    }

    /// Register an event listener. Listeners must not register listeners.
    pub fn add_event_listener(&self, listener: impl FnMut(&SchedulerEvent) + 'static) {
        self.core.listeners.borrow_mut().push(Box::new(listener));
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub fn is_running(&self, command: &Command) -> bool {
        self.core.state.borrow().forest.find(command).is_some()
    }

    /// On deck, not yet mounted.
    pub fn is_scheduled(&self, command: &Command) -> bool {
        self.core.state.borrow().is_queued(command)
    }

    pub fn is_scheduled_or_running(&self, command: &Command) -> bool {
        self.core.state.borrow().is_scheduled_or_running(command)
    }

    /// Mounted commands, ancestors before descendants.
    pub fn running_commands(&self) -> Vec<Command> {
        let state = self.core.state.borrow();
        state
            .forest
            .preorder()
            .into_iter()
            .filter_map(|id| state.forest.get(id))
            .map(|run| run.command.clone())
            .collect()
    }

    /// Mounted commands that require `mechanism`, ancestors before descendants.
    pub fn running_commands_for(&self, mechanism: &Mechanism) -> Vec<Command> {
        self.running_commands()
            .into_iter()
            .filter(|command| command.requires(mechanism))
            .collect()
    }

    /// On-deck commands in promotion order.
    pub fn queued_commands(&self) -> Vec<Command> {
        self.core
            .state
            .borrow()
            .queue
            .iter()
            .map(|entry| entry.command.clone())
            .collect()
    }

    /// The command that forked or owns `command`, if it is still running.
    pub fn parent_of(&self, command: &Command) -> Option<Command> {
        let state = self.core.state.borrow();
        let parent = match state.forest.find(command) {
            Some(id) => state.forest.get(id).and_then(|run| run.parent),
            None => state
                .queue
                .iter()
                .find(|entry| &entry.command == command)
                .and_then(|entry| entry.parent),
        }?;
        state.forest.get(parent).map(|run| run.command.clone())
    }

    /// Run id of the current scheduling of `command`.
    pub fn run_id(&self, command: &Command) -> Option<RunId> {
        let state = self.core.state.borrow();
        state.forest.find(command).or_else(|| {
            state
                .queue
                .iter()
                .find(|entry| &entry.command == command)
                .map(|entry| entry.id)
        })
    }

    /// The command whose slice is executing, if any.
    pub fn current_command(&self) -> Option<Command> {
        let state = self.core.state.borrow();
        let id = state.executing.last()?;
        state.forest.get(*id).map(|run| run.command.clone())
    }

    pub(crate) fn current_run(&self) -> Option<RunId> {
        self.core.state.borrow().executing.last().copied()
    }

    /// Duration of the last slice of `command` [ms].
    pub fn last_command_runtime_ms(&self, command: &Command) -> Option<f64> {
        let state = self.core.state.borrow();
        let id = state.forest.find(command)?;
        state.forest.get(id).map(|run| us_to_ms(run.last_time_us))
    }

    /// Accumulated slice time of the current run of `command` [ms].
    pub fn total_runtime_ms(&self, command: &Command) -> Option<f64> {
        let state = self.core.state.borrow();
        let id = state.forest.find(command)?;
        state.forest.get(id).map(|run| us_to_ms(run.total_time_us))
    }

    /// Duration of the last complete tick [ms]. `None` before the first tick.
    pub fn last_runtime_ms(&self) -> Option<f64> {
        self.core.state.borrow().last_tick_us.map(us_to_ms)
    }

    /// Number of ticks started so far.
    pub fn tick_count(&self) -> u64 {
        self.core.state.borrow().tick
    }

    pub(crate) fn running_ids(&self, commands: &[Command]) -> Vec<RunId> {
        let state = self.core.state.borrow();
        commands
            .iter()
            .filter_map(|command| state.forest.find(command))
            .collect()
    }

    pub(crate) fn is_run_alive(&self, id: RunId) -> bool {
        self.core.state.borrow().forest.contains(id)
    }

    pub(crate) fn set_suspension(&self, id: RunId, suspension: Suspension) {
        if let Some(run) = self.core.state.borrow_mut().forest.get_mut(id) {
            run.suspension = suspension;
        }
    }

    // ─── Events ─────────────────────────────────────────────────────

    fn emit(&self, event: SchedulerEvent) {
        self.core.state.borrow_mut().emit(event);
    }

    /// Deliver buffered events. Does nothing while a tick is in progress or
    /// when called from inside a listener.
    fn flush_events(&self) {
        loop {
            let event = {
                let mut state = self.core.state.borrow_mut();
                if state.in_tick {
                    return;
                }
                match state.events.pop_front() {
                    Some(event) => event,
                    None => return,
                }
            };
            let Ok(mut listeners) = self.core.listeners.try_borrow_mut() else {
                self.core.state.borrow_mut().events.push_front(event);
                return;
            };
            for listener in listeners.iter_mut() {
                listener(&event);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("Scheduler")
            .field("name", &self.core.name)
            .field("tick", &state.tick)
            .field("queued", &state.queue.len())
            .field("running", &state.forest.ids().len())
            .finish()
    }
}
