//! Finite state machines over commands.
//!
//! Each [`State`] wraps one command. The machine itself is a command with no
//! requirements whose body forks the current state's command and, after every
//! slice of it, checks the state's transitions:
//!
//! - guarded transitions (`when`) fire on the rising edge of their condition
//!   while the state command is still running. Exit callbacks run first, then
//!   the state command is canceled.
//! - completion transitions (`when_complete`, `when_complete_and`) are looked
//!   at once the state command has stopped on its own or was canceled by
//!   someone else. The first whose condition holds wins; with none, the
//!   machine exits.
//!
//! Entering a state runs its enter callbacks and then gives its command a
//! first slice in the same tick. A state may transition to itself, which
//! restarts its command.
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use cadence_scheduler::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let idle = Command::no_requirements().executing(|co| async move { co.park().await }).named("Idle");
//! let score = Command::no_requirements().executing(|co| async move { co.park().await }).named("Score");
//!
//! let machine = StateMachine::new("Superstructure");
//! let idling = machine.add_state(&idle);
//! let scoring = machine.add_state(&score);
//! machine.set_initial_state(&idling).unwrap();
//!
//! let ready = Rc::new(Cell::new(false));
//! let signal = ready.clone();
//! idling.switch_to(&scoring).unwrap().when(move || signal.get());
//!
//! scheduler.schedule(&machine.command());
//! scheduler.run().unwrap();
//! ready.set(true);
//! scheduler.run().unwrap();
//! assert!(scheduler.is_running(&score));
//! ```

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::command::Command;
use crate::coroutine::Coroutine;
use crate::error::{CommandResult, SchedulerError};

type Condition = Rc<dyn Fn() -> bool>;

struct MachineInner {
    name: String,
    states: RefCell<Vec<Rc<StateInner>>>,
    initial: RefCell<Option<Weak<StateInner>>>,
}

/// A state machine under construction, and the command that runs it.
pub struct StateMachine {
    inner: Rc<MachineInner>,
    command: OnceCell<Command>,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(MachineInner {
                name: name.into(),
                states: RefCell::new(Vec::new()),
                initial: RefCell::new(None),
            }),
            command: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a state that runs `command` while the machine is in it.
    #[must_use]
    pub fn add_state(&self, command: &Command) -> State {
        let state = Rc::new(StateInner {
            machine: Rc::downgrade(&self.inner),
            command: command.clone(),
            transitions: RefCell::new(Vec::new()),
            completions: RefCell::new(Vec::new()),
            on_enter: RefCell::new(Vec::new()),
            on_exit: RefCell::new(Vec::new()),
        });
        self.inner.states.borrow_mut().push(state.clone());
        State { inner: state }
    }

    /// Choose the state the machine starts in. A later call overrides.
    pub fn set_initial_state(&self, state: &State) -> Result<(), SchedulerError> {
        self.check_owned(state)?;
        *self.inner.initial.borrow_mut() = Some(Rc::downgrade(&state.inner));
        Ok(())
    }

    /// Transitions leaving any of `states`.
    pub fn switch_from_any(&self, states: &[State]) -> Result<TransitionTargetStage, SchedulerError> {
        for state in states {
            self.check_owned(state)?;
        }
        Ok(TransitionTargetStage {
            from: states.to_vec(),
        })
    }

    /// Transitions leaving every state added so far.
    pub fn switch_from_all(&self) -> TransitionTargetStage {
        let from = self
            .inner
            .states
            .borrow()
            .iter()
            .map(|inner| State {
                inner: inner.clone(),
            })
            .collect();
        TransitionTargetStage { from }
    }

    /// The command that runs this machine. Always the same instance.
    pub fn command(&self) -> Command {
        self.command.get_or_init(|| self.build()).clone()
    }

    pub fn into_command(self) -> Command {
        self.command()
    }

    fn check_owned(&self, state: &State) -> Result<(), SchedulerError> {
        if Weak::ptr_eq(&state.inner.machine, &Rc::downgrade(&self.inner)) {
            Ok(())
        } else {
            Err(SchedulerError::ForeignState {
                machine: self.inner.name.clone(),
                state: state.command().name().to_string(),
            })
        }
    }

    fn build(&self) -> Command {
        let machine = self.inner.clone();
        Command::no_requirements()
            .executing(move |co| run_machine(machine.clone(), co))
            .named(self.inner.name.clone())
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.inner.name)
            .field("states", &self.inner.states.borrow().len())
            .finish()
    }
}

async fn run_machine(machine: Rc<MachineInner>, co: Coroutine) -> CommandResult {
    let initial = machine
        .initial
        .borrow()
        .as_ref()
        .and_then(Weak::upgrade)
        .ok_or_else(|| SchedulerError::MissingInitialState {
            machine: machine.name.clone(),
        })?;

    let mut current = Some(State { inner: initial });
    'states: while let Some(state) = current.take() {
        let command = state.command().clone();
        state.inner.run_callbacks(&state.inner.on_enter);
        co.fork(&command)?;

        let mut yielded = false;
        while co.is_running(&command) {
            let transitions = state.inner.transitions.borrow().clone();
            for transition in transitions {
                if transition.should_fire() {
                    state.inner.run_callbacks(&state.inner.on_exit);
                    co.cancel(&command)?;
                    current = transition.target.upgrade().map(|inner| State { inner });
                    continue 'states;
                }
            }
            co.yield_after(std::slice::from_ref(&command)).await;
            yielded = true;
        }

        state.inner.run_callbacks(&state.inner.on_exit);
        current = state.inner.next_state();
        if !yielded && current.is_some() {
            co.yield_now().await;
        }
    }
    Ok(())
}

// ─── States ─────────────────────────────────────────────────────────

struct Completion {
    /// `None` completes unconditionally.
    condition: Option<Condition>,
    target: Weak<StateInner>,
}

struct StateInner {
    machine: Weak<MachineInner>,
    command: Command,
    transitions: RefCell<Vec<Rc<Transition>>>,
    completions: RefCell<Vec<Completion>>,
    on_enter: RefCell<Vec<Rc<dyn Fn()>>>,
    on_exit: RefCell<Vec<Rc<dyn Fn()>>>,
}

impl StateInner {
    fn run_callbacks(&self, callbacks: &RefCell<Vec<Rc<dyn Fn()>>>) {
        let callbacks = callbacks.borrow().clone();
        for callback in callbacks {
            callback();
        }
    }

    fn next_state(&self) -> Option<State> {
        let candidates: Vec<(Option<Condition>, Weak<StateInner>)> = self
            .completions
            .borrow()
            .iter()
            .map(|c| (c.condition.clone(), c.target.clone()))
            .collect();
        candidates
            .into_iter()
            .find(|(condition, _)| condition.as_ref().is_none_or(|condition| condition()))
            .and_then(|(_, target)| target.upgrade())
            .map(|inner| State { inner })
    }
}

/// One state of a [`StateMachine`].
#[derive(Clone)]
pub struct State {
    inner: Rc<StateInner>,
}

impl State {
    pub fn command(&self) -> &Command {
        &self.inner.command
    }

    /// Run `callback` every time the machine enters this state, before the
    /// state's command starts.
    pub fn on_enter(&self, callback: impl Fn() + 'static) -> &Self {
        self.inner.on_enter.borrow_mut().push(Rc::new(callback));
        self
    }

    /// Run `callback` every time the machine leaves this state.
    pub fn on_exit(&self, callback: impl Fn() + 'static) -> &Self {
        self.inner.on_exit.borrow_mut().push(Rc::new(callback));
        self
    }

    /// Transition from this state to `target`.
    pub fn switch_to(&self, target: &State) -> Result<TransitionBuilder, SchedulerError> {
        TransitionTargetStage {
            from: vec![self.clone()],
        }
        .to(target)
    }

    /// Transition from this state out of the machine.
    pub fn exit_state_machine(&self) -> TransitionBuilder {
        TransitionBuilder {
            from: vec![self.clone()],
            target: None,
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for State {}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.inner.command.name()).finish()
    }
}

// ─── Transitions ────────────────────────────────────────────────────

/// Fires on the rising edge of its condition.
struct Transition {
    target: Weak<StateInner>,
    condition: Condition,
    previous: Cell<bool>,
}

impl Transition {
    fn should_fire(&self) -> bool {
        let current = (self.condition)();
        let rising = current && !self.previous.get();
        self.previous.set(current);
        rising
    }
}

/// Transition source chosen, target missing.
#[must_use = "choose a target with .to() or .to_exit_state_machine()"]
pub struct TransitionTargetStage {
    from: Vec<State>,
}

impl TransitionTargetStage {
    pub fn to(self, target: &State) -> Result<TransitionBuilder, SchedulerError> {
        if let Some(foreign) = self
            .from
            .iter()
            .find(|state| !Weak::ptr_eq(&state.inner.machine, &target.inner.machine))
        {
            let machine = foreign
                .inner
                .machine
                .upgrade()
                .map(|machine| machine.name.clone())
                .unwrap_or_default();
            return Err(SchedulerError::ForeignState {
                machine,
                state: target.command().name().to_string(),
            });
        }
        Ok(TransitionBuilder {
            from: self.from,
            target: Some(target.clone()),
        })
    }

    pub fn to_exit_state_machine(self) -> TransitionBuilder {
        TransitionBuilder {
            from: self.from,
            target: None,
        }
    }
}

/// Transition source and target chosen, condition missing.
#[must_use = "choose a condition with .when(), .when_complete() or .when_complete_and()"]
pub struct TransitionBuilder {
    from: Vec<State>,
    target: Option<State>,
}

impl TransitionBuilder {
    fn target(&self) -> Weak<StateInner> {
        self.target
            .as_ref()
            .map_or_else(Weak::new, |state| Rc::downgrade(&state.inner))
    }

    /// Leave while the state command is running, on the rising edge of
    /// `condition`. One edge detector is shared by every source state.
    pub fn when(self, condition: impl Fn() -> bool + 'static) {
        let transition = Rc::new(Transition {
            target: self.target(),
            condition: Rc::new(condition),
            previous: Cell::new(false),
        });
        for state in &self.from {
            state.inner.transitions.borrow_mut().push(transition.clone());
        }
    }

    /// Leave once the state command has stopped.
    ///
    /// Leaving to the machine's exit is already the fallback, so that case
    /// adds nothing. Repeating it for the same source replaces the previous
    /// unconditional target.
    pub fn when_complete(self) {
        if self.target.is_none() {
            return;
        }
        let target = self.target();
        for state in &self.from {
            let mut completions = state.inner.completions.borrow_mut();
            match completions.iter_mut().find(|c| c.condition.is_none()) {
                Some(existing) => existing.target = target.clone(),
                None => completions.push(Completion {
                    condition: None,
                    target: target.clone(),
                }),
            }
        }
    }

    /// Leave once the state command has stopped and `condition` holds.
    pub fn when_complete_and(self, condition: impl Fn() -> bool + 'static) {
        let target = self.target();
        let condition: Condition = Rc::new(condition);
        for state in &self.from {
            state.inner.completions.borrow_mut().push(Completion {
                condition: Some(condition.clone()),
                target: target.clone(),
            });
        }
    }
}
