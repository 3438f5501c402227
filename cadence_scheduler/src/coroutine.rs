//! Execution context handed to command bodies.
//!
//! A body is an `async` block polled once per tick. The only suspension
//! points are the futures returned here: [`Coroutine::yield_now`],
//! [`park`](Coroutine::park), [`wait`](Coroutine::wait),
//! [`wait_until`](Coroutine::wait_until) and the await family. Everything
//! between two suspension points runs synchronously within one slice.
//!
//! ```rust
//! use cadence_scheduler::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let arm = Mechanism::new("Arm", &scheduler);
//! let raise = arm.run(|co| async move { co.yield_now().await; Ok(()) }).named("Raise");
//! let score = Command::no_requirements()
//!     .executing(move |co| {
//!         let raise = raise.clone();
//!         async move {
//!             co.await_command(&raise).await?;
//!             Ok(())
//!         }
//!     })
//!     .named("Score");
//! scheduler.schedule(&score);
//! scheduler.run().unwrap();
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::clock::duration_to_us;
use crate::command::Command;
use crate::conflict::ensure_no_conflicts;
use crate::error::{BindingSite, CommandResult, SchedulerError};
use crate::scheduler::{RunId, ScheduleResult, Scheduler, SchedulerCore, Suspension};

/// Handle a command body uses to talk to its scheduler.
///
/// Sideload callbacks get a detached coroutine that belongs to no command;
/// commands it forks are top-level.
#[derive(Clone)]
pub struct Coroutine {
    core: Weak<SchedulerCore>,
    run: Option<(RunId, Command)>,
}

impl Coroutine {
    pub(crate) fn attached(core: Weak<SchedulerCore>, id: RunId, command: Command) -> Self {
        Self {
            core,
            run: Some((id, command)),
        }
    }

    pub(crate) fn detached(core: Weak<SchedulerCore>) -> Self {
        Self { core, run: None }
    }

    /// The scheduler, if it still exists.
    pub fn scheduler(&self) -> Option<Scheduler> {
        Scheduler::upgrade(&self.core)
    }

    /// The command this coroutine runs. `None` for sideloads.
    pub fn command(&self) -> Option<&Command> {
        self.run.as_ref().map(|(_, command)| command)
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run.as_ref().map(|(id, _)| *id)
    }

    // ─── Suspension ─────────────────────────────────────────────────

    /// Suspend until the next tick.
    pub fn yield_now(&self) -> Suspend<'_> {
        Suspend {
            co: self,
            awaiting: Vec::new(),
            polled: false,
        }
    }

    /// Suspend forever. The command only ends by cancellation.
    pub async fn park(&self) -> CommandResult {
        loop {
            self.yield_now().await;
        }
    }

    /// Suspend until at least `duration` has elapsed on the scheduler clock.
    ///
    /// Checked once per tick, so the wait may overshoot by up to one period.
    pub async fn wait(&self, duration: Duration) {
        let Some(start) = self.now_us() else {
            return;
        };
        let deadline = start.saturating_add(duration_to_us(duration));
        loop {
            self.yield_now().await;
            if self.now_us().is_none_or(|now| now >= deadline) {
                return;
            }
        }
    }

    /// Suspend until `condition` holds, sampled once per tick.
    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        while !condition() {
            self.yield_now().await;
        }
    }

    fn now_us(&self) -> Option<u64> {
        self.scheduler().map(|scheduler| scheduler.now_us())
    }

    // ─── Children ───────────────────────────────────────────────────

    /// Start `command` as a child and give it its first slice right away.
    ///
    /// Returns [`ScheduleResult::LowerPriorityThanRunningCommand`] when a
    /// conflicting command outside this command's lineage has equal or higher
    /// priority. Lower-priority holders are interrupted.
    #[track_caller]
    pub fn fork(&self, command: &Command) -> Result<ScheduleResult, SchedulerError> {
        self.fork_at(command, BindingSite::caller())
    }

    /// Fork every command. They must not share requirements.
    #[track_caller]
    pub fn fork_all(&self, commands: &[Command]) -> Result<(), SchedulerError> {
        let site = BindingSite::caller();
        ensure_no_conflicts(commands)?;
        for command in commands {
            self.fork_at(command, site)?;
        }
        Ok(())
    }

    /// Cancel `command`. Canceling the command this coroutine runs is an error.
    #[must_use = "a self-cancel error dooms this command; propagate it with `?`"]
    pub fn cancel(&self, command: &Command) -> Result<(), SchedulerError> {
        self.live_scheduler()?.cancel(command)
    }

    /// Fork `command` unless it is running, then wait until it stops.
    ///
    /// A child that finishes in its first slice is observed without delay.
    #[track_caller]
    pub fn await_command<'a>(
        &'a self,
        command: &'a Command,
    ) -> impl Future<Output = CommandResult> + 'a {
        let site = BindingSite::caller();
        async move {
            self.fork_at(command, site)?;
            self.suspend_on(std::slice::from_ref(command)).await;
            Ok(())
        }
    }

    /// Fork every command that is not running, then wait until none is.
    #[track_caller]
    pub fn await_all<'a>(
        &'a self,
        commands: &'a [Command],
    ) -> impl Future<Output = CommandResult> + 'a {
        let site = BindingSite::caller();
        async move {
            ensure_no_conflicts(commands).map_err(SchedulerError::from)?;
            for command in commands {
                self.fork_at(command, site)?;
            }
            self.suspend_on(commands).await;
            Ok(())
        }
    }

    /// Fork every command, wait until any one stops, then cancel the rest.
    #[track_caller]
    pub fn await_any<'a>(
        &'a self,
        commands: &'a [Command],
    ) -> impl Future<Output = CommandResult> + 'a {
        let site = BindingSite::caller();
        async move {
            ensure_no_conflicts(commands).map_err(SchedulerError::from)?;
            for command in commands {
                self.fork_at(command, site)?;
            }
            loop {
                let (running, any_stopped) = {
                    let scheduler = self.live_scheduler()?;
                    let any_stopped = commands.iter().any(|command| !scheduler.is_running(command));
                    (scheduler.running_ids(commands), any_stopped)
                };
                if any_stopped {
                    break;
                }
                self.suspend_awaiting(running).await;
            }
            for command in commands {
                if self.is_running(command) {
                    self.cancel(command)?;
                }
            }
            Ok(())
        }
    }

    // ─── Crate internals ────────────────────────────────────────────

    /// Suspend until none of `commands` is running.
    pub(crate) async fn suspend_on(&self, commands: &[Command]) {
        loop {
            let running = match self.scheduler() {
                Some(scheduler) => scheduler.running_ids(commands),
                None => return,
            };
            if running.is_empty() {
                return;
            }
            self.suspend_awaiting(running).await;
        }
    }

    /// Suspend for one tick, resuming after whichever of `commands` are running.
    pub(crate) fn yield_after(&self, commands: &[Command]) -> Suspend<'_> {
        let running = self
            .scheduler()
            .map(|scheduler| scheduler.running_ids(commands))
            .unwrap_or_default();
        self.suspend_awaiting(running)
    }

    fn suspend_awaiting(&self, running: Vec<RunId>) -> Suspend<'_> {
        Suspend {
            co: self,
            awaiting: running,
            polled: false,
        }
    }

    pub(crate) fn is_running(&self, command: &Command) -> bool {
        self.scheduler()
            .is_some_and(|scheduler| scheduler.is_running(command))
    }

    pub(crate) fn fork_at(
        &self,
        command: &Command,
        site: BindingSite,
    ) -> Result<ScheduleResult, SchedulerError> {
        let scheduler = self.live_scheduler()?;
        let result = scheduler.fork_run(self.run_id(), command, site)?;
        self.ensure_mounted(&scheduler)?;
        Ok(result)
    }

    fn live_scheduler(&self) -> Result<Scheduler, SchedulerError> {
        let scheduler = self.scheduler().ok_or_else(|| self.unmounted())?;
        self.ensure_mounted(&scheduler)?;
        Ok(scheduler)
    }

    fn ensure_mounted(&self, scheduler: &Scheduler) -> Result<(), SchedulerError> {
        match self.run_id() {
            Some(id) if !scheduler.is_run_alive(id) => Err(self.unmounted()),
            _ => Ok(()),
        }
    }

    fn unmounted(&self) -> SchedulerError {
        SchedulerError::Unmounted {
            command: self
                .command()
                .map_or_else(|| "sideload".to_string(), |command| command.name().to_string()),
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("command", &self.command().map(Command::name))
            .field("run_id", &self.run_id())
            .finish()
    }
}

/// One suspension point. Pending on the first poll, ready on the next.
#[must_use = "suspension points do nothing unless awaited"]
pub struct Suspend<'a> {
    co: &'a Coroutine,
    awaiting: Vec<RunId>,
    polled: bool,
}

impl Future for Suspend<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.polled {
            return Poll::Ready(());
        }
        this.polled = true;
        if !this.awaiting.is_empty() {
            if let (Some(id), Some(scheduler)) = (this.co.run_id(), this.co.scheduler()) {
                scheduler.set_suspension(id, Suspension::Awaiting(std::mem::take(&mut this.awaiting)));
            }
        }
        Poll::Pending
    }
}
