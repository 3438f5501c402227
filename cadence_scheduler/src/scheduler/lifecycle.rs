//! Tick phases and the run lifecycle: mount, slice, complete, fail, cancel.
//!
//! The state borrow is always released before user code runs. That covers
//! command bodies, cancel hooks, periodics, sideloads, trigger conditions
//! and listeners, as well as dropping futures.

use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, error, warn};

use crate::command::Command;
use crate::coroutine::Coroutine;
use crate::error::{BindingSite, BoxError, CommandFailure, SchedulerError};
use crate::event::SchedulerEvent;
use crate::mechanism::Mechanism;

use super::forest::{CommandState, OnDeck, Suspension};
use super::{RunId, ScheduleResult, Scheduler, SchedulerState};

/// Result of checking an incoming command against the running set.
enum Arbitration {
    /// No blocker. These roots must be interrupted first.
    Clear(Vec<RunId>),
    /// A conflicting run has equal or higher priority.
    Blocked,
}

/// Check `command` against every running command outside the lineage of `parent`.
fn arbitrate(state: &SchedulerState, command: &Command, parent: Option<RunId>) -> Arbitration {
    let lineage = state.forest.lineage(parent);
    let mut roots = Vec::new();
    for run in state.forest.iter() {
        if lineage.contains(&run.id) || !command.conflicts_with(&run.command) {
            continue;
        }
        if run.command.priority() >= command.priority() {
            return Arbitration::Blocked;
        }
        let root = state.forest.highest_outside(run.id, &lineage);
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    Arbitration::Clear(roots)
}

impl Scheduler {
    fn stamp(&self) -> u64 {
        self.core.clock.now_us()
    }

    /// Perform one tick.
    ///
    /// Returns the first error raised during the tick: a failed command body
    /// (annotated with its binding trace), a self-cancellation or a failed
    /// sideload. A failure only tears down its own run-forest component;
    /// every other command still gets its slice and the remaining phases
    /// still run, so the scheduler stays usable.
    pub fn run(&self) -> Result<(), SchedulerError> {
        let start = self.stamp();
        {
            let mut state = self.core.state.borrow_mut();
            if state.in_tick {
                return Err(SchedulerError::NestedRun);
            }
            state.in_tick = true;
            state.tick += 1;
        }

        self.run_phases();

        let failure = {
            let mut state = self.core.state.borrow_mut();
            state.in_tick = false;
            state.last_tick_us = Some(self.stamp().saturating_sub(start));
            state.failure.take()
        };
        self.flush_events();

        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn run_phases(&self) {
        self.poll_triggers();
        self.drain_sideloads();
        self.run_periodics();
        self.resume_running();
        self.promote_queued();
        self.rearm_defaults();
    }

    /// Keep the first failure of the tick.
    fn record_failure(&self, failure: SchedulerError) {
        self.core.state.borrow_mut().failure.get_or_insert(failure);
    }

    // ─── Phases ─────────────────────────────────────────────────────

    fn poll_triggers(&self) {
        let triggers = self.core.state.borrow().triggers.clone();
        for trigger in triggers {
            trigger.poll();
        }
    }

    fn drain_sideloads(&self) {
        let batch = std::mem::take(&mut self.core.state.borrow_mut().sideloads);
        let co = Coroutine::detached(self.downgrade());
        let mut pending = batch.into_iter();
        while let Some(sideload) = pending.next() {
            if let Err(source) = sideload(&co) {
                error!(error = %source, "sideload failed");
                // The rest run next tick, ahead of anything queued meanwhile.
                let mut state = self.core.state.borrow_mut();
                let queued_meanwhile = std::mem::replace(&mut state.sideloads, pending.collect());
                state.sideloads.extend(queued_meanwhile);
                drop(state);
                self.record_failure(SchedulerError::SideloadFailed(Rc::new(source)));
                return;
            }
        }
    }

    fn run_periodics(&self) {
        let periodics = self.core.state.borrow().periodics.clone();
        for periodic in periodics {
            (periodic.borrow_mut())();
        }
    }

    /// Give every mounted run one slice, in run-id order.
    ///
    /// A run awaiting commands that have not had their slice yet is deferred
    /// until they have, so an awaited child that finishes in this tick is
    /// observed by its parent in the same tick.
    fn resume_running(&self) {
        let ids = self.core.state.borrow().forest.ids();
        let mut deferred = Vec::new();
        for id in ids {
            if !self.due_for_slice(id) {
                continue;
            }
            if self.is_blocked(id) {
                deferred.push(id);
                continue;
            }
            self.resume(id);
            self.resume_unblocked(&mut deferred);
        }
        // Whatever is left waits on itself or on a cycle.
        for id in deferred {
            self.resume(id);
        }
    }

    fn resume_unblocked(&self, deferred: &mut Vec<RunId>) {
        while let Some(index) = deferred.iter().position(|&id| !self.is_blocked(id)) {
            let id = deferred.remove(index);
            self.resume(id);
        }
    }

    /// One slice in the resume phase. A failure is already recorded for
    /// `run()` and only tore down its own component.
    fn resume(&self, id: RunId) {
        if self.due_for_slice(id) {
            let _ = self.run_slice(id);
        }
    }

    fn due_for_slice(&self, id: RunId) -> bool {
        let state = self.core.state.borrow();
        state
            .forest
            .get(id)
            .is_some_and(|run| run.future.is_some() && run.last_slice_tick != state.tick)
    }

    fn is_blocked(&self, id: RunId) -> bool {
        let state = self.core.state.borrow();
        let Some(run) = state.forest.get(id) else {
            return false;
        };
        let Suspension::Awaiting(awaited) = &run.suspension else {
            return false;
        };
        awaited.iter().any(|&other| {
            other != id
                && state.forest.get(other).is_some_and(|run| {
                    run.future.is_some() && run.last_slice_tick != state.tick
                })
        })
    }

    fn promote_queued(&self) {
        // Entries queued while promoting wait for the next tick.
        let budget = self.core.state.borrow().queue.len();
        for _ in 0..budget {
            let Some(entry) = self.core.state.borrow_mut().queue.pop_front() else {
                break;
            };
            self.promote(entry);
        }
    }

    fn promote(&self, entry: OnDeck) {
        let verdict = {
            let mut state = self.core.state.borrow_mut();
            if let Some(parent) = entry.parent {
                if !state.forest.contains(parent) {
                    let timestamp_us = self.stamp();
                    state.emit(SchedulerEvent::Canceled {
                        command: entry.command,
                        timestamp_us,
                    });
                    return;
                }
            }
            arbitrate(&state, &entry.command, entry.parent)
        };
        match verdict {
            Arbitration::Blocked => {
                warn!(
                    command = entry.command.name(),
                    priority = entry.command.priority(),
                    "discarded: conflicts with a running command of equal or higher priority"
                );
                self.emit(SchedulerEvent::Canceled {
                    command: entry.command,
                    timestamp_us: self.stamp(),
                });
            }
            Arbitration::Clear(roots) => {
                for root in roots {
                    self.interrupt(root, &entry.command);
                }
                // A failing first slice is recorded for run().
                let _ = self.mount(entry);
            }
        }
    }

    pub(super) fn rearm_defaults(&self) {
        let mechanisms: Vec<Mechanism> = {
            let mut state = self.core.state.borrow_mut();
            state.mechanisms.retain(|weak| weak.strong_count() > 0);
            state.mechanisms.iter().filter_map(Mechanism::upgrade).collect()
        };
        for mechanism in &mechanisms {
            self.arm_default(mechanism);
        }
    }

    /// Queue the default command of `mechanism` if nothing claims it.
    pub(crate) fn rearm_default(&self, mechanism: &Mechanism) {
        self.arm_default(mechanism);
        self.flush_events();
    }

    fn arm_default(&self, mechanism: &Mechanism) {
        let Some((command, site)) = mechanism.default_binding() else {
            return;
        };
        let claimed = {
            let state = self.core.state.borrow();
            state.forest.iter().any(|run| run.command.requires(mechanism))
                || state.queue.iter().any(|entry| entry.command.requires(mechanism))
        };
        if !claimed {
            self.enqueue(None, &command, site);
        }
    }

    // ─── Scheduling ─────────────────────────────────────────────────

    /// Place `command` on deck.
    ///
    /// Rejected right away when a running command of equal or higher
    /// priority, or a queued command of higher priority, conflicts with it.
    /// Conflicting queued commands of lower or equal priority are replaced.
    pub(super) fn enqueue(
        &self,
        parent: Option<RunId>,
        command: &Command,
        site: BindingSite,
    ) -> ScheduleResult {
        let mut state = self.core.state.borrow_mut();
        if state.is_scheduled_or_running(command) {
            return ScheduleResult::AlreadyRunning;
        }
        if let Arbitration::Blocked = arbitrate(&state, command, parent) {
            debug!(command = command.name(), "rejected: a running command has priority");
            return ScheduleResult::LowerPriorityThanRunningCommand;
        }
        let outranked = state.queue.iter().any(|entry| {
            command.conflicts_with(&entry.command) && command.is_lower_priority_than(&entry.command)
        });
        if outranked {
            debug!(command = command.name(), "rejected: a queued command has priority");
            return ScheduleResult::LowerPriorityThanRunningCommand;
        }

        let timestamp_us = self.stamp();
        let (evicted, kept): (Vec<OnDeck>, Vec<OnDeck>) = state
            .queue
            .drain(..)
            .partition(|entry| command.conflicts_with(&entry.command));
        state.queue.extend(kept);
        for entry in evicted {
            state.emit(SchedulerEvent::Interrupted {
                command: entry.command.clone(),
                interrupter: command.clone(),
                timestamp_us,
            });
            state.emit(SchedulerEvent::Canceled {
                command: entry.command,
                timestamp_us,
            });
        }

        let id = state.allocate_run_id();
        state.emit(SchedulerEvent::Scheduled {
            command: command.clone(),
            timestamp_us,
        });
        state.queue.push_back(OnDeck {
            id,
            command: command.clone(),
            parent,
            site,
        });
        ScheduleResult::Success
    }

    /// Mount `command` as a child of `owner` and run its first slice now.
    pub(crate) fn fork_run(
        &self,
        owner: Option<RunId>,
        command: &Command,
        site: BindingSite,
    ) -> Result<ScheduleResult, SchedulerError> {
        let verdict = {
            let state = self.core.state.borrow();
            if state.is_scheduled_or_running(command) {
                return Ok(ScheduleResult::AlreadyRunning);
            }
            arbitrate(&state, command, owner)
        };
        let roots = match verdict {
            Arbitration::Blocked => {
                debug!(command = command.name(), "fork rejected: a running command has priority");
                return Ok(ScheduleResult::LowerPriorityThanRunningCommand);
            }
            Arbitration::Clear(roots) => roots,
        };
        for root in roots {
            self.interrupt(root, command);
        }

        let id = {
            let mut state = self.core.state.borrow_mut();
            let id = state.allocate_run_id();
            let timestamp_us = self.stamp();
            state.emit(SchedulerEvent::Scheduled {
                command: command.clone(),
                timestamp_us,
            });
            id
        };
        self.mount(OnDeck {
            id,
            command: command.clone(),
            parent: owner,
            site,
        })?;
        Ok(ScheduleResult::Success)
    }

    /// Insert a run into the forest and give it its first slice.
    fn mount(&self, entry: OnDeck) -> Result<(), SchedulerError> {
        let id = entry.id;
        let co = Coroutine::attached(self.downgrade(), id, entry.command.clone());
        let future = entry.command.start(co);

        let orphan = {
            let mut state = self.core.state.borrow_mut();
            match entry.parent {
                Some(parent) if !state.forest.contains(parent) => {
                    let timestamp_us = self.stamp();
                    state.emit(SchedulerEvent::Canceled {
                        command: entry.command,
                        timestamp_us,
                    });
                    Some(future)
                }
                _ => {
                    state.forest.insert(CommandState::mounted(entry, future));
                    None
                }
            }
        };
        if let Some(future) = orphan {
            drop(future);
            return Ok(());
        }
        self.run_slice(id)
    }

    /// Execute one slice of run `id`.
    ///
    /// Errs only when this run's own slice failed or canceled itself; the
    /// failure is also recorded for `run()`. A run torn down by a descendant
    /// during its slice returns `Ok`, its coroutine reports it as unmounted.
    pub(super) fn run_slice(&self, id: RunId) -> Result<(), SchedulerError> {
        let (mut future, command) = {
            let mut state = self.core.state.borrow_mut();
            let tick = state.tick;
            let Some(run) = state.forest.get_mut(id) else {
                return Ok(());
            };
            let Some(future) = run.future.take() else {
                return Ok(());
            };
            run.last_slice_tick = tick;
            run.suspension = Suspension::Executing;
            let command = run.command.clone();
            state.executing.push(id);
            let timestamp_us = self.stamp();
            state.emit(SchedulerEvent::Mounted {
                command: command.clone(),
                timestamp_us,
            });
            (future, command)
        };

        let start = self.stamp();
        let mut cx = Context::from_waker(Waker::noop());
        let poll = future.as_mut().poll(&mut cx);
        let elapsed = self.stamp().saturating_sub(start);

        let mut state = self.core.state.borrow_mut();
        if let Some(position) = state.executing.iter().rposition(|&run| run == id) {
            state.executing.truncate(position);
        }
        let Some(run) = state.forest.get_mut(id) else {
            // Canceled from inside its own slice tree.
            drop(state);
            drop(future);
            return Ok(());
        };
        run.last_time_us = elapsed;
        run.total_time_us = run.total_time_us.saturating_add(elapsed);

        if let Some(reason) = run.doomed.take() {
            drop(state);
            drop(future);
            warn!(command = command.name(), run = %id, "command canceled itself");
            self.fail_run(id, Box::new(reason.clone()));
            self.record_failure(reason.clone());
            return Err(reason);
        }

        match poll {
            Poll::Pending => {
                run.future = Some(future);
                if run.suspension == Suspension::Executing {
                    run.suspension = Suspension::Yielded;
                }
                let timestamp_us = self.stamp();
                state.emit(SchedulerEvent::Yielded {
                    command,
                    timestamp_us,
                });
                Ok(())
            }
            Poll::Ready(Ok(())) => {
                drop(state);
                drop(future);
                self.complete_run(id);
                Ok(())
            }
            Poll::Ready(Err(source)) => {
                drop(state);
                drop(future);
                match self.fail_run(id, source) {
                    Some(failure) => {
                        let error = SchedulerError::CommandFailed(failure);
                        self.record_failure(error.clone());
                        Err(error)
                    }
                    None => Ok(()),
                }
            }
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────

    /// Remove the subtrees rooted at `roots`, parents first, and evict
    /// queued commands owned by any removed run. Emits `Canceled` for each.
    fn detach(state: &mut SchedulerState, roots: &[RunId], timestamp_us: u64) -> Vec<CommandState> {
        let mut removed = Vec::new();
        for &root in roots {
            for id in state.forest.subtree(root) {
                if let Some(run) = state.forest.remove(id) {
                    state.emit(SchedulerEvent::Canceled {
                        command: run.command.clone(),
                        timestamp_us,
                    });
                    removed.push(run);
                }
            }
        }
        Self::evict_owned(state, &removed, timestamp_us);
        removed
    }

    fn evict_owned(state: &mut SchedulerState, removed: &[CommandState], timestamp_us: u64) {
        let owned = |entry: &OnDeck| {
            entry
                .parent
                .is_some_and(|parent| removed.iter().any(|run| run.id == parent))
        };
        let (evicted, kept): (Vec<OnDeck>, Vec<OnDeck>) = state.queue.drain(..).partition(owned);
        state.queue.extend(kept);
        for entry in evicted {
            state.emit(SchedulerEvent::Canceled {
                command: entry.command,
                timestamp_us,
            });
        }
    }

    /// Fire cancel hooks in order, then drop the runs.
    fn fire_hooks(removed: Vec<CommandState>) {
        for run in &removed {
            run.command.fire_cancel_hooks();
        }
        drop(removed);
    }

    /// Normal completion: remove the run and cancel children it left behind.
    fn complete_run(&self, id: RunId) {
        let (completed, orphans) = {
            let mut state = self.core.state.borrow_mut();
            let Some(run) = state.forest.remove(id) else {
                return;
            };
            let timestamp_us = self.stamp();
            state.emit(SchedulerEvent::Completed {
                command: run.command.clone(),
                timestamp_us,
            });
            let children = state.forest.children(id);
            let orphans = Self::detach(&mut state, &children, timestamp_us);
            Self::evict_owned(&mut state, std::slice::from_ref(&run), timestamp_us);
            (run, orphans)
        };
        Self::fire_hooks(orphans);
        drop(completed);
    }

    /// Tear down the whole component of a failed run.
    ///
    /// The failed run reports `CompletedWithError`; every other run in its
    /// component is canceled with hooks, parents first.
    fn fail_run(&self, id: RunId, source: BoxError) -> Option<Rc<CommandFailure>> {
        let (failure, failed, removed) = {
            let mut state = self.core.state.borrow_mut();
            if !state.forest.contains(id) {
                return None;
            }
            let trace = state.forest.binding_trace(id);
            let root = state.forest.root_of(id);
            let component = state.forest.subtree(root);
            let failed = state.forest.remove(id)?;
            let failure = Rc::new(CommandFailure::new(
                failed.command.name().to_string(),
                id,
                trace,
                source,
            ));
            let timestamp_us = self.stamp();
            state.emit(SchedulerEvent::CompletedWithError {
                command: failed.command.clone(),
                failure: failure.clone(),
                timestamp_us,
            });
            error!(
                command = failed.command.name(),
                run = %id,
                error = %failure.source_error(),
                "command failed"
            );
            let mut removed = Vec::new();
            for other in component {
                if let Some(run) = state.forest.remove(other) {
                    state.emit(SchedulerEvent::Canceled {
                        command: run.command.clone(),
                        timestamp_us,
                    });
                    removed.push(run);
                }
            }
            Self::evict_owned(&mut state, std::slice::from_ref(&failed), timestamp_us);
            Self::evict_owned(&mut state, &removed, timestamp_us);
            (failure, failed, removed)
        };
        Self::fire_hooks(removed);
        drop(failed);
        Some(failure)
    }

    /// Cancel a mounted run and its descendants.
    fn cancel_run(&self, id: RunId) {
        let removed = {
            let mut state = self.core.state.borrow_mut();
            let timestamp_us = self.stamp();
            Self::detach(&mut state, &[id], timestamp_us)
        };
        Self::fire_hooks(removed);
    }

    /// Preempt `root` in favor of `interrupter`.
    fn interrupt(&self, root: RunId, interrupter: &Command) {
        {
            let mut state = self.core.state.borrow_mut();
            let Some(run) = state.forest.get(root) else {
                return;
            };
            let command = run.command.clone();
            let timestamp_us = self.stamp();
            state.emit(SchedulerEvent::Interrupted {
                command,
                interrupter: interrupter.clone(),
                timestamp_us,
            });
        }
        self.cancel_run(root);
    }

    pub(super) fn cancel_command(&self, command: &Command) -> Result<(), SchedulerError> {
        let target = {
            let mut state = self.core.state.borrow_mut();
            match state.forest.find(command) {
                Some(id) if state.executing.last() == Some(&id) => {
                    let reason = SchedulerError::SelfCancel {
                        command: command.name().to_string(),
                    };
                    if let Some(run) = state.forest.get_mut(id) {
                        run.doomed = Some(reason.clone());
                    }
                    return Err(reason);
                }
                Some(id) => Some(id),
                None => {
                    if let Some(index) = state.queue.iter().position(|e| &e.command == command) {
                        if let Some(entry) = state.queue.remove(index) {
                            let timestamp_us = self.stamp();
                            state.emit(SchedulerEvent::Canceled {
                                command: entry.command,
                                timestamp_us,
                            });
                        }
                    }
                    None
                }
            }
        };
        if let Some(id) = target {
            self.cancel_run(id);
        }
        Ok(())
    }

    pub(super) fn cancel_everything(&self) {
        let removed = {
            let mut state = self.core.state.borrow_mut();
            let timestamp_us = self.stamp();
            let queued: Vec<OnDeck> = state.queue.drain(..).collect();
            for entry in queued {
                state.emit(SchedulerEvent::Canceled {
                    command: entry.command,
                    timestamp_us,
                });
            }
            let roots: Vec<RunId> = state
                .forest
                .preorder()
                .into_iter()
                .filter(|&id| {
                    state
                        .forest
                        .get(id)
                        .and_then(|run| run.parent)
                        .is_none_or(|parent| !state.forest.contains(parent))
                })
                .collect();
            Self::detach(&mut state, &roots, timestamp_us)
        };
        Self::fire_hooks(removed);
    }
}
