//! Scheduling, preemption, failure teardown, cancellation and sideloads.

use std::cell::{Cell, OnceCell};
use std::rc::Rc;
use std::time::Duration;

use cadence_scheduler::prelude::*;

use super::common::{Counter, EventLog, Flag, expect, one_shot, park, park_on};

fn awaiting(name: &str, child: Command) -> Command {
    Command::no_requirements()
        .executing(move |co| {
            let child = child.clone();
            async move { co.await_command(&child).await }
        })
        .named(name)
}

fn awaiting_on(mechanism: &Mechanism, name: &str, child: Command) -> Command {
    mechanism
        .run(move |co| {
            let child = child.clone();
            async move { co.await_command(&child).await }
        })
        .named(name)
}

fn forking(name: &str, children: Vec<Command>) -> Command {
    Command::no_requirements()
        .executing(move |co| {
            let children = children.clone();
            async move {
                for child in &children {
                    co.fork(child)?;
                }
                Ok(())
            }
        })
        .named(name)
}

fn counting_one_shot(runs: &Counter) -> Command {
    let runs = runs.clone();
    Command::no_requirements()
        .executing(move |_co| {
            let runs = runs.clone();
            async move {
                runs.bump();
                Ok(())
            }
        })
        .named("One Shot")
}

fn hooked(mechanism: &Mechanism, name: &str, hook_ran: &Flag) -> Command {
    let hook_ran = hook_ran.clone();
    mechanism
        .run(|co| async move {
            co.yield_now().await;
            Ok(())
        })
        .when_canceled(move || hook_ran.set(true))
        .named(name)
}

// ── Basics ──────────────────────────────────────────────────────────

#[test]
fn command_runs_until_its_body_returns() {
    let scheduler = Scheduler::new();
    let enabled = Flag::default();
    let ran = Flag::default();
    let command = {
        let (enabled, ran) = (enabled.clone(), ran.clone());
        Command::no_requirements()
            .executing(move |co| {
                let (enabled, ran) = (enabled.clone(), ran.clone());
                async move {
                    loop {
                        co.yield_now().await;
                        if enabled.get() {
                            break;
                        }
                    }
                    ran.set(true);
                    Ok(())
                }
            })
            .named("Basic Command")
    };

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&command), "should be running after the first tick");

    enabled.set(true);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&command), "should have finished");
    assert!(ran.get());
}

#[test]
fn commands_interleave_on_one_thread() {
    let scheduler = Scheduler::new();
    let total = Rc::new(Cell::new(0u32));
    let commands = 100;
    let iterations = 500;

    for index in 0..commands {
        let total = total.clone();
        let command = Command::no_requirements()
            .executing(move |co| {
                let total = total.clone();
                async move {
                    for _ in 0..iterations {
                        co.yield_now().await;
                        total.set(total.get() + 1);
                    }
                    Ok(())
                }
            })
            .named(format!("CountCommand[{index}]"));
        scheduler.schedule(&command);
    }

    for _ in 0..=iterations {
        scheduler.run().unwrap();
    }
    assert_eq!(total.get(), commands * iterations);
    assert!(scheduler.running_commands().is_empty());
}

#[test]
fn mechanism_command_counts_to_ten() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Counting", &scheduler);
    let count = Counter::default();
    let count_to_ten = {
        let count = count.clone();
        mechanism
            .run(move |co| {
                let count = count.clone();
                async move {
                    for _ in 0..10 {
                        co.yield_now().await;
                        count.bump();
                    }
                    Ok(())
                }
            })
            .named("Count To Ten")
    };

    scheduler.schedule(&count_to_ten);
    for _ in 0..11 {
        scheduler.run().unwrap();
    }
    assert_eq!(count.get(), 10);
    assert!(!scheduler.is_running(&count_to_ten));
}

#[test]
fn schedule_inside_a_body_forks_a_child() {
    let scheduler = Scheduler::new();
    let child = park("Child");
    let parent = {
        let child = child.clone();
        Command::no_requirements()
            .executing(move |co| {
                let child = child.clone();
                async move {
                    let scheduler = co.scheduler().ok_or("scheduler dropped")?;
                    assert_eq!(scheduler.schedule(&child), ScheduleResult::Success);
                    co.park().await
                }
            })
            .named("Parent")
    };

    scheduler.schedule(&parent);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&child), "child should have had its first slice");
    assert_eq!(scheduler.parent_of(&child), Some(parent.clone()));
    assert_eq!(scheduler.running_commands(), vec![parent, child]);
}

// ── Priority ────────────────────────────────────────────────────────

#[test]
fn higher_priority_preempts() {
    let scheduler = Scheduler::new();
    let subsystem = Mechanism::new("Subsystem", &scheduler);
    let lower = subsystem
        .run(|co| async move { co.park().await })
        .with_priority(-1000)
        .named("Lower");
    let higher = subsystem
        .run(|co| async move { co.park().await })
        .with_priority(1000)
        .named("Higher");
    let log = EventLog::attach(&scheduler);

    scheduler.schedule(&lower);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&lower));

    assert_eq!(scheduler.schedule(&higher), ScheduleResult::Success);
    log.clear();
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&higher));
    assert!(!scheduler.is_running(&lower));
    assert_eq!(
        log.entries(),
        expect(&[
            ("mounted", "Lower"),
            ("yielded", "Lower"),
            ("interrupted", "Lower"),
            ("canceled", "Lower"),
            ("mounted", "Higher"),
            ("yielded", "Higher"),
        ])
    );
    let interrupted = log
        .events()
        .into_iter()
        .find_map(|event| match event {
            SchedulerEvent::Interrupted { interrupter, .. } => Some(interrupter),
            _ => None,
        })
        .expect("interrupted event");
    assert_eq!(interrupted, higher);
}

#[test]
fn lower_priority_is_rejected() {
    let scheduler = Scheduler::new();
    let subsystem = Mechanism::new("Subsystem", &scheduler);
    let lower = subsystem
        .run(|co| async move { co.park().await })
        .with_priority(-1000)
        .named("Lower");
    let higher = subsystem
        .run(|co| async move { co.park().await })
        .with_priority(1000)
        .named("Higher");

    scheduler.schedule(&higher);
    scheduler.run().unwrap();
    assert_eq!(
        scheduler.schedule(&lower),
        ScheduleResult::LowerPriorityThanRunningCommand
    );
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&higher));
    assert!(!scheduler.is_scheduled_or_running(&lower));
}

#[test]
fn equal_priority_does_not_preempt() {
    let scheduler = Scheduler::new();
    let subsystem = Mechanism::new("Subsystem", &scheduler);
    let first = park_on(&subsystem, "First");
    let second = park_on(&subsystem, "Second");

    scheduler.schedule(&first);
    scheduler.run().unwrap();
    assert_eq!(
        scheduler.schedule(&second),
        ScheduleResult::LowerPriorityThanRunningCommand
    );
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&first));
    assert!(!scheduler.is_running(&second));
}

#[test]
fn queued_command_blocked_at_promotion_is_discarded() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Mechanism", &scheduler);
    let hook_ran = Flag::default();
    let high = mechanism
        .run(|co| async move { co.park().await })
        .with_priority(5)
        .named("High");
    let forker = {
        let high = high.clone();
        Command::no_requirements()
            .executing(move |co| {
                let high = high.clone();
                async move {
                    co.yield_now().await;
                    co.fork(&high)?;
                    co.park().await
                }
            })
            .named("Forker")
    };
    let low = {
        let hook_ran = hook_ran.clone();
        mechanism
            .run(|co| async move { co.park().await })
            .when_canceled(move || hook_ran.set(true))
            .named("Low")
    };
    let log = EventLog::attach(&scheduler);

    scheduler.schedule(&forker);
    scheduler.run().unwrap();
    assert_eq!(scheduler.schedule(&low), ScheduleResult::Success);

    // The forker claims the mechanism at a higher priority before promotion.
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&high));
    assert!(!scheduler.is_scheduled_or_running(&low));
    assert!(!hook_ran.get(), "a command that never mounted has no hook to run");
    assert!(log.entries().contains(&("canceled", "Low".to_string())));
}

#[test]
fn interrupted_command_never_resumes() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("mechanism", &scheduler);
    let progress = Counter::default();

    let interrupter = mechanism
        .run(|_co| async { Ok(()) })
        .with_priority(2)
        .named("Interrupter");
    let interrupted = {
        let progress = progress.clone();
        mechanism
            .run(move |co| {
                let progress = progress.clone();
                async move {
                    for _ in 0..3 {
                        progress.bump();
                        co.yield_now().await;
                    }
                    Ok(())
                }
            })
            .with_priority(1)
            .named("Cancel By Default")
    };

    scheduler.schedule(&interrupted);
    scheduler.run().unwrap();
    assert_eq!(progress.get(), 1);

    // Running commands get their slice before queued commands are promoted.
    scheduler.schedule(&interrupter);
    scheduler.run().unwrap();
    assert_eq!(progress.get(), 2);
    assert!(!scheduler.is_running(&interrupted));

    scheduler.run().unwrap();
    assert_eq!(progress.get(), 2, "an interrupted command must not resume");
}

#[test]
fn default_command_returns_after_interruption() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("mechanism", &scheduler);
    let count = Counter::default();
    let default_command = {
        let count = count.clone();
        mechanism
            .run(move |co| {
                let count = count.clone();
                async move {
                    loop {
                        count.bump();
                        co.yield_now().await;
                    }
                }
            })
            .with_priority(-1)
            .named("Default Command")
    };
    let newer = mechanism.run(|_co| async { Ok(()) }).named("Newer Command");

    mechanism.set_default_command(default_command.clone()).unwrap();
    assert!(scheduler.is_scheduled(&default_command), "an unclaimed mechanism arms at once");
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&default_command));
    assert_eq!(count.get(), 1);

    scheduler.schedule(&newer);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&default_command), "default should have been interrupted");
    assert!(scheduler.is_scheduled(&default_command), "and re-armed for the next tick");
    assert_eq!(count.get(), 2);

    scheduler.run().unwrap();
    assert!(scheduler.is_running(&default_command));
    assert_eq!(count.get(), 3, "a re-armed default starts a fresh run");
}

#[test]
fn default_command_must_require_only_its_mechanism() {
    let scheduler = Scheduler::new();
    let arm = Mechanism::new("Arm", &scheduler);
    let wrist = Mechanism::new("Wrist", &scheduler);

    let both = Command::requiring([&arm, &wrist])
        .executing(|co| async move { co.park().await })
        .named("Both");
    let error = arm.set_default_command(both).unwrap_err();
    assert!(matches!(error, SchedulerError::InvalidDefaultCommand { .. }));
    assert!(arm.default_command().is_none());

    let unrelated = park_on(&wrist, "Wrist Hold");
    assert!(arm.set_default_command(unrelated).is_err());
}

#[test]
fn nested_mechanisms_fall_back_to_their_defaults() {
    let scheduler = Scheduler::new();
    let superstructure = Mechanism::new("Superstructure", &scheduler);
    let elevator = Mechanism::new("Elevator", &scheduler);
    let arm = Mechanism::new("Arm", &scheduler);
    for mechanism in [&superstructure, &elevator, &arm] {
        mechanism.set_default_command(mechanism.idle()).unwrap();
    }

    let super_command = {
        let (elevator, arm) = (elevator.clone(), arm.clone());
        superstructure
            .run(move |co| {
                let elevator_step = park_on(&elevator, "Elevator Subcommand");
                let arm_step = park_on(&arm, "Arm Subcommand");
                async move {
                    co.await_command(&elevator_step).await?;
                    co.await_command(&arm_step).await
                }
            })
            .named("Super Command")
    };

    scheduler.schedule(&super_command);
    scheduler.run().unwrap();
    assert_eq!(arm.running_commands(), vec![arm.default_command().unwrap()]);
    let elevator_names: Vec<String> = elevator
        .running_commands()
        .iter()
        .map(|command| command.name().to_string())
        .collect();
    assert_eq!(elevator_names, ["Elevator Subcommand"]);

    // Claiming an inner mechanism at a higher priority takes down the whole composition.
    let conflict = elevator
        .run(|co| async move { co.park().await })
        .with_priority(1)
        .named("Conflict");
    assert_eq!(scheduler.schedule(&conflict), ScheduleResult::Success);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&super_command));
    assert!(scheduler.is_running(&conflict));

    scheduler.run().unwrap();
    assert_eq!(
        superstructure.running_commands(),
        vec![superstructure.default_command().unwrap()]
    );
}

// ── Failures ────────────────────────────────────────────────────────

#[test]
fn failure_reports_where_the_command_was_bound() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("X", &scheduler);
    let command = mechanism
        .run(|_co| async { Err("The exception".into()) })
        .named("Bad Behavior");

    let trigger = Trigger::new(&scheduler, || true);
    let bound_at = line!() + 1;
    trigger.on_true(&command);

    let error = scheduler.run().unwrap_err();
    let failure = error.failure().expect("command failure");
    assert_eq!(failure.source_error().to_string(), "The exception");
    assert_eq!(failure.command_name(), "Bad Behavior");

    let site = failure.binding_site().expect("binding site");
    assert!(site.file().ends_with("scheduler.rs"), "site was {site}");
    assert_eq!(site.line(), bound_at);
    assert!(error.to_string().starts_with("The exception\n"));
    assert!(error.to_string().contains(BINDING_TRACE_HEADER));
    assert!(!scheduler.is_scheduled_or_running(&command));
}

#[test]
fn failure_trace_spans_triggers_and_awaits() {
    let scheduler = Scheduler::new();
    let throws = Command::no_requirements()
        .executing(|_co| async { Err("Index -1 out of bounds for length 0".into()) })
        .named("Throws");
    let with_trigger = {
        let throws = throws.clone();
        Command::no_requirements()
            .executing(move |co| {
                let throws = throws.clone();
                async move {
                    let scheduler = co.scheduler().ok_or("scheduler dropped")?;
                    Trigger::new(&scheduler, || true).on_true(&throws);
                    co.park().await
                }
            })
            .named("Schedules With Trigger")
    };
    let directly = awaiting("Schedules Directly", with_trigger.clone());

    scheduler.schedule(&directly);
    // The first tick binds the trigger; it is first sampled on the second.
    scheduler.run().unwrap();
    assert_eq!(scheduler.running_commands().len(), 2);

    let error = scheduler.run().unwrap_err();
    let failure = error.failure().expect("command failure");
    assert_eq!(
        failure.source_error().to_string(),
        "Index -1 out of bounds for length 0"
    );
    let trace: Vec<&str> = failure
        .binding_trace()
        .iter()
        .map(|frame| frame.command.as_str())
        .collect();
    assert_eq!(trace, ["Throws", "Schedules With Trigger", "Schedules Directly"]);
    assert!(
        failure
            .binding_trace()
            .iter()
            .all(|frame| frame.site.file().ends_with("scheduler.rs"))
    );
    assert!(scheduler.running_commands().is_empty());
}

#[test]
fn failing_command_cancels_its_children() {
    let scheduler = Scheduler::new();
    let child = park("Child 1");
    let command = {
        let child = child.clone();
        Command::no_requirements()
            .executing(move |co| {
                let child = child.clone();
                async move {
                    co.fork(&child)?;
                    Err("The exception".into())
                }
            })
            .named("Bad Behavior")
    };

    scheduler.schedule(&command);
    let error = scheduler.run().unwrap_err();
    assert_eq!(error.failure().unwrap().command_name(), "Bad Behavior");
    assert!(!scheduler.is_scheduled_or_running(&command));
    assert!(!scheduler.is_scheduled_or_running(&child));
}

#[test]
fn child_failing_in_its_first_slice_cancels_the_parent() {
    let scheduler = Scheduler::new();
    let child = Command::no_requirements()
        .executing(|_co| async { Err("The exception".into()) })
        .named("Child 1");
    let parent = {
        let child = child.clone();
        Command::no_requirements()
            .executing(move |co| {
                let child = child.clone();
                async move {
                    co.await_command(&child).await?;
                    co.park().await
                }
            })
            .named("Parent")
    };

    scheduler.schedule(&parent);
    let error = scheduler.run().unwrap_err();
    assert_eq!(error.failure().unwrap().command_name(), "Child 1");
    assert!(!scheduler.is_running(&parent));
    assert!(!scheduler.is_running(&child));
}

#[test]
fn child_failing_after_remount_records_full_history() {
    let scheduler = Scheduler::new();
    let log = EventLog::attach(&scheduler);
    let child = Command::no_requirements()
        .executing(|co| async move {
            co.yield_now().await;
            Err("The exception".into())
        })
        .named("Child 1");
    let parent = {
        let child = child.clone();
        Command::no_requirements()
            .executing(move |co| {
                let child = child.clone();
                async move {
                    co.await_command(&child).await?;
                    co.park().await
                }
            })
            .named("Parent")
    };

    scheduler.schedule(&parent);
    scheduler.run().unwrap();
    let error = scheduler.run().unwrap_err();
    assert!(!scheduler.is_running(&parent));
    assert!(!scheduler.is_running(&child));

    assert_eq!(
        log.entries(),
        expect(&[
            ("scheduled", "Parent"),
            ("mounted", "Parent"),
            ("scheduled", "Child 1"),
            ("mounted", "Child 1"),
            ("yielded", "Child 1"),
            ("yielded", "Parent"),
            ("mounted", "Child 1"),
            ("completed_with_error", "Child 1"),
            ("canceled", "Parent"),
        ])
    );
    let reported = log
        .events()
        .into_iter()
        .find_map(|event| match event {
            SchedulerEvent::CompletedWithError { failure, .. } => Some(failure),
            _ => None,
        })
        .expect("completed with error");
    assert!(std::ptr::eq(&*reported, error.failure().unwrap()));
}

#[test]
fn failure_fires_hooks_of_every_other_command_in_the_component() {
    let scheduler = Scheduler::new();
    let parent_hook = Flag::default();
    let child_hook = Flag::default();
    let child = {
        let child_hook = child_hook.clone();
        Command::no_requirements()
            .executing(|co| async move {
                co.yield_now().await;
                Err("broken sensor".into())
            })
            .when_canceled(move || child_hook.set(true))
            .named("Child")
    };
    let parent = {
        let parent_hook = parent_hook.clone();
        awaiting_hooked("Parent", child, move || parent_hook.set(true))
    };

    scheduler.schedule(&parent);
    scheduler.run().unwrap();
    assert!(scheduler.run().is_err());
    assert!(parent_hook.get(), "the surviving parent is canceled with its hook");
    assert!(!child_hook.get(), "the failing command is not canceled");
}

fn awaiting_hooked(name: &str, child: Command, hook: impl Fn() + 'static) -> Command {
    Command::no_requirements()
        .executing(move |co| {
            let child = child.clone();
            async move { co.await_command(&child).await }
        })
        .when_canceled(hook)
        .named(name)
}

#[test]
fn scheduler_stays_usable_after_a_failure() {
    let scheduler = Scheduler::new();
    let failing = Command::no_requirements()
        .executing(|_co| async { Err("once".into()) })
        .named("Failing");
    let healthy = park("Healthy");

    scheduler.schedule(&failing);
    scheduler.schedule(&healthy);
    assert!(scheduler.run().is_err());
    assert!(scheduler.is_running(&healthy), "unrelated commands keep running");
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&healthy));
}

fn fails_on_second_slice(mechanism: Option<&Mechanism>, name: &str) -> Command {
    Command::requiring(mechanism)
        .executing(|co| async move {
            co.yield_now().await;
            Err("second slice".into())
        })
        .named(name)
}

#[test]
fn failure_leaves_later_commands_their_slice() {
    let scheduler = Scheduler::new();
    let slices = Counter::default();
    let failing = fails_on_second_slice(None, "Failing");
    let counting = {
        let slices = slices.clone();
        Command::no_requirements()
            .executing(move |co| {
                let slices = slices.clone();
                async move {
                    loop {
                        slices.bump();
                        co.yield_now().await;
                    }
                }
            })
            .named("Counting")
    };

    scheduler.schedule(&failing);
    scheduler.schedule(&counting);
    scheduler.run().unwrap();
    assert_eq!(slices.get(), 1);

    assert!(scheduler.run().is_err());
    assert_eq!(slices.get(), 2, "the later command still ran in the failing tick");
    assert!(!scheduler.is_scheduled_or_running(&failing));
    assert!(scheduler.is_running(&counting));
}

#[test]
fn torn_down_mechanism_rearms_its_default_in_the_failing_tick() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Arm", &scheduler);
    mechanism.set_default_command(mechanism.idle()).unwrap();
    let default_command = mechanism.default_command().unwrap();
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&default_command));

    let failing = fails_on_second_slice(Some(&mechanism), "Failing");
    scheduler.schedule(&failing);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&failing));
    assert!(!scheduler.is_scheduled_or_running(&default_command));

    assert!(scheduler.run().is_err());
    assert!(!scheduler.is_scheduled_or_running(&failing));
    assert!(scheduler.is_scheduled(&default_command), "re-armed before run() returned");

    scheduler.run().unwrap();
    assert_eq!(mechanism.running_commands(), vec![default_command]);
}

// ── Cancellation ────────────────────────────────────────────────────

#[test]
fn cancel_evicts_queued_commands() {
    let scheduler = Scheduler::new();
    let command = park("Command");
    scheduler.schedule(&command);
    scheduler.cancel(&command).unwrap();
    assert!(!scheduler.is_scheduled_or_running(&command));
}

#[test]
fn command_canceling_itself_is_an_error() {
    let scheduler = Scheduler::new();
    let ran_after_cancel = Flag::default();
    let command = {
        let ran_after_cancel = ran_after_cancel.clone();
        Command::no_requirements()
            .executing(move |co| {
                let ran_after_cancel = ran_after_cancel.clone();
                async move {
                    let me = co.command().cloned().ok_or("detached")?;
                    co.cancel(&me)?;
                    ran_after_cancel.set(true);
                    Ok(())
                }
            })
            .named("Command")
    };

    scheduler.schedule(&command);
    let error = scheduler.run().unwrap_err();
    assert!(matches!(error, SchedulerError::SelfCancel { .. }));
    assert_eq!(error.to_string(), "Command `Command` is mounted and cannot be canceled");
    assert!(!ran_after_cancel.get());
    assert!(!scheduler.is_scheduled_or_running(&command));
}

#[test]
fn ignored_self_cancel_still_ends_the_command() {
    let scheduler = Scheduler::new();
    let resumed = Flag::default();
    let command = {
        let resumed = resumed.clone();
        Command::no_requirements()
            .executing(move |co| {
                let resumed = resumed.clone();
                async move {
                    let me = co.command().cloned().ok_or("detached")?;
                    let _ = co.cancel(&me);
                    co.yield_now().await;
                    resumed.set(true);
                    Ok(())
                }
            })
            .named("Command")
    };

    scheduler.schedule(&command);
    let error = scheduler.run().unwrap_err();
    assert!(matches!(error, SchedulerError::SelfCancel { .. }));
    assert!(!scheduler.is_scheduled_or_running(&command));
    scheduler.run().unwrap();
    assert!(!resumed.get(), "no slice runs after a self-cancel");
}

#[test]
fn cancel_all_evicts_queued_commands() {
    let scheduler = Scheduler::new();
    let command = park("Command");
    scheduler.schedule(&command);
    scheduler.cancel_all();
    assert!(!scheduler.is_scheduled_or_running(&command));
}

#[test]
fn cancel_all_cancels_everything_running() {
    let scheduler = Scheduler::new();
    let commands: Vec<Command> = (1..=10).map(|i| park(&format!("Command {i}"))).collect();
    for command in &commands {
        scheduler.schedule(command);
    }
    scheduler.run().unwrap();
    scheduler.cancel_all();
    for command in &commands {
        assert!(!scheduler.is_running(command), "{command} was not canceled");
    }
}

#[test]
fn cancel_all_runs_hooks_only_for_mounted_commands() {
    let scheduler = Scheduler::new();
    let mounted_hook = Flag::default();
    let queued_hook = Flag::default();
    let mounted = {
        let hook = mounted_hook.clone();
        Command::no_requirements()
            .executing(|co| async move { co.park().await })
            .when_canceled(move || hook.set(true))
            .named("Mounted")
    };
    let queued = {
        let hook = queued_hook.clone();
        Command::no_requirements()
            .executing(|co| async move { co.park().await })
            .when_canceled(move || hook.set(true))
            .named("Queued")
    };

    scheduler.schedule(&mounted);
    scheduler.run().unwrap();
    scheduler.schedule(&queued);
    scheduler.cancel_all();
    assert!(mounted_hook.get());
    assert!(!queued_hook.get());
}

#[test]
fn cancel_all_rearms_defaults() {
    let scheduler = Scheduler::new();
    let mechanisms: Vec<Mechanism> = (1..=10)
        .map(|i| Mechanism::new(format!("System {i}"), &scheduler))
        .collect();
    for mechanism in &mechanisms {
        mechanism.set_default_command(mechanism.idle()).unwrap();
    }
    let command = Command::requiring(&mechanisms)
        .executing(|co| async move {
            co.yield_now().await;
            Ok(())
        })
        .named("Big Command");

    // Scheduling evicts the queued defaults.
    scheduler.schedule(&command);
    assert_eq!(scheduler.queued_commands(), vec![command.clone()]);
    scheduler.run().unwrap();

    scheduler.cancel_all();
    assert_eq!(scheduler.queued_commands().len(), mechanisms.len());
    scheduler.run().unwrap();

    assert!(!scheduler.is_running(&command));
    for mechanism in &mechanisms {
        assert_eq!(
            mechanism.running_commands(),
            vec![mechanism.default_command().unwrap()],
            "{mechanism} is not running its default command"
        );
    }
}

#[test]
fn cancel_all_queues_defaults_before_the_next_tick() {
    let scheduler = Scheduler::new();
    let mechanisms: Vec<Mechanism> = (1..=3)
        .map(|i| Mechanism::new(format!("System {i}"), &scheduler))
        .collect();
    for mechanism in &mechanisms {
        mechanism.set_default_command(mechanism.idle()).unwrap();
    }
    let defaults: Vec<Command> = mechanisms
        .iter()
        .map(|mechanism| mechanism.default_command().unwrap())
        .collect();
    let command = Command::requiring(&mechanisms)
        .executing(|co| async move { co.park().await })
        .named("Big Command");
    scheduler.schedule(&command);
    scheduler.run().unwrap();

    let log = EventLog::attach(&scheduler);
    scheduler.cancel_all();
    let mut expected = vec![("canceled", "Big Command".to_string())];
    expected.extend(defaults.iter().map(|default| ("scheduled", default.name().to_string())));
    assert_eq!(log.entries(), expected, "defaults are queued by cancel_all itself");
    for default in &defaults {
        assert!(scheduler.is_scheduled(default));
        assert!(!scheduler.is_running(default));
    }

    scheduler.run().unwrap();
    for default in &defaults {
        assert!(scheduler.is_running(default), "{default} did not start on the next tick");
    }
}

#[test]
fn cancel_removes_deeply_nested_compositions() {
    let scheduler = Scheduler::new();
    let root = awaiting(
        "Root",
        awaiting("C2", awaiting("C3", park("Park"))),
    );

    scheduler.schedule(&root);
    scheduler.run().unwrap();
    assert_eq!(scheduler.running_commands().len(), 4);

    scheduler.cancel(&root).unwrap();
    assert!(scheduler.running_commands().is_empty());
}

#[test]
fn cancel_hooks_fire_parents_first() {
    let scheduler = Scheduler::new();
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    let hooked_park = |name: &'static str| {
        let order = order.clone();
        Command::no_requirements()
            .executing(|co| async move { co.park().await })
            .when_canceled(move || order.borrow_mut().push(name))
            .named(name)
    };
    let leaf = hooked_park("Leaf");
    let middle = {
        let order = order.clone();
        Command::no_requirements()
            .executing(move |co| {
                let leaf = leaf.clone();
                async move { co.await_command(&leaf).await }
            })
            .when_canceled(move || order.borrow_mut().push("Middle"))
            .named("Middle")
    };
    let root = {
        let order = order.clone();
        Command::no_requirements()
            .executing(move |co| {
                let middle = middle.clone();
                async move { co.await_command(&middle).await }
            })
            .when_canceled(move || order.borrow_mut().push("Root"))
            .named("Root")
    };

    scheduler.schedule(&root);
    scheduler.run().unwrap();
    scheduler.cancel(&root).unwrap();
    assert_eq!(*order.borrow(), ["Root", "Middle", "Leaf"]);
}

// ── Compositions and requirements ───────────────────────────────────

#[test]
fn compositions_do_not_cancel_themselves() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let group = awaiting_on(
        &mechanism,
        "Group",
        awaiting_on(
            &mechanism,
            "C2",
            awaiting_on(&mechanism, "C3", park_on(&mechanism, "Park")),
        ),
    );

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    assert_eq!(scheduler.running_commands().len(), 4);
    assert!(scheduler.is_running(&group));
}

#[test]
fn equal_priority_sibling_cannot_take_a_requirement() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let second_result = Rc::new(Cell::new(None));
    let group = {
        let first = park_on(&mechanism, "First Child");
        let second = park_on(&mechanism, "Second Child");
        let second_result = second_result.clone();
        mechanism
            .run(move |co| {
                let (first, second) = (first.clone(), second.clone());
                let second_result = second_result.clone();
                async move {
                    co.fork(&first)?;
                    second_result.set(Some(co.fork(&second)?));
                    co.park().await
                }
            })
            .named("Group")
    };

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    let names: Vec<String> = scheduler
        .running_commands()
        .iter()
        .map(|command| command.name().to_string())
        .collect();
    assert_eq!(names, ["Group", "First Child"]);
    assert_eq!(
        second_result.get(),
        Some(ScheduleResult::LowerPriorityThanRunningCommand)
    );
}

#[test]
fn compositions_do_not_need_requirements() {
    let scheduler = Scheduler::new();
    let m1 = Mechanism::new("M1", &scheduler);
    let m2 = Mechanism::new("M2", &scheduler);
    let children = vec![park_on(&m1, "M1 Command"), park_on(&m2, "M2 Command")];
    let group = Command::no_requirements()
        .executing(move |co| {
            let children = children.clone();
            async move { co.await_all(&children).await }
        })
        .named("Composition");

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    assert_eq!(scheduler.running_commands().len(), 3);
}

#[test]
fn awaiting_conflicting_commands_together_fails() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The Mechanism", &scheduler);
    let children = vec![park_on(&mechanism, "First"), park_on(&mechanism, "Second")];
    let group = Command::no_requirements()
        .executing(move |co| {
            let children = children.clone();
            async move { co.await_all(&children).await }
        })
        .named("Group");

    scheduler.schedule(&group);
    let error = scheduler.run().unwrap_err();
    let failure = error.failure().expect("command failure");
    assert_eq!(
        failure.source_error().to_string(),
        "Commands running in parallel cannot share requirements: \
         First and Second both require The Mechanism"
    );
    assert!(matches!(
        error.downcast_failure::<SchedulerError>(),
        Some(SchedulerError::Conflicts(_))
    ));
}

#[test]
fn child_conflicting_with_higher_priority_top_level_is_rejected() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("mechanism", &scheduler);
    let top = mechanism
        .run(|co| async move { co.park().await })
        .with_priority(10)
        .named("Top");
    let child = park_on(&mechanism, "Child");
    let parent = awaiting("Parent", child.clone());

    scheduler.schedule(&top);
    scheduler.schedule(&parent);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&top), "top should not have been interrupted");
    assert!(!scheduler.is_running(&child), "conflicting child should not have run");
    assert!(!scheduler.is_running(&parent), "parent should have finished right away");
}

#[test]
fn child_conflicting_with_lower_priority_top_level_interrupts_it() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("mechanism", &scheduler);
    let top = mechanism
        .run(|co| async move { co.park().await })
        .with_priority(-10)
        .named("Top");
    let child = park_on(&mechanism, "Child");
    let parent = awaiting("Parent", child.clone());

    scheduler.schedule(&top);
    scheduler.schedule(&parent);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&top));
    assert!(scheduler.is_running(&child));
    assert!(scheduler.is_running(&parent));
    assert_eq!(scheduler.parent_of(&child), Some(parent));
}

#[test]
fn nested_one_shot_compositions_all_run_in_one_tick() {
    let scheduler = Scheduler::new();
    let runs = Counter::default();
    let command = forking(
        "Command",
        vec![
            counting_one_shot(&runs),
            counting_one_shot(&runs),
            forking("Inner", vec![counting_one_shot(&runs)]),
            forking(
                "2",
                vec![
                    counting_one_shot(&runs),
                    forking("3", vec![counting_one_shot(&runs)]),
                ],
            ),
        ],
    );

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    assert_eq!(runs.get(), 5, "all one-shot commands should have run");
    assert!(!scheduler.is_running(&command));
}

// ── Cancel hooks ────────────────────────────────────────────────────

#[test]
fn hook_does_not_run_when_evicted_from_deck() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let ran = Flag::default();
    let command = hooked(&mechanism, "cmd", &ran);
    let interrupter = park_on(&mechanism, "Interrupter");
    let log = EventLog::attach(&scheduler);

    scheduler.schedule(&command);
    scheduler.schedule(&interrupter);
    scheduler.run().unwrap();
    assert!(!ran.get());
    assert_eq!(
        log.entries()[..4],
        expect(&[
            ("scheduled", "cmd"),
            ("interrupted", "cmd"),
            ("canceled", "cmd"),
            ("scheduled", "Interrupter"),
        ])[..]
    );
}

#[test]
fn hook_does_not_run_when_canceled_on_deck() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let ran = Flag::default();
    let command = hooked(&mechanism, "cmd", &ran);

    scheduler.schedule(&command);
    scheduler.cancel(&command).unwrap();
    scheduler.run().unwrap();
    assert!(!ran.get());
}

#[test]
fn hook_runs_when_interrupted() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let ran = Flag::default();
    let command = {
        let ran = ran.clone();
        mechanism
            .run(|co| async move { co.park().await })
            .when_canceled(move || ran.set(true))
            .named("cmd")
    };
    let interrupter = mechanism
        .run(|co| async move { co.park().await })
        .with_priority(1)
        .named("Interrupter");

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    scheduler.schedule(&interrupter);
    scheduler.run().unwrap();
    assert!(ran.get());
}

#[test]
fn hook_does_not_run_on_completion() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let ran = Flag::default();
    let command = hooked(&mechanism, "cmd", &ran);

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert!(!scheduler.is_scheduled_or_running(&command));
    assert!(!ran.get());
}

#[test]
fn hook_runs_when_canceled() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let ran = Flag::default();
    let command = hooked(&mechanism, "cmd", &ran);

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    scheduler.cancel(&command).unwrap();
    assert!(ran.get());
}

#[test]
fn hook_runs_when_the_parent_is_canceled() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("The mechanism", &scheduler);
    let ran = Flag::default();
    let command = hooked(&mechanism, "cmd", &ran);
    let group = sequence(&[command]).named("Seq");

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    scheduler.cancel(&group).unwrap();
    assert!(ran.get());
}

// ── Sideloads ───────────────────────────────────────────────────────

#[test]
fn sideload_error_surfaces_from_run() {
    let scheduler = Scheduler::new();
    scheduler.sideload(|_co| Err("Bang!".into()));

    let error = scheduler.run().unwrap_err();
    assert!(matches!(error, SchedulerError::SideloadFailed(_)));
    assert_eq!(error.to_string(), "sideload failed: Bang!");
    scheduler.run().unwrap();
}

#[test]
fn sideloads_after_a_failure_run_next_tick() {
    let scheduler = Scheduler::new();
    let ran = Flag::default();
    scheduler.sideload(|_co| Err("first".into()));
    {
        let ran = ran.clone();
        scheduler.sideload(move |_co| {
            ran.set(true);
            Ok(())
        });
    }

    assert!(scheduler.run().is_err());
    assert!(!ran.get());
    scheduler.run().unwrap();
    assert!(ran.get());
}

#[test]
fn sideload_runs_exactly_once() {
    let scheduler = Scheduler::new();
    let count = Counter::default();
    {
        let count = count.clone();
        scheduler.sideload(move |_co| {
            count.bump();
            Ok(())
        });
    }
    for _ in 0..3 {
        scheduler.run().unwrap();
    }
    assert_eq!(count.get(), 1);
}

#[test]
fn sideload_fork_outlasts_the_sideload() {
    let scheduler = Scheduler::new();
    let command = park("Command");
    {
        let command = command.clone();
        scheduler.sideload(move |co| {
            co.fork(&command)?;
            Ok(())
        });
    }
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&command));
    assert_eq!(scheduler.parent_of(&command), None, "sideload forks are top-level");
}

#[test]
fn child_escapes_its_parent_via_sideload() {
    let scheduler = Scheduler::new();
    let child = park("Child");
    let parent = {
        let child = child.clone();
        Command::no_requirements()
            .executing(move |co| {
                let child = child.clone();
                async move {
                    let scheduler = co.scheduler().ok_or("scheduler dropped")?;
                    scheduler.sideload(move |side| {
                        side.fork(&child)?;
                        Ok(())
                    });
                    Ok(())
                }
            })
            .named("Parent")
    };

    scheduler.schedule(&parent);
    scheduler.run().unwrap();
    assert!(!scheduler.is_scheduled_or_running(&parent), "parent should have exited");
    assert!(!scheduler.is_scheduled_or_running(&child), "the sideload runs next tick");

    scheduler.run().unwrap();
    assert!(scheduler.is_running(&child));
}

#[test]
fn sideload_can_cancel_a_command() {
    let scheduler = Scheduler::new();
    let command = park("Command");
    scheduler.schedule(&command);
    scheduler.run().unwrap();

    {
        let command = command.clone();
        scheduler.sideload(move |co| {
            co.cancel(&command)?;
            Ok(())
        });
    }
    assert!(scheduler.is_running(&command), "sideload should not have run yet");
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&command));
}

// ── Awaiting ────────────────────────────────────────────────────────

#[test]
fn command_awaiting_itself_stalls_harmlessly() {
    let scheduler = Scheduler::new();
    let command = Command::no_requirements()
        .executing(|co| async move {
            let me = co.command().cloned().ok_or("detached")?;
            co.await_command(&me).await
        })
        .named("Self Await");

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&command));
}

#[test]
fn mutual_await_runs_until_canceled() {
    let scheduler = Scheduler::new();
    let slot1: Rc<OnceCell<Command>> = Rc::default();
    let slot2: Rc<OnceCell<Command>> = Rc::default();
    let awaiting_slot = |name: &str, slot: &Rc<OnceCell<Command>>| {
        let slot = slot.clone();
        Command::no_requirements()
            .executing(move |co| {
                let slot = slot.clone();
                async move {
                    let target = slot.get().cloned().ok_or("unset")?;
                    co.await_command(&target).await
                }
            })
            .named(name)
    };
    let command1 = awaiting_slot("Command 1", &slot2);
    let command2 = awaiting_slot("Command 2", &slot1);
    slot1.set(command1.clone()).unwrap();
    slot2.set(command2.clone()).unwrap();

    scheduler.schedule(&command1);
    for _ in 0..2 {
        scheduler.run().unwrap();
        assert!(scheduler.is_running(&command1));
        assert!(scheduler.is_running(&command2));
    }

    scheduler.cancel(&command1).unwrap();
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&command1));
    assert!(!scheduler.is_running(&command2));
}

#[test]
fn delayed_mutual_await_resolves_when_one_side_is_canceled() {
    let scheduler = Scheduler::new();
    let slot1: Rc<OnceCell<Command>> = Rc::default();
    let slot2: Rc<OnceCell<Command>> = Rc::default();
    let (finished1, finished2) = (Flag::default(), Flag::default());
    let delayed = |name: &str, slot: &Rc<OnceCell<Command>>, finished: &Flag| {
        let (slot, finished) = (slot.clone(), finished.clone());
        Command::no_requirements()
            .executing(move |co| {
                let (slot, finished) = (slot.clone(), finished.clone());
                async move {
                    co.yield_now().await;
                    let other = slot.get().cloned().ok_or("unset")?;
                    co.await_command(&other).await?;
                    finished.set(true);
                    Ok(())
                }
            })
            .named(name)
    };
    let command1 = delayed("Command 1", &slot2, &finished1);
    let command2 = delayed("Command 2", &slot1, &finished2);
    slot1.set(command1.clone()).unwrap();
    slot2.set(command2.clone()).unwrap();

    scheduler.schedule(&command1);
    scheduler.schedule(&command2);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&command1));
    assert!(scheduler.is_running(&command2));
    assert_eq!(scheduler.parent_of(&command2), None, "awaiting a running command does not adopt it");

    scheduler.cancel(&command1).unwrap();
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&command2));
    assert!(finished2.get(), "the survivor's await resolves normally");
    assert!(!finished1.get());
}

#[test]
fn forked_child_runs_once_per_tick() {
    let scheduler = Scheduler::new();
    let runs = Counter::default();
    let inner = {
        let runs = runs.clone();
        Command::no_requirements()
            .executing(move |co| {
                let runs = runs.clone();
                async move {
                    runs.bump();
                    co.yield_now().await;
                    runs.bump();
                    co.yield_now().await;
                    Ok(())
                }
            })
            .named("Inner")
    };
    let outer = awaiting("Outer", inner);

    scheduler.schedule(&outer);
    scheduler.run().unwrap();
    assert_eq!(runs.get(), 1);
}

#[test]
fn awaited_child_finishing_is_seen_in_the_same_tick() {
    let scheduler = Scheduler::new();
    let runs = Counter::default();
    let inner = {
        let runs = runs.clone();
        Command::no_requirements()
            .executing(move |co| {
                let runs = runs.clone();
                async move {
                    runs.bump();
                    co.yield_now().await;
                    runs.bump();
                    Ok(())
                }
            })
            .named("Inner")
    };
    let outer = awaiting("Outer", inner.clone());

    scheduler.schedule(&outer);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&inner));
    assert!(scheduler.is_running(&outer));
    assert_eq!(runs.get(), 1);

    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&inner));
    assert!(!scheduler.is_running(&outer), "outer should not need an extra tick");
    assert_eq!(runs.get(), 2);
}

#[test]
fn await_any_cancels_the_losers() {
    let scheduler = Scheduler::new();
    let quick = super::common::yield_once("Quick");
    let slow = park("Slow");
    let race = {
        let children = vec![quick.clone(), slow.clone()];
        Command::no_requirements()
            .executing(move |co| {
                let children = children.clone();
                async move { co.await_any(&children).await }
            })
            .named("Race")
    };

    scheduler.schedule(&race);
    scheduler.run().unwrap();
    assert_eq!(scheduler.running_commands().len(), 3);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&race));
    assert!(!scheduler.is_running(&slow));
    assert!(!scheduler.is_running(&quick));
}

// ── Time ────────────────────────────────────────────────────────────

fn short_wait(done: &Flag) -> Command {
    let done = done.clone();
    Command::no_requirements()
        .executing(move |co| {
            let done = done.clone();
            async move {
                co.wait(Duration::from_millis(1)).await;
                done.set(true);
                Ok(())
            }
        })
        .named("Short Wait")
}

#[test]
fn short_wait_finishes_once_its_duration_has_elapsed() {
    let clock = ManualClock::new();
    let scheduler = Scheduler::with_clock(clock.clone());
    let done = Flag::default();

    scheduler.schedule(&short_wait(&done));
    scheduler.run().unwrap();
    clock.set_us(1_000_000);
    scheduler.run().unwrap();
    assert!(done.get());
}

#[test]
fn short_wait_is_checked_every_tick() {
    let clock = ManualClock::new();
    let scheduler = Scheduler::with_clock(clock.clone());
    let done = Flag::default();

    scheduler.schedule(&short_wait(&done));
    scheduler.run().unwrap();

    clock.set_us(500);
    scheduler.run().unwrap();
    assert!(!done.get(), "still waiting for 1 ms to elapse");

    clock.set_us(1_000);
    scheduler.run().unwrap();
    assert!(done.get());
}

#[test]
fn wait_until_samples_once_per_tick() {
    let scheduler = Scheduler::new();
    let ready = Flag::default();
    let samples = Counter::default();
    let command = {
        let (ready, samples) = (ready.clone(), samples.clone());
        Command::no_requirements()
            .executing(move |co| {
                let (ready, samples) = (ready.clone(), samples.clone());
                async move {
                    co.wait_until(move || {
                        samples.bump();
                        ready.get()
                    })
                    .await;
                    Ok(())
                }
            })
            .named("Waiter")
    };

    scheduler.schedule(&command);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert_eq!(samples.get(), 2);
    ready.set(true);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&command));
    assert_eq!(samples.get(), 3);
}

#[test]
fn unrelated_one_shot_does_not_disturb_running_commands() {
    let scheduler = Scheduler::new();
    let holder = park("Holder");
    scheduler.schedule(&holder);
    scheduler.run().unwrap();
    scheduler.schedule(&one_shot("Blip"));
    scheduler.run().unwrap();
    assert_eq!(scheduler.running_commands(), vec![holder]);
}
