//! Sequential and parallel compositions running under the scheduler.

use cadence_scheduler::prelude::*;

use super::common::{Flag, park, park_on, yield_once};

fn hooked_park(name: &str, hook_ran: &Flag) -> Command {
    let hook_ran = hook_ran.clone();
    Command::no_requirements()
        .executing(|co| async move { co.park().await })
        .when_canceled(move || hook_ran.set(true))
        .named(name)
}

#[test]
fn group_inherits_child_requirements_and_displaces_defaults() {
    let scheduler = Scheduler::new();
    let elevator = Mechanism::new("Elevator", &scheduler);
    let arm = Mechanism::new("Arm", &scheduler);
    for mechanism in [&elevator, &arm] {
        mechanism.set_default_command(mechanism.idle()).unwrap();
    }
    scheduler.run().unwrap();

    let raise = elevator
        .run(|co| async move {
            co.yield_now().await;
            Ok(())
        })
        .named("Raise");
    let swing = arm
        .run(|co| async move {
            co.yield_now().await;
            Ok(())
        })
        .named("Swing");
    let score = sequence(&[raise.clone(), swing.clone()]).with_automatic_name();
    assert_eq!(score.name(), "Raise -> Swing");
    assert!(score.requires(&elevator) && score.requires(&arm));

    assert_eq!(scheduler.schedule(&score), ScheduleResult::Success);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&raise));
    assert_eq!(scheduler.parent_of(&raise), Some(score.clone()));
    assert_eq!(
        arm.running_commands(),
        vec![score.clone()],
        "the group holds the arm while it raises"
    );

    scheduler.run().unwrap();
    assert!(scheduler.is_running(&swing));
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&score));

    scheduler.run().unwrap();
    assert_eq!(elevator.running_commands(), vec![elevator.default_command().unwrap()]);
    assert_eq!(arm.running_commands(), vec![arm.default_command().unwrap()]);
}

#[test]
fn nested_groups_build_readable_names() {
    let (a, b, c, x) = (park("A"), park("B"), park("C"), park("X"));
    let inner = sequence(&[a, b]).with_automatic_name();
    let group = parallel(&[inner, c])
        .with_optional(&[x])
        .with_automatic_name()
        .unwrap();
    assert_eq!(group.name(), "[(A -> B & C) * (X)]");
}

#[test]
fn parallel_group_runs_children_side_by_side() {
    let scheduler = Scheduler::new();
    let left = yield_once("Left");
    let right = yield_once("Right");
    let group = parallel(&[left.clone(), right.clone()]).named("Both").unwrap();

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&left));
    assert!(scheduler.is_running(&right));
    assert_eq!(scheduler.running_commands().len(), 3);

    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&group), "group finishes with its last child");
}

#[test]
fn optional_children_are_canceled_when_required_ones_finish() {
    let scheduler = Scheduler::new();
    let hook_ran = Flag::default();
    let required = yield_once("Required");
    let optional = hooked_park("Optional", &hook_ran);
    let group = ParallelGroupBuilder::new()
        .with_required(&[required])
        .with_optional(&[optional.clone()])
        .named("Deadline")
        .unwrap();

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&group));
    assert!(!scheduler.is_running(&optional));
    assert!(hook_ran.get());
}

#[test]
fn race_ends_with_its_quickest_child() {
    let scheduler = Scheduler::new();
    let quick = yield_once("Quick");
    let slow = park("Slow");
    let group = race(&[slow.clone(), quick]).with_automatic_name().unwrap();
    assert_eq!(group.name(), "(Slow | Quick)");

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&group));
    assert!(!scheduler.is_running(&slow));
}

#[test]
fn sequence_until_cancels_the_running_step() {
    let scheduler = Scheduler::new();
    let stop = Flag::default();
    let hook_ran = Flag::default();
    let first = yield_once("First");
    let second = hooked_park("Second", &hook_ran);
    let group = sequence(&[first, second.clone()])
        .until(stop.reader())
        .named("Until Stopped")
        .unwrap();

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    scheduler.run().unwrap();
    assert!(scheduler.is_running(&second));

    stop.set(true);
    scheduler.run().unwrap();
    assert!(!scheduler.is_running(&group));
    assert!(!scheduler.is_running(&second));
    assert!(hook_ran.get());
}

#[test]
fn canceling_a_group_cancels_every_child() {
    let scheduler = Scheduler::new();
    let (left_hook, right_hook) = (Flag::default(), Flag::default());
    let left = hooked_park("Left", &left_hook);
    let right = hooked_park("Right", &right_hook);
    let group = parallel(&[left.clone(), right.clone()]).named("Pair").unwrap();

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    scheduler.cancel(&group).unwrap();
    assert!(scheduler.running_commands().is_empty());
    assert!(left_hook.get() && right_hook.get());
}

#[test]
fn child_failure_tears_down_the_group() {
    let scheduler = Scheduler::new();
    let sibling_hook = Flag::default();
    let sibling = hooked_park("Sibling", &sibling_hook);
    let failing = Command::no_requirements()
        .executing(|co| async move {
            co.yield_now().await;
            Err("jammed".into())
        })
        .named("Failing");
    let group = parallel(&[sibling.clone(), failing]).named("Group").unwrap();

    scheduler.schedule(&group);
    scheduler.run().unwrap();
    let error = scheduler.run().unwrap_err();
    let failure = error.failure().expect("command failure");
    assert_eq!(failure.source_error().to_string(), "jammed");
    let trace: Vec<&str> = failure
        .binding_trace()
        .iter()
        .map(|frame| frame.command.as_str())
        .collect();
    assert_eq!(trace, ["Failing", "Group"]);
    assert!(!scheduler.is_running(&group));
    assert!(!scheduler.is_running(&sibling));
    assert!(sibling_hook.get());
}

#[test]
fn group_is_rejected_while_a_higher_priority_command_holds_a_child_mechanism() {
    let scheduler = Scheduler::new();
    let intake = Mechanism::new("Intake", &scheduler);
    let shooter = Mechanism::new("Shooter", &scheduler);
    let holder = intake
        .run(|co| async move { co.park().await })
        .with_priority(5)
        .named("Hold Intake");
    let group = parallel(&[park_on(&intake, "Intake"), park_on(&shooter, "Shoot")])
        .named("Fire")
        .unwrap();

    scheduler.schedule(&holder);
    scheduler.run().unwrap();
    assert_eq!(
        scheduler.schedule(&group),
        ScheduleResult::LowerPriorityThanRunningCommand
    );
}

#[test]
fn parallel_children_must_not_share_mechanisms() {
    let scheduler = Scheduler::new();
    let m1 = Mechanism::new("M1", &scheduler);
    let m2 = Mechanism::new("M2", &scheduler);
    let a = Command::requiring([&m1, &m2])
        .executing(|co| async move { co.park().await })
        .named("A");
    let b = Command::requiring([&m1, &m2])
        .executing(|co| async move { co.park().await })
        .named("B");

    let error = parallel(&[a, b]).named("Bad").unwrap_err();
    assert_eq!(
        error.to_string(),
        "Commands running in parallel cannot share requirements: A and B both require M1, M2"
    );
}
