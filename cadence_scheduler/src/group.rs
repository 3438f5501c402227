//! Command compositions built from coroutine primitives.
//!
//! A group is an ordinary [`Command`] whose body forks and awaits its
//! children. It requires the union of its children's mechanisms and runs at
//! the highest child priority.

mod parallel;
mod sequence;

use cadence_common::consts::DEFAULT_PRIORITY;

use crate::command::{Command, CommandBuilder};
use crate::mechanism::Mechanism;

pub use parallel::ParallelGroupBuilder;
pub use sequence::SequentialGroupBuilder;

/// Run `commands` one after another.
pub fn sequence(commands: &[Command]) -> SequentialGroupBuilder {
    SequentialGroupBuilder::new().and_then_all(commands)
}

/// Run `commands` together until all of them have finished.
pub fn parallel(commands: &[Command]) -> ParallelGroupBuilder {
    ParallelGroupBuilder::new().with_required(commands)
}

/// Run `commands` together until any one of them has finished.
pub fn race(commands: &[Command]) -> ParallelGroupBuilder {
    ParallelGroupBuilder::new().with_optional(commands)
}

/// Builder requiring every child mechanism at the highest child priority.
fn composite<'a>(children: impl IntoIterator<Item = &'a Command>) -> CommandBuilder {
    let mut requirements: Vec<&Mechanism> = Vec::new();
    let mut priority: Option<i32> = None;
    for child in children {
        requirements.extend(child.requirements());
        priority = Some(priority.map_or(child.priority(), |p| p.max(child.priority())));
    }
    Command::requiring(requirements).with_priority(priority.unwrap_or(DEFAULT_PRIORITY))
}

fn join_names(commands: &[Command], separator: &str) -> String {
    commands
        .iter()
        .map(Command::name)
        .collect::<Vec<_>>()
        .join(separator)
}
