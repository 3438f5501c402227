use std::rc::Rc;

use crate::command::Command;

use super::{ParallelGroupBuilder, composite, join_names};

/// Builds a command that runs its children to completion, in order.
#[derive(Debug, Clone, Default)]
pub struct SequentialGroupBuilder {
    commands: Vec<Command>,
}

impl SequentialGroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn and_then(mut self, command: &Command) -> Self {
        self.commands.push(command.clone());
        self
    }

    pub fn and_then_all(mut self, commands: &[Command]) -> Self {
        self.commands.extend_from_slice(commands);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Race the sequence against `condition`.
    pub fn until(self, condition: impl Fn() -> bool + 'static) -> ParallelGroupBuilder {
        let sequence = self.with_automatic_name();
        ParallelGroupBuilder::new()
            .with_optional(&[sequence])
            .until(condition)
    }

    pub fn named(self, name: impl Into<String>) -> Command {
        let steps: Rc<[Command]> = self.commands.into();
        composite(steps.iter())
            .executing(move |co| {
                let steps = steps.clone();
                async move {
                    for step in steps.iter() {
                        co.await_command(step).await?;
                    }
                    Ok(())
                }
            })
            .named(name)
    }

    /// Name the group `A -> B -> C`.
    pub fn with_automatic_name(self) -> Command {
        let name = join_names(&self.commands, " -> ");
        self.named(name)
    }
}
