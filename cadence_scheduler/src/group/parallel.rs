use std::fmt;
use std::rc::Rc;

use crate::command::Command;
use crate::conflict::{ConflictError, ensure_no_conflicts};

use super::{composite, join_names};

/// Builds a command that runs its children side by side.
///
/// The group finishes once every required command has finished. Optional
/// commands still running at that point are canceled. Without required
/// commands the group finishes as soon as any optional command does.
#[derive(Clone, Default)]
pub struct ParallelGroupBuilder {
    required: Vec<Command>,
    optional: Vec<Command>,
    until: Option<Rc<dyn Fn() -> bool>>,
}

impl ParallelGroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required(mut self, commands: &[Command]) -> Self {
        self.required.extend_from_slice(commands);
        self
    }

    pub fn with_optional(mut self, commands: &[Command]) -> Self {
        self.optional.extend_from_slice(commands);
        self
    }

    /// Also finish the group, canceling every child, once `condition` holds.
    pub fn until(mut self, condition: impl Fn() -> bool + 'static) -> Self {
        self.until = Some(Rc::new(condition));
        self
    }

    pub fn required_commands(&self) -> &[Command] {
        &self.required
    }

    pub fn optional_commands(&self) -> &[Command] {
        &self.optional
    }

    /// Fails if any two children share a mechanism.
    pub fn named(self, name: impl Into<String>) -> Result<Command, ConflictError> {
        let Self {
            required,
            optional,
            until,
        } = self;
        let children: Rc<[Command]> = required.iter().chain(&optional).cloned().collect();
        ensure_no_conflicts(&children)?;
        let required: Rc<[Command]> = required.into();

        Ok(composite(children.iter())
            .executing(move |co| {
                let children = children.clone();
                let required = required.clone();
                let until = until.clone();
                async move {
                    for child in children.iter() {
                        co.fork(child)?;
                    }
                    loop {
                        let finished = if required.is_empty() {
                            children.is_empty() || children.iter().any(|c| !co.is_running(c))
                        } else {
                            required.iter().all(|c| !co.is_running(c))
                        };
                        if finished || until.as_ref().is_some_and(|condition| condition()) {
                            break;
                        }
                        co.yield_after(&children).await;
                    }
                    for child in children.iter() {
                        if co.is_running(child) {
                            co.cancel(child)?;
                        }
                    }
                    Ok(())
                }
            })
            .named(name))
    }

    /// Name the group `(A & B)`, `(X | Y)` or `[(A & B) * (X | Y)]`.
    pub fn with_automatic_name(self) -> Result<Command, ConflictError> {
        let name = self.automatic_name();
        self.named(name)
    }

    fn automatic_name(&self) -> String {
        let required = format!("({})", join_names(&self.required, " & "));
        let optional = format!("({})", join_names(&self.optional, " | "));
        match (self.required.is_empty(), self.optional.is_empty()) {
            (false, true) => required,
            (true, false) => optional,
            (false, false) => format!("[{required} * {optional}]"),
            (true, true) => "()".to_string(),
        }
    }
}

impl fmt::Debug for ParallelGroupBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelGroupBuilder")
            .field("required", &self.required)
            .field("optional", &self.optional)
            .field("until", &self.until.is_some())
            .finish()
    }
}
