//! Command descriptors.
//!
//! A [`Command`] is an immutable, identity-typed description of a unit of
//! behavior: a name, a priority, the mechanisms it needs exclusively, an async
//! body and optional cancel hooks. The same descriptor may be scheduled many
//! times; each scheduling is a separate run with its own run id.
//!
//! ```rust
//! use cadence_scheduler::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let arm = Mechanism::new("Arm", &scheduler);
//! let raise = Command::requiring([&arm])
//!     .with_priority(2)
//!     .when_canceled(|| println!("arm stopped"))
//!     .executing(|co| async move {
//!         co.yield_now().await;
//!         Ok(())
//!     })
//!     .named("Raise Arm");
//! assert!(raise.requires(&arm));
//! ```

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::rc::Rc;

use cadence_common::consts::DEFAULT_PRIORITY;

use crate::coroutine::Coroutine;
use crate::error::CommandResult;
use crate::mechanism::Mechanism;

pub(crate) type CommandFuture = Pin<Box<dyn Future<Output = CommandResult>>>;
type BodyFn = dyn Fn(Coroutine) -> CommandFuture;

struct CommandInner {
    name: String,
    priority: i32,
    requirements: Vec<Mechanism>,
    body: Box<BodyFn>,
    on_cancel: Vec<Box<dyn Fn()>>,
}

/// Immutable command descriptor with reference identity.
#[derive(Clone)]
pub struct Command {
    inner: Rc<CommandInner>,
}

impl Command {
    /// Builder for a command that needs no mechanisms.
    pub fn no_requirements() -> CommandBuilder {
        CommandBuilder::default()
    }

    /// Builder for a command that needs every listed mechanism.
    pub fn requiring<'a>(mechanisms: impl IntoIterator<Item = &'a Mechanism>) -> CommandBuilder {
        CommandBuilder::default().requiring_all(mechanisms)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    /// Required mechanisms, deduplicated, in declaration order.
    pub fn requirements(&self) -> &[Mechanism] {
        &self.inner.requirements
    }

    pub fn requires(&self, mechanism: &Mechanism) -> bool {
        self.inner.requirements.contains(mechanism)
    }

    /// Whether both commands need a common mechanism. Never true for the same instance.
    pub fn conflicts_with(&self, other: &Command) -> bool {
        self != other && self.requirements().iter().any(|m| other.requires(m))
    }

    pub fn is_lower_priority_than(&self, other: &Command) -> bool {
        self.priority() < other.priority()
    }

    /// Start a fresh run of the body.
    pub(crate) fn start(&self, co: Coroutine) -> CommandFuture {
        (self.inner.body)(co)
    }

    /// Invoke cancel hooks in insertion order.
    pub(crate) fn fire_cancel_hooks(&self) {
        for hook in &self.inner.on_cancel {
            hook();
        }
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.inner.name)
            .field("priority", &self.inner.priority)
            .field("requirements", &self.inner.requirements)
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

// ─── Builder ────────────────────────────────────────────────────────

/// First builder stage: requirements, priority and hooks.
pub struct CommandBuilder {
    requirements: Vec<Mechanism>,
    priority: i32,
    on_cancel: Vec<Box<dyn Fn()>>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self {
            requirements: Vec::new(),
            priority: DEFAULT_PRIORITY,
            on_cancel: Vec::new(),
        }
    }
}

impl CommandBuilder {
    pub fn requiring(mut self, mechanism: &Mechanism) -> Self {
        if !self.requirements.contains(mechanism) {
            self.requirements.push(mechanism.clone());
        }
        self
    }

    pub fn requiring_all<'a>(mut self, mechanisms: impl IntoIterator<Item = &'a Mechanism>) -> Self {
        for mechanism in mechanisms {
            self = self.requiring(mechanism);
        }
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Hook invoked when a mounted run is canceled. Hooks run in insertion order.
    pub fn when_canceled(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_cancel.push(Box::new(hook));
        self
    }

    /// Attach the body. Each run calls `body` once with a fresh coroutine handle.
    pub fn executing<F, Fut>(self, body: F) -> NamingStage
    where
        F: Fn(Coroutine) -> Fut + 'static,
        Fut: Future<Output = CommandResult> + 'static,
    {
        NamingStage {
            builder: self,
            body: Box::new(move |co| -> CommandFuture { Box::pin(body(co)) }),
        }
    }
}

/// Second builder stage: the body is set, only a name is missing.
pub struct NamingStage {
    builder: CommandBuilder,
    body: Box<BodyFn>,
}

impl NamingStage {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.builder.priority = priority;
        self
    }

    pub fn when_canceled(mut self, hook: impl Fn() + 'static) -> Self {
        self.builder.on_cancel.push(Box::new(hook));
        self
    }

    pub fn named(self, name: impl Into<String>) -> Command {
        Command {
            inner: Rc::new(CommandInner {
                name: name.into(),
                priority: self.builder.priority,
                requirements: self.builder.requirements,
                body: self.body,
                on_cancel: self.builder.on_cancel,
            }),
        }
    }
}
