//! Requirement conflict detection.
//!
//! Pure functions over a set of commands. Pairs are reported in
//! first-appearance order and a command never conflicts with itself, even if
//! the same instance appears twice in the input.

use std::fmt;

use cadence_common::consts::CONFLICT_BANNER;
use thiserror::Error;

use crate::command::Command;
use crate::mechanism::Mechanism;

/// Two commands that share at least one mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub a: Command,
    pub b: Command,
    /// Shared mechanisms in `a`'s requirement order.
    pub shared: Vec<Mechanism>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} and {} both require ", self.a.name(), self.b.name())?;
        for (i, mechanism) in self.shared.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(mechanism.name())?;
        }
        Ok(())
    }
}

/// Aggregated report of every conflicting pair.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConflictError {
    conflicts: Vec<Conflict>,
    message: String,
}

impl ConflictError {
    fn new(conflicts: Vec<Conflict>) -> Self {
        let pairs: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
        let message = format!("{CONFLICT_BANNER}{}", pairs.join("; "));
        Self { conflicts, message }
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }
}

/// Every conflicting pair among `commands`.
pub fn find_all_conflicts(commands: &[Command]) -> Vec<Conflict> {
    let mut distinct: Vec<&Command> = Vec::with_capacity(commands.len());
    for command in commands {
        if !distinct.contains(&command) {
            distinct.push(command);
        }
    }

    let mut conflicts = Vec::new();
    for (i, a) in distinct.iter().enumerate() {
        for b in &distinct[i + 1..] {
            let shared: Vec<Mechanism> = a
                .requirements()
                .iter()
                .filter(|m| b.requires(m))
                .cloned()
                .collect();
            if !shared.is_empty() {
                conflicts.push(Conflict {
                    a: (*a).clone(),
                    b: (*b).clone(),
                    shared,
                });
            }
        }
    }
    conflicts
}

/// Fail with a single aggregated error if any two commands conflict.
pub fn ensure_no_conflicts(commands: &[Command]) -> Result<(), ConflictError> {
    let conflicts = find_all_conflicts(commands);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(ConflictError::new(conflicts))
    }
}
