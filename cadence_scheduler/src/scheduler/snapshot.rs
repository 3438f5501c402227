//! Telemetry snapshot of the scheduler.

use cadence_common::telemetry::{
    QueuedCommandMessage, RequirementMessage, RunningCommandMessage, SchedulerMessage,
};

use crate::clock::us_to_ms;
use crate::command::Command;

use super::Scheduler;

fn requirements(command: &Command) -> Vec<RequirementMessage> {
    command
        .requirements()
        .iter()
        .map(|mechanism| RequirementMessage {
            name: mechanism.name().to_string(),
        })
        .collect()
}

impl Scheduler {
    /// Current queue and run-forest, ancestors listed before descendants.
    ///
    /// `last_time_ms` is `-1` until the first tick has finished.
    pub fn snapshot(&self) -> SchedulerMessage {
        let state = self.core.state.borrow();
        let queued_commands = state
            .queue
            .iter()
            .map(|entry| QueuedCommandMessage {
                priority: entry.command.priority(),
                id: entry.id.get(),
                name: entry.command.name().to_string(),
                requirements: requirements(&entry.command),
            })
            .collect();
        let running_commands = state
            .forest
            .preorder()
            .into_iter()
            .filter_map(|id| state.forest.get(id))
            .map(|run| RunningCommandMessage {
                last_time_ms: us_to_ms(run.last_time_us),
                total_time_ms: us_to_ms(run.total_time_us),
                priority: run.command.priority(),
                id: run.id.get(),
                parent_id: run
                    .parent
                    .filter(|parent| state.forest.contains(*parent))
                    .map(|parent| parent.get()),
                name: run.command.name().to_string(),
                requirements: requirements(&run.command),
            })
            .collect();
        SchedulerMessage {
            last_time_ms: state.last_tick_us.map_or(-1.0, us_to_ms),
            queued_commands,
            running_commands,
        }
    }
}
