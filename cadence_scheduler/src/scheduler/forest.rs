//! Run-forest arena.
//!
//! Mounted command runs live in a map keyed by [`RunId`]. Parent links are
//! ids, never references, so a cancellation cascade is a walk over ids and
//! ownership of every future stays with the scheduler.

use std::collections::BTreeMap;

use crate::command::{Command, CommandFuture};
use crate::error::{BindingSite, SchedulerError, TraceFrame};

use super::RunId;

/// Why a mounted run is not executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Suspension {
    /// Inside its slice.
    Executing,
    /// Resume on the next tick.
    Yielded,
    /// Resume after these runs have had their slice in the current tick.
    Awaiting(Vec<RunId>),
}

/// A run waiting on deck.
pub(crate) struct OnDeck {
    pub(crate) id: RunId,
    pub(crate) command: Command,
    pub(crate) parent: Option<RunId>,
    pub(crate) site: BindingSite,
}

/// A mounted run.
pub(crate) struct CommandState {
    pub(crate) id: RunId,
    pub(crate) command: Command,
    pub(crate) parent: Option<RunId>,
    pub(crate) site: BindingSite,
    /// `None` only while the run is executing its slice.
    pub(crate) future: Option<CommandFuture>,
    pub(crate) suspension: Suspension,
    pub(crate) last_slice_tick: u64,
    pub(crate) last_time_us: u64,
    pub(crate) total_time_us: u64,
    /// Set when the run canceled itself mid-slice.
    pub(crate) doomed: Option<SchedulerError>,
}

impl CommandState {
    pub(crate) fn mounted(entry: OnDeck, future: CommandFuture) -> Self {
        Self {
            id: entry.id,
            command: entry.command,
            parent: entry.parent,
            site: entry.site,
            future: Some(future),
            suspension: Suspension::Yielded,
            last_slice_tick: 0,
            last_time_us: 0,
            total_time_us: 0,
            doomed: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct RunForest {
    entries: BTreeMap<RunId, CommandState>,
}

impl RunForest {
    pub(crate) fn insert(&mut self, state: CommandState) {
        self.entries.insert(state.id, state);
    }

    pub(crate) fn get(&self, id: RunId) -> Option<&CommandState> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: RunId) -> Option<&mut CommandState> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: RunId) -> Option<CommandState> {
        self.entries.remove(&id)
    }

    pub(crate) fn contains(&self, id: RunId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All runs in run-id order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &CommandState> {
        self.entries.values()
    }

    pub(crate) fn ids(&self) -> Vec<RunId> {
        self.entries.keys().copied().collect()
    }

    /// Run id of the mounted run of `command`.
    pub(crate) fn find(&self, command: &Command) -> Option<RunId> {
        self.iter().find(|s| &s.command == command).map(|s| s.id)
    }

    /// Direct children in run-id order.
    pub(crate) fn children(&self, id: RunId) -> Vec<RunId> {
        self.iter()
            .filter(|s| s.parent == Some(id))
            .map(|s| s.id)
            .collect()
    }

    /// `id` followed by every descendant, depth-first, parents before children.
    pub(crate) fn subtree(&self, id: RunId) -> Vec<RunId> {
        let mut out = Vec::new();
        if self.contains(id) {
            self.collect_subtree(id, &mut out);
        }
        out
    }

    fn collect_subtree(&self, id: RunId, out: &mut Vec<RunId>) {
        out.push(id);
        for child in self.children(id) {
            self.collect_subtree(child, out);
        }
    }

    /// Topmost mounted ancestor of `id`.
    pub(crate) fn root_of(&self, id: RunId) -> RunId {
        let mut current = id;
        while let Some(parent) = self.get(current).and_then(|s| s.parent) {
            if !self.contains(parent) {
                break;
            }
            current = parent;
        }
        current
    }

    /// `start` and all of its mounted ancestors, innermost first.
    pub(crate) fn lineage(&self, start: Option<RunId>) -> Vec<RunId> {
        let mut out = Vec::new();
        let mut current = start;
        while let Some(id) = current {
            let Some(state) = self.get(id) else {
                break;
            };
            out.push(id);
            current = state.parent;
        }
        out
    }

    /// Highest ancestor of `id` (or `id` itself) that is not part of `lineage`.
    pub(crate) fn highest_outside(&self, id: RunId, lineage: &[RunId]) -> RunId {
        let mut current = id;
        while let Some(parent) = self.get(current).and_then(|s| s.parent) {
            if lineage.contains(&parent) || !self.contains(parent) {
                break;
            }
            current = parent;
        }
        current
    }

    /// Every run, ancestors strictly before descendants, roots in run-id order.
    pub(crate) fn preorder(&self) -> Vec<RunId> {
        let mut out = Vec::with_capacity(self.entries.len());
        let roots = self
            .iter()
            .filter(|s| s.parent.is_none_or(|p| !self.contains(p)))
            .map(|s| s.id)
            .collect::<Vec<_>>();
        for root in roots {
            self.collect_subtree(root, &mut out);
        }
        out
    }

    /// Binding sites from `id` outwards through its ancestors.
    pub(crate) fn binding_trace(&self, id: RunId) -> Vec<TraceFrame> {
        self.lineage(Some(id))
            .into_iter()
            .filter_map(|run| self.get(run))
            .map(|s| TraceFrame {
                command: s.command.name().to_string(),
                site: s.site,
            })
            .collect()
    }
}
