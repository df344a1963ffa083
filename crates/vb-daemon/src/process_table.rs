//! Master-only process table: one slot per spawned child.
//!
//! Grounded on `original_source/src/verben.c`'s `vb_processes[]` /
//! `vb_process_t` and `spawn_process`/`reap_children`. The C version
//! stores a raw function pointer plus an opaque `data` pointer so a
//! respawn can replay the exact spawn call; the Rust version stores a
//! [`ChildRole`] tag instead and lets the master match on it, which is
//! simpler and just as sufficient since there are only two roles ever
//! spawned.

use std::collections::HashMap;
use vb_core::Role;

/// What kind of child a slot represents, and therefore what to spawn
/// again into that slot when it exits and the policy says respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRole {
    Connection,
    Worker,
}

impl ChildRole {
    pub fn as_role(self) -> Role {
        match self {
            ChildRole::Connection => Role::Connection,
            ChildRole::Worker => Role::Worker,
        }
    }

    pub fn tag(self) -> &'static str {
        self.as_role().tag()
    }
}

/// Mirrors the C `respawn`/`just_spawn`/`detached` bitfield: the
/// respawn policy attached to a process-table slot (none, just-once,
/// always, detached).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnPolicy {
    None,
    JustOnce,
    Always,
    Detached,
}

#[derive(Debug, Clone)]
pub struct ProcessSlot {
    pub pid: i32,
    pub role: ChildRole,
    pub policy: RespawnPolicy,
    pub exiting: bool,
    pub exited: bool,
    pub last_status: Option<i32>,
}

/// An indexed array of child slots, keyed by slot index, plus a
/// pid → slot index lookup used by `SIGCHLD` handling.
#[derive(Debug, Default)]
pub struct ProcessTable {
    slots: Vec<ProcessSlot>,
    by_pid: HashMap<i32, usize>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_pid: HashMap::new(),
        }
    }

    /// Records a freshly spawned child into a new slot.
    pub fn insert(&mut self, pid: i32, role: ChildRole, policy: RespawnPolicy) -> usize {
        let idx = self.slots.len();
        self.slots.push(ProcessSlot {
            pid,
            role,
            policy,
            exiting: false,
            exited: false,
            last_status: None,
        });
        self.by_pid.insert(pid, idx);
        idx
    }

    /// Re-fills an existing (previously exited) slot with a respawned
    /// child's new pid, matching `spawn_process`'s `respawn >= 0` branch.
    pub fn respawn_into(&mut self, idx: usize, new_pid: i32) {
        self.by_pid.remove(&self.slots[idx].pid);
        self.slots[idx].pid = new_pid;
        self.slots[idx].exited = false;
        self.slots[idx].last_status = None;
        self.by_pid.insert(new_pid, idx);
    }

    /// Marks the slot for `pid` exited with `status`, matching
    /// `process_get_status`'s `waitpid` loop. Returns the slot index.
    pub fn mark_exited(&mut self, pid: i32, status: i32) -> Option<usize> {
        let idx = *self.by_pid.get(&pid)?;
        self.slots[idx].exited = true;
        self.slots[idx].last_status = Some(status);
        Some(idx)
    }

    pub fn mark_all_exiting(&mut self) {
        for slot in &mut self.slots {
            slot.exiting = true;
        }
    }

    pub fn slot(&self, idx: usize) -> &ProcessSlot {
        &self.slots[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ProcessSlot)> {
        self.slots.iter().enumerate().filter(|(_, s)| s.pid != -1)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ProcessSlot)> {
        self.slots.iter_mut().enumerate()
    }

    /// Slot indices that exited, aren't being deliberately torn down,
    /// and should be respawned in place.
    pub fn due_for_respawn(&self, quit: bool) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.pid != -1
                    && s.exited
                    && !s.exiting
                    && !quit
                    && matches!(s.policy, RespawnPolicy::Always)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// True while any slot still represents a live (non-exited) child.
    pub fn any_alive(&self) -> bool {
        self.slots.iter().any(|s| s.pid != -1 && !s.exited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_mark_exited_finds_slot_by_pid() {
        let mut table = ProcessTable::new();
        let idx = table.insert(1234, ChildRole::Worker, RespawnPolicy::Always);
        let found = table.mark_exited(1234, 0).unwrap();
        assert_eq!(found, idx);
        assert!(table.slot(idx).exited);
    }

    #[test]
    fn due_for_respawn_skips_exiting_and_quit() {
        let mut table = ProcessTable::new();
        table.insert(10, ChildRole::Worker, RespawnPolicy::Always);
        table.mark_exited(10, 0);
        assert_eq!(table.due_for_respawn(false), vec![0]);
        assert!(table.due_for_respawn(true).is_empty());

        table.iter_mut().for_each(|(_, s)| s.exiting = true);
        assert!(table.due_for_respawn(false).is_empty());
    }

    #[test]
    fn respawn_into_updates_pid_index() {
        let mut table = ProcessTable::new();
        let idx = table.insert(10, ChildRole::Connection, RespawnPolicy::Always);
        table.mark_exited(10, 0);
        table.respawn_into(idx, 20);
        assert_eq!(table.mark_exited(20, 0), Some(idx));
        assert!(table.slot(idx).exited);
    }

    #[test]
    fn any_alive_false_once_everything_exited() {
        let mut table = ProcessTable::new();
        table.insert(10, ChildRole::Worker, RespawnPolicy::None);
        assert!(table.any_alive());
        table.mark_exited(10, 0);
        assert!(!table.any_alive());
    }
}
