//! User/process table (part of C1): one slot per attached process,
//! consulted by the admin CLI's show/kill/recover subcommands and by the
//! recovery path described in spec.md §4.1.
//!
//! Liveness is checked with `kill(pid, 0)`, the same zero-signal existence
//! probe the original's recovery walk uses; no signal is actually sent.

use crate::types::UserId;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct UserEntry {
    pub user_id: UserId,
    pub pid: i32,
    pub login: String,
    pub files_open: Vec<crate::types::FileId>,
}

#[derive(Default)]
pub struct UserTable {
    slots: HashMap<UserId, UserEntry>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, user_id: UserId, pid: i32, login: impl Into<String>) {
        self.slots.insert(
            user_id,
            UserEntry {
                user_id,
                pid,
                login: login.into(),
                files_open: Vec::new(),
            },
        );
    }

    pub fn detach(&mut self, user_id: UserId) {
        self.slots.remove(&user_id);
    }

    pub fn by_id(&self, user_id: UserId) -> Option<&UserEntry> {
        self.slots.get(&user_id)
    }

    pub fn by_login(&self, login: &str) -> Option<&UserEntry> {
        self.slots.values().find(|e| e.login == login)
    }

    pub fn list(&self) -> impl Iterator<Item = &UserEntry> {
        self.slots.values()
    }

    /// True if the OS process backing this slot still exists.
    fn process_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    /// Walks the table, releasing locks and detaching every slot whose
    /// process has vanished. `release` is called once per vanished user
    /// so the caller can drop its group/record/file-table locks before
    /// the slot itself is cleared.
    pub fn recover_vanished(&mut self, mut release: impl FnMut(&UserEntry)) -> Vec<UserId> {
        let vanished: Vec<UserId> = self
            .slots
            .values()
            .filter(|e| !Self::process_alive(e.pid))
            .map(|e| e.user_id)
            .collect();
        for &uid in &vanished {
            if let Some(entry) = self.slots.get(&uid) {
                release(entry);
            }
            self.slots.remove(&uid);
        }
        vanished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_vanished_skips_live_process() {
        let mut table = UserTable::new();
        table.attach(1, std::process::id() as i32, "alice");
        let mut released = Vec::new();
        let vanished = table.recover_vanished(|e| released.push(e.user_id));
        assert!(vanished.is_empty());
        assert!(released.is_empty());
        assert!(table.by_id(1).is_some());
    }

    #[test]
    fn recover_vanished_detaches_dead_pid() {
        let mut table = UserTable::new();
        // PID 1 belongs to init in any real container/host and is never
        // this test process, but a fixed unlikely-to-exist high pid keeps
        // the test from depending on container specifics.
        table.attach(2, 999_999, "bob");
        let mut released = Vec::new();
        let vanished = table.recover_vanished(|e| released.push(e.user_id));
        assert_eq!(vanished, vec![2]);
        assert_eq!(released, vec![2]);
        assert!(table.by_id(2).is_none());
    }
}
