//! Child-process watch table and reaping.
//!
//! Unix offers no way to register a process with epoll; the only real
//! notification of a child exiting is SIGCHLD, and SIGCHLD is coalesced,
//! so a single delivery may stand for any number of terminations. A reap
//! pass therefore checks every watched pid with a non-blocking wait.

use std::collections::HashMap;
use std::io;

use libc::{c_int, pid_t};
use log::warn;

use crate::dispatch::WatchKey;

pub(crate) struct ChildReaper {
    children: HashMap<pid_t, WatchKey>,
    reserved: usize,
}

impl ChildReaper {
    pub(crate) fn new() -> ChildReaper {
        ChildReaper {
            children: HashMap::new(),
            reserved: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Sets aside table capacity so one subsequent `add_reserved` cannot
    /// allocate, and so cannot fail after a `fork`.
    pub(crate) fn reserve(&mut self) -> io::Result<()> {
        self.reserved += 1;
        if self.children.try_reserve(self.reserved).is_err() {
            self.reserved -= 1;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "out of memory reserving child watch",
            ));
        }
        Ok(())
    }

    pub(crate) fn add(&mut self, pid: pid_t, key: WatchKey) {
        debug_assert!(
            !self.children.contains_key(&pid),
            "child {} watched twice",
            pid
        );
        self.children.insert(pid, key);
    }

    pub(crate) fn add_reserved(&mut self, pid: pid_t, key: WatchKey) {
        debug_assert!(self.reserved > 0, "no child watch reservation held");
        self.reserved = self.reserved.saturating_sub(1);
        self.children.insert(pid, key);
    }

    pub(crate) fn remove(&mut self, pid: pid_t) -> Option<WatchKey> {
        self.children.remove(&pid)
    }

    /// Non-blocking wait on every watched pid. Terminated children are
    /// removed from the table and returned as `(pid, key, status)`. A
    /// child whose status was collected elsewhere can never report a
    /// real status; it is returned with status `-1` so its watch still
    /// fires and removes itself.
    pub(crate) fn reap(&mut self) -> Vec<(pid_t, WatchKey, c_int)> {
        let mut reaped = Vec::new();
        self.children.retain(|&pid, &mut key| {
            let mut status: c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == pid {
                reaped.push((pid, key, status));
                false
            } else if rc == -1 {
                // ECHILD: someone else collected the status.
                warn!(
                    "waitpid({}) failed: {}",
                    pid,
                    io::Error::last_os_error()
                );
                reaped.push((pid, key, -1));
                false
            } else {
                true
            }
        });
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn reap_collects_exit_status() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("exit 7")
            .spawn()
            .expect("failed to spawn child");
        let pid = child.id() as pid_t;

        let mut reaper = ChildReaper::new();
        reaper.add(pid, 5);

        let mut reaped = Vec::new();
        for _ in 0..500 {
            reaped = reaper.reap();
            if !reaped.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10));
        }

        assert_eq!(reaped.len(), 1);
        let (rpid, key, status) = reaped[0];
        assert_eq!(rpid, pid);
        assert_eq!(key, 5);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 7);
        assert!(reaper.is_empty());
    }

    #[test]
    fn reap_reports_uncollectable_child() {
        let mut reaper = ChildReaper::new();
        // Pid 1 is not a child of this process, so waitpid fails with
        // ECHILD.
        reaper.add(1, 9);
        let reaped = reaper.reap();
        assert_eq!(reaped, vec![(1, 9, -1)]);
        assert!(reaper.is_empty());
    }

    #[test]
    fn reserve_then_add_reserved() {
        let mut reaper = ChildReaper::new();
        reaper.reserve().unwrap();
        reaper.add_reserved(12345, 1);
        assert!(!reaper.is_empty());
        assert_eq!(reaper.remove(12345), Some(1));
        assert_eq!(reaper.remove(12345), None);
    }
}
