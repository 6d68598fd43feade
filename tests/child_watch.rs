#![cfg(unix)]

// Runs without the test harness: SIGCHLD must be blocked in every thread
// of the process, and the harness spawns threads of its own before any
// test code can set a mask.

use std::process::Command;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use evloop::{block_signal, ChildWatcher, EventLoop};
use libc::{c_int, pid_t};

struct ExitWatcher {
    hits: AtomicUsize,
    removed: AtomicUsize,
    status: AtomicI32,
}

impl ExitWatcher {
    fn new() -> Arc<ExitWatcher> {
        Arc::new(ExitWatcher {
            hits: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            status: AtomicI32::new(0),
        })
    }
}

impl ChildWatcher for ExitWatcher {
    fn got_term_stat(&self, _pid: pid_t, status: c_int) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.status.store(status, Ordering::SeqCst);
    }

    fn watch_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_exit(code: i32) -> pid_t {
    let child = Command::new("sh")
        .arg("-c")
        .arg(format!("exit {}", code))
        .spawn()
        .expect("failed to spawn child");
    child.id() as pid_t
}

fn main() {
    block_signal(libc::SIGCHLD).unwrap();

    let eloop = EventLoop::new().unwrap();

    // Plain registration; the watch fires once and removes itself.
    let watcher = ExitWatcher::new();
    let pid = spawn_exit(42);
    eloop.register_child(watcher.clone(), pid).unwrap();
    eloop.run_once();
    assert_eq!(watcher.hits.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.removed.load(Ordering::SeqCst), 1);
    let status = watcher.status.load(Ordering::SeqCst);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 42);

    // Reserve first, then register with the pid of the spawned child;
    // this path cannot fail.
    let watcher = ExitWatcher::new();
    eloop.reserve_child().unwrap();
    let pid = spawn_exit(3);
    eloop.register_reserved_child(watcher.clone(), pid);
    eloop.run_once();
    assert_eq!(watcher.hits.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.removed.load(Ordering::SeqCst), 1);
    let status = watcher.status.load(Ordering::SeqCst);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 3);

    println!("child_watch ok");
}
