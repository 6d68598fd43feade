#![cfg(unix)]

// Runs without the test harness: the watched signal must be blocked in
// every thread of the process, and the harness spawns threads of its
// own before any test code can set a mask.

pub mod support;
use crate::support::*;

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use evloop::{block_signal, EventLoop, Rearm, SigInfo, SignalWatcher};
use libc::c_int;

struct UsrWatcher {
    hits: AtomicUsize,
    removed: AtomicUsize,
    last_pid: AtomicI32,
}

impl SignalWatcher for UsrWatcher {
    fn got_signal(&self, signo: c_int, info: &SigInfo) -> Rearm {
        assert_eq!(signo, libc::SIGUSR1);
        assert_eq!(info.signo(), libc::SIGUSR1);
        self.last_pid.store(info.sending_pid(), Ordering::SeqCst);
        let hits = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
        if hits >= 2 {
            Rearm::Remove
        } else {
            Rearm::Rearm
        }
    }

    fn watch_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn main() {
    block_signal(libc::SIGUSR1).unwrap();

    let eloop = EventLoop::new().unwrap();
    let watcher = Arc::new(UsrWatcher {
        hits: AtomicUsize::new(0),
        removed: AtomicUsize::new(0),
        last_pid: AtomicI32::new(0),
    });
    eloop
        .register_signal(watcher.clone(), libc::SIGUSR1)
        .unwrap();

    send_signal(libc::SIGUSR1);
    eloop.run_once();
    assert_eq!(watcher.hits.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.last_pid.load(Ordering::SeqCst), unsafe {
        libc::getpid()
    });
    assert_eq!(watcher.removed.load(Ordering::SeqCst), 0);

    // The handler asked for a rearm; the next raise is delivered too.
    send_signal(libc::SIGUSR1);
    eloop.run_once();
    assert_eq!(watcher.hits.load(Ordering::SeqCst), 2);
    assert_eq!(watcher.removed.load(Ordering::SeqCst), 1);

    println!("signal_watch ok");
}
