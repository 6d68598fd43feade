#![cfg(unix)]

pub mod support;
use crate::support::*;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use evloop::{EventLoop, EventMask, FdWatcher, Rearm};

struct BlockingWatcher {
    entered: Arc<Barrier>,
    resume: Arc<Barrier>,
    hits: AtomicUsize,
    removed: AtomicUsize,
}

impl FdWatcher for BlockingWatcher {
    fn got_event(&self, _fd: RawFd, _events: EventMask) -> Rearm {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.entered.wait();
        self.resume.wait();
        Rearm::Rearm
    }

    fn watch_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn deregister_while_handler_running() {
    let eloop = Arc::new(EventLoop::new().unwrap());
    let (r, w) = pipe();
    let entered = Arc::new(Barrier::new(2));
    let resume = Arc::new(Barrier::new(2));
    let watcher = Arc::new(BlockingWatcher {
        entered: entered.clone(),
        resume: resume.clone(),
        hits: AtomicUsize::new(0),
        removed: AtomicUsize::new(0),
    });
    let id = eloop
        .register_fd(watcher.clone(), r, EventMask::readable())
        .unwrap();

    write_byte(w);

    let eloop_run = eloop.clone();
    let runner = thread::spawn(move || {
        eloop_run.run_once();
    });

    // The handler is now mid-flight; remove the watch from this thread.
    entered.wait();
    eloop.deregister_fd(id);
    assert_eq!(watcher.removed.load(Ordering::SeqCst), 0);
    resume.wait();
    runner.join().unwrap();

    // The requested removal overrides the handler's rearm return.
    assert_eq!(watcher.hits.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.removed.load(Ordering::SeqCst), 1);

    // No further invocation happens for the removed watch.
    write_byte(w);
    assert!(!eloop.turn());
    assert_eq!(watcher.hits.load(Ordering::SeqCst), 1);

    close_fd(r);
    close_fd(w);
}
