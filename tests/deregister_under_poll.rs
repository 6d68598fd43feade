#![cfg(unix)]

pub mod support;
use crate::support::*;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evloop::{EventLoop, EventMask, Rearm};

#[test]
fn deregister_interrupts_blocked_poll() {
    let eloop = Arc::new(EventLoop::new().unwrap());
    let (r, w) = pipe();
    let watcher = CountingFdWatcher::new(Rearm::Rearm, true);
    let id = eloop
        .register_fd(watcher.clone(), r, EventMask::readable())
        .unwrap();

    // The poller blocks in the backend; nothing ever fires for it.
    let eloop_poll = eloop.clone();
    thread::spawn(move || {
        eloop_poll.run_once();
    });
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    eloop.deregister_fd(id);
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "deregistration did not interrupt the poll"
    );

    assert_eq!(watcher.hits(), 0);
    assert_eq!(watcher.removed(), 1);

    // The handler stays silent even when the fd becomes ready later.
    write_byte(w);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(watcher.hits(), 0);
}
