#![cfg(unix)]
#![allow(dead_code)]

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evloop::{EventMask, FdWatcher, Rearm};
use libc::c_int;

pub fn send_signal(signal: c_int) {
    unsafe {
        assert_eq!(libc::kill(libc::getpid(), signal), 0);
    }
}

pub fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as c_int; 2];
    unsafe {
        assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC), 0);
    }
    (fds[0], fds[1])
}

pub fn write_byte(fd: RawFd) {
    unsafe {
        assert_eq!(
            libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1),
            1
        );
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Fd watcher that counts invocations, optionally consumes one byte per
/// event, and returns a fixed decision.
pub struct CountingFdWatcher {
    decision: Rearm,
    consume: bool,
    hits: AtomicUsize,
    removed: AtomicUsize,
}

impl CountingFdWatcher {
    pub fn new(decision: Rearm, consume: bool) -> Arc<CountingFdWatcher> {
        Arc::new(CountingFdWatcher {
            decision,
            consume,
            hits: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        })
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl FdWatcher for CountingFdWatcher {
    fn got_event(&self, fd: RawFd, events: EventMask) -> Rearm {
        assert!(events.is_readable() || events.is_hup());
        self.hits.fetch_add(1, Ordering::SeqCst);
        if self.consume {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
            }
        }
        self.decision
    }

    fn watch_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}
