//! The seam between the reactor core and the OS readiness mechanism.

mod epoll;
mod reaper;

pub use self::epoll::EpollBackend;

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, pid_t};

use crate::dispatch::{DispatchQueue, WatchKey};
use crate::watch::EventMask;

/// An OS readiness mechanism the reactor can be composed over.
///
/// Contract highlights:
///
/// * `pull_events` delivers every ready event by calling `receive_*` on a
///   [`DispatchQueue`] guard, i.e. with the dispatch lock held.
/// * `_nolock` operations are callable while the caller holds the
///   dispatch lock and must not take it themselves. Their unsuffixed
///   siblings may take it; the reactor never calls those while holding
///   the lock.
/// * `interrupt_wait` wakes a thread blocked in `pull_events` without
///   delivering an event, and makes a wait that has not started yet
///   return immediately.
/// * Watched signals must be blocked in every participating thread
///   before `add_signal_watch`; see [`block_signal`].
pub trait Backend: Send + Sync + 'static {
    /// The mechanism can watch a single descriptor for read and write
    /// readiness in one registration.
    const HAS_BIDI_FD_WATCH: bool;

    /// Read and write watches on one descriptor are independent
    /// registrations.
    const HAS_SEPARATE_RW_FD_WATCHES: bool;

    /// Adding or enabling an fd watch only becomes visible to a
    /// concurrent `pull_events` after an `interrupt_wait`.
    const INTERRUPT_AFTER_FD_ADD: bool;

    /// Starts watching `fd` for the direction in `mask` (one direction
    /// only, unless [`HAS_BIDI_FD_WATCH`](Backend::HAS_BIDI_FD_WATCH)).
    /// With `soft_fail`, an unsupported descriptor type reports
    /// `Ok(false)` instead of an error.
    fn add_fd_watch(
        &self,
        fd: RawFd,
        key: WatchKey,
        mask: EventMask,
        enabled: bool,
        soft_fail: bool,
    ) -> io::Result<bool>;

    /// Starts watching `fd` for both directions at once. Returns the
    /// direction(s) the mechanism cannot cover natively and would need
    /// emulated; empty on full support. With `emulate` false the
    /// mechanism fails instead of reporting a direction for emulation.
    fn add_bidi_fd_watch(
        &self,
        fd: RawFd,
        key: WatchKey,
        mask: EventMask,
        emulate: bool,
    ) -> io::Result<EventMask>;

    /// Stops watching `fd` for the direction(s) in `mask`.
    fn remove_fd_watch(&self, fd: RawFd, mask: EventMask);

    /// As [`remove_fd_watch`](Backend::remove_fd_watch), callable with
    /// the dispatch lock held.
    fn remove_fd_watch_nolock(&self, fd: RawFd, mask: EventMask);

    /// Re-arms a disarmed fd watch.
    fn enable_fd_watch(&self, fd: RawFd, key: WatchKey, mask: EventMask);

    /// As [`enable_fd_watch`](Backend::enable_fd_watch), callable with
    /// the dispatch lock held.
    fn enable_fd_watch_nolock(&self, fd: RawFd, key: WatchKey, mask: EventMask);

    /// Disarms an fd watch without removing it.
    fn disable_fd_watch(&self, fd: RawFd, mask: EventMask);

    /// As [`disable_fd_watch`](Backend::disable_fd_watch), callable with
    /// the dispatch lock held.
    fn disable_fd_watch_nolock(&self, fd: RawFd, mask: EventMask);

    /// Starts watching for `signo`. The caller has blocked the signal in
    /// every participating thread.
    fn add_signal_watch(&self, signo: c_int, key: WatchKey) -> io::Result<()>;

    /// Re-arms a signal watch disarmed by a delivery. Called with the
    /// dispatch lock held.
    fn rearm_signal_watch_nolock(&self, signo: c_int, key: WatchKey);

    /// Stops watching for `signo`.
    fn remove_signal_watch(&self, signo: c_int);

    /// As [`remove_signal_watch`](Backend::remove_signal_watch), callable
    /// with the dispatch lock held.
    fn remove_signal_watch_nolock(&self, signo: c_int);

    /// Sets aside resources so that one subsequent
    /// [`add_reserved_child_watch`](Backend::add_reserved_child_watch)
    /// cannot fail. Intended to be called before `fork`.
    fn reserve_child_watch(&self) -> io::Result<()>;

    /// Starts watching for termination of `pid`.
    fn add_child_watch(&self, pid: pid_t, key: WatchKey) -> io::Result<()>;

    /// Starts watching for termination of `pid` using resources set aside
    /// by [`reserve_child_watch`](Backend::reserve_child_watch).
    fn add_reserved_child_watch(&self, pid: pid_t, key: WatchKey);

    /// Stops watching for termination of `pid`.
    fn remove_child_watch(&self, pid: pid_t);

    /// Waits (when `do_wait`) until at least one source fires, then
    /// delivers all currently ready events into `queue`. A wait cut short
    /// by a caught OS signal is not an error; the caller simply retries.
    fn pull_events(&self, queue: &DispatchQueue, do_wait: bool) -> io::Result<()>;

    /// Wakes a thread blocked in [`pull_events`](Backend::pull_events).
    fn interrupt_wait(&self);
}

/// Blocks `signo` for the calling thread.
///
/// Watched signals must be blocked in every thread participating in the
/// loop before the corresponding watch is registered; otherwise the OS
/// may deliver the signal to an unblocked thread and the loop never sees
/// it.
pub fn block_signal(signo: c_int) -> io::Result<()> {
    sigmask(libc::SIG_BLOCK, signo)
}

/// Undoes [`block_signal`] for the calling thread.
pub fn unblock_signal(signo: c_int) -> io::Result<()> {
    sigmask(libc::SIG_UNBLOCK, signo)
}

fn sigmask(how: c_int, signo: c_int) -> io::Result<()> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signo);
        let rc = libc::pthread_sigmask(how, &set, ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}
