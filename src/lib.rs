#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

//! A portable, multi-threaded event notification library.
//!
//! The event loop multiplexes three classes of asynchronous sources onto
//! user-supplied handlers: readiness of file descriptors, delivery of
//! POSIX signals, and termination of child processes. Handlers run to
//! completion on the dispatching thread; this is not a task scheduler or
//! futures executor.
//!
//! The crate provides:
//!
//! * [`EventLoop`], which performs the event loop logic: registration,
//!   polling, dispatch and removal of watches.
//!
//! * The watcher traits [`FdWatcher`], [`SignalWatcher`] and
//!   [`ChildWatcher`], implemented by user handler types. Each callback
//!   returns a [`Rearm`] decision (child watches are removed implicitly).
//!
//! * [`Backend`], the seam to the OS readiness mechanism, and
//!   [`EpollBackend`], the epoll/signalfd implementation of it.
//!
//! Any number of threads may share one loop: several can register and
//! deregister watches while others call [`EventLoop::run`], with at most
//! one thread polling the OS at a time.
//!
//! # Examples
//!
//! Watch one end of a socket pair for readability:
//!
//! ```rust,no_run
//! use std::io::Write;
//! use std::os::unix::io::{AsRawFd, RawFd};
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//!
//! use evloop::{EventLoop, EventMask, FdWatcher, Rearm};
//!
//! struct Echo;
//!
//! impl FdWatcher for Echo {
//!     fn got_event(&self, fd: RawFd, events: EventMask) -> Rearm {
//!         println!("fd {} ready: {:?}", fd, events);
//!         Rearm::Remove
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let (a, b) = UnixStream::pair()?;
//!     let eloop = EventLoop::new()?;
//!     eloop.register_fd(Arc::new(Echo), a.as_raw_fd(), EventMask::readable())?;
//!     (&b).write_all(b"ping")?;
//!     eloop.run_once();
//!     Ok(())
//! }
//! ```

mod backend;
mod dispatch;
mod wait_queue;
mod watch;

pub use crate::backend::{block_signal, unblock_signal, Backend, EpollBackend};
pub use crate::dispatch::{DispatchGuard, DispatchQueue, WatchKey};
pub use crate::watch::{
    ChildWatchId, ChildWatcher, EventMask, FdWatchId, FdWatcher, Rearm, SigInfo, SignalWatchId,
    SignalWatcher,
};

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use lazy_static::lazy_static;
use libc::{c_int, pid_t};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::dispatch::{Delivery, WatchEntry, WatchKind};
use crate::wait_queue::{WaitNode, WaitQueue};

struct LockQueues {
    attn: WaitQueue,
    wait: WaitQueue,
}

/// The core event loop.
///
/// A loop owns its backend by parametric composition; all watcher state
/// lives in an internal table keyed by the ids handed out at
/// registration. The loop is `Sync`: threads register, deregister and
/// poll concurrently through a shared reference.
pub struct EventLoop<B: Backend> {
    backend: B,
    queue: DispatchQueue,

    // Removing a watch while another thread polls is the classic hazard
    // of multi-threaded event loops: the poller may be about to dispatch
    // an event for the very watch being removed. Serialising pollers and
    // mutators with a plain mutex is not enough, because a mutex grants
    // no fairness and a steady stream of pollers could starve removal
    // indefinitely. Instead, two FIFO queues share the wait-lock below.
    // The attention queue is the high-priority queue used by mutators;
    // its head is the holder of the lock. Pollers park on the separate
    // wait queue and are promoted to the attention queue only when it is
    // empty, so a mutator joining while a poll is in flight interrupts
    // the poll and is admitted next. The wait-lock itself protects only
    // the two queues and is never held for long.
    wait_lock: Mutex<LockQueues>,
}

impl EventLoop<EpollBackend> {
    /// Creates an event loop over the platform default mechanism.
    pub fn new() -> io::Result<EventLoop<EpollBackend>> {
        Ok(EventLoop::with_backend(EpollBackend::new()?))
    }
}

impl<B: Backend> EventLoop<B> {
    /// Creates an event loop over the given backend.
    pub fn with_backend(backend: B) -> EventLoop<B> {
        EventLoop {
            backend,
            queue: DispatchQueue::new(),
            wait_lock: Mutex::new(LockQueues {
                attn: WaitQueue::new(),
                wait: WaitQueue::new(),
            }),
        }
    }

    /// Registers a watch for `signo`.
    ///
    /// The signal must already be blocked in every thread participating
    /// in the loop; see [`block_signal`]. Registering a signal that is
    /// already watched on this loop is not supported.
    pub fn register_signal(
        &self,
        watcher: Arc<dyn SignalWatcher>,
        signo: c_int,
    ) -> io::Result<SignalWatchId> {
        let key = self.queue.inner().insert(WatchEntry::new(WatchKind::Signal {
            handler: watcher,
            signo,
            info: SigInfo::new(signo),
        }));
        if let Err(e) = self.backend.add_signal_watch(signo, key) {
            let _ = self.queue.inner().try_remove(key);
            return Err(e);
        }
        debug!("registered signal watch: signo={} key={}", signo, key);
        Ok(SignalWatchId(key))
    }

    /// Removes a signal watch.
    ///
    /// When this returns, no new handler invocation will start for the
    /// watch; `watch_removed` runs exactly once, after any invocation
    /// already in flight has completed.
    pub fn deregister_signal(&self, id: SignalWatchId) {
        let node = self.get_attn_lock();
        let signo = {
            let inner = self.queue.inner();
            match inner.watchers.get(id.0) {
                Some(entry) => match &entry.kind {
                    WatchKind::Signal { signo, .. } => Some(*signo),
                    _ => {
                        debug_assert!(false, "id {} does not name a signal watch", id.0);
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(signo) = signo {
            self.backend.remove_signal_watch(signo);
            self.queue.issue_delete(id.0);
        }
        self.release_lock(&node);
    }

    /// Registers a watch for readiness of `fd`.
    ///
    /// `mask` selects the direction(s) of interest. Delivery is one-shot:
    /// the watch is disarmed while its handler runs and the handler's
    /// [`Rearm`] return decides whether it is re-enabled. Registering the
    /// same descriptor twice is not supported.
    pub fn register_fd(
        &self,
        watcher: Arc<dyn FdWatcher>,
        fd: RawFd,
        mask: EventMask,
    ) -> io::Result<FdWatchId> {
        let key = self.queue.inner().insert(WatchEntry::new(WatchKind::Fd {
            handler: watcher,
            fd,
            armed: mask,
            revents: EventMask::empty(),
        }));

        let result = if mask.is_readable() && mask.is_writable() {
            if B::HAS_BIDI_FD_WATCH {
                self.add_bidi_watch(fd, key, mask)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "backend cannot watch one descriptor in both directions",
                ))
            }
        } else {
            self.backend
                .add_fd_watch(fd, key, mask | EventMask::one_shot(), true, false)
                .map(|_| ())
        };

        if let Err(e) = result {
            let _ = self.queue.inner().try_remove(key);
            return Err(e);
        }
        if B::INTERRUPT_AFTER_FD_ADD {
            self.backend.interrupt_wait();
        }
        debug!("registered fd watch: fd={} key={}", fd, key);
        Ok(FdWatchId(key))
    }

    /// Removes an fd watch.
    ///
    /// When this returns, no new handler invocation will start for the
    /// watch; `watch_removed` runs exactly once, after any invocation
    /// already in flight has completed.
    pub fn deregister_fd(&self, id: FdWatchId) {
        let node = self.get_attn_lock();
        let params = {
            let inner = self.queue.inner();
            match inner.watchers.get(id.0) {
                Some(entry) => match &entry.kind {
                    WatchKind::Fd { fd, armed, .. } => Some((*fd, *armed)),
                    _ => {
                        debug_assert!(false, "id {} does not name an fd watch", id.0);
                        None
                    }
                },
                None => None,
            }
        };
        if let Some((fd, armed)) = params {
            self.backend.remove_fd_watch(fd, armed);
            self.queue.issue_delete(id.0);
        }
        self.release_lock(&node);
    }

    /// Re-arms an fd watch left disarmed by [`Rearm::Disarm`] (or by
    /// [`disable_fd`](EventLoop::disable_fd)).
    pub fn enable_fd(&self, id: FdWatchId) {
        if let Some((fd, armed)) = self.fd_params(id) {
            self.backend
                .enable_fd_watch(fd, id.0, armed | EventMask::one_shot());
            if B::INTERRUPT_AFTER_FD_ADD {
                self.backend.interrupt_wait();
            }
        }
    }

    /// Disarms an fd watch without removing it.
    pub fn disable_fd(&self, id: FdWatchId) {
        if let Some((fd, armed)) = self.fd_params(id) {
            self.backend.disable_fd_watch(fd, armed);
        }
    }

    /// Arms a watch for both directions of `fd`. A direction the backend
    /// reports as needing emulation is registered as its own
    /// one-directional watch on the same key.
    fn add_bidi_watch(&self, fd: RawFd, key: WatchKey, mask: EventMask) -> io::Result<()> {
        let needs = self
            .backend
            .add_bidi_fd_watch(fd, key, mask | EventMask::one_shot(), true)?;
        if needs.is_empty() {
            return Ok(());
        }
        if let Err(e) = self
            .backend
            .add_fd_watch(fd, key, needs | EventMask::one_shot(), true, false)
        {
            // No partial state on failure: drop the covered direction.
            self.backend.remove_fd_watch(fd, mask - needs);
            return Err(e);
        }
        Ok(())
    }

    fn fd_params(&self, id: FdWatchId) -> Option<(RawFd, EventMask)> {
        let inner = self.queue.inner();
        match inner.watchers.get(id.0) {
            Some(entry) => match &entry.kind {
                WatchKind::Fd { fd, armed, .. } => Some((*fd, *armed)),
                _ => {
                    debug_assert!(false, "id {} does not name an fd watch", id.0);
                    None
                }
            },
            None => None,
        }
    }

    /// Sets aside the resources needed by one
    /// [`register_reserved_child`](EventLoop::register_reserved_child),
    /// so that registration between `fork` and the first opportunity to
    /// handle an error cannot fail.
    pub fn reserve_child(&self) -> io::Result<()> {
        self.queue.inner().reserve_one();
        self.backend.reserve_child_watch()
    }

    /// Registers a watch for termination of the child process `pid`.
    ///
    /// SIGCHLD must be blocked in every thread participating in the
    /// loop; see [`block_signal`]. The watch fires once and is then
    /// removed implicitly.
    pub fn register_child(
        &self,
        watcher: Arc<dyn ChildWatcher>,
        pid: pid_t,
    ) -> io::Result<ChildWatchId> {
        let key = self.queue.inner().insert(WatchEntry::new(WatchKind::Child {
            handler: watcher,
            pid,
            status: 0,
        }));
        if let Err(e) = self.backend.add_child_watch(pid, key) {
            let _ = self.queue.inner().try_remove(key);
            return Err(e);
        }
        debug!("registered child watch: pid={} key={}", pid, key);
        Ok(ChildWatchId(key))
    }

    /// As [`register_child`](EventLoop::register_child), consuming a
    /// reservation made with [`reserve_child`](EventLoop::reserve_child)
    /// so that it cannot fail.
    pub fn register_reserved_child(&self, watcher: Arc<dyn ChildWatcher>, pid: pid_t) -> ChildWatchId {
        let key = self.queue.inner().insert(WatchEntry::new(WatchKind::Child {
            handler: watcher,
            pid,
            status: 0,
        }));
        self.backend.add_reserved_child_watch(pid, key);
        debug!("registered reserved child watch: pid={} key={}", pid, key);
        ChildWatchId(key)
    }

    /// Removes a child watch before its process has terminated.
    pub fn deregister_child(&self, id: ChildWatchId) {
        let node = self.get_attn_lock();
        let pid = {
            let inner = self.queue.inner();
            match inner.watchers.get(id.0) {
                Some(entry) => match &entry.kind {
                    WatchKind::Child { pid, .. } => Some(*pid),
                    _ => {
                        debug_assert!(false, "id {} does not name a child watch", id.0);
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(pid) = pid {
            self.backend.remove_child_watch(pid);
            self.queue.issue_delete(id.0);
        }
        self.release_lock(&node);
    }

    /// Runs the loop forever, dispatching events to the registered
    /// watchers.
    ///
    /// Several threads may call `run` on one loop; only one of them
    /// polls the OS at a time. There is no cancellation primitive at
    /// this level; a caller that needs one registers a wake watch of its
    /// own (a pipe, typically).
    pub fn run(&self) {
        loop {
            self.run_once();
        }
    }

    /// Runs the loop until at least one handler has been invoked, then
    /// returns.
    pub fn run_once(&self) {
        while !self.process_events() {
            let node = self.get_poll_lock();
            let result = self.backend.pull_events(&self.queue, true);
            self.release_lock(&node);
            if let Err(e) = result {
                warn!("backend wait failed: {}", e);
            }
        }
    }

    /// Dispatches anything already pending and polls the OS without
    /// blocking. Returns whether any handler was invoked.
    pub fn turn(&self) -> bool {
        if self.process_events() {
            return true;
        }
        let node = self.get_poll_lock();
        let result = self.backend.pull_events(&self.queue, false);
        self.release_lock(&node);
        if let Err(e) = result {
            warn!("backend poll failed: {}", e);
        }
        self.process_events()
    }

    /// Drains the pending queue and invokes handlers. Returns whether
    /// any handler ran.
    fn process_events(&self) -> bool {
        let (batch, removed) = self.queue.inner().drain_pending();
        for kind in removed {
            kind.watch_removed();
        }

        let any = !batch.is_empty();
        for (key, delivery) in batch {
            let decision = match delivery {
                Delivery::Signal {
                    handler,
                    signo,
                    info,
                } => handler.got_signal(signo, &info),
                Delivery::Fd {
                    handler,
                    fd,
                    revents,
                } => handler.got_event(fd, revents),
                Delivery::Child {
                    handler,
                    pid,
                    status,
                } => {
                    handler.got_term_stat(pid, status);
                    // Child watches remove themselves.
                    Rearm::Remove
                }
            };
            self.finish_dispatch(key, decision);
        }
        any
    }

    /// Applies a handler's rearm decision under the dispatch lock. A
    /// removal requested while the handler was running wins over
    /// whatever the handler returned.
    fn finish_dispatch(&self, key: WatchKey, decision: Rearm) {
        let mut inner = self.queue.inner();
        let entry = match inner.watchers.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        entry.active = false;
        let decision = if entry.delete_me {
            Rearm::Remove
        } else {
            decision
        };

        match &entry.kind {
            WatchKind::Signal { signo, .. } => {
                let signo = *signo;
                match decision {
                    Rearm::Rearm => self.backend.rearm_signal_watch_nolock(signo, key),
                    Rearm::Remove => self.backend.remove_signal_watch_nolock(signo),
                    Rearm::Disarm => {}
                }
            }
            WatchKind::Fd { fd, armed, .. } => {
                let (fd, armed) = (*fd, *armed);
                match decision {
                    Rearm::Rearm => self.backend.enable_fd_watch_nolock(
                        fd,
                        key,
                        armed | EventMask::one_shot(),
                    ),
                    Rearm::Remove => self.backend.remove_fd_watch_nolock(fd, armed),
                    Rearm::Disarm => {}
                }
            }
            // The backend dropped its side of the watch when it
            // delivered the termination status.
            WatchKind::Child { .. } => {}
        }

        let removed = if decision == Rearm::Remove {
            inner.try_remove(key).map(|entry| entry.kind)
        } else {
            None
        };
        drop(inner);
        if let Some(kind) = removed {
            kind.watch_removed();
        }
    }

    /// Acquires the right to mutate registrations, interrupting any poll
    /// in flight and taking priority over queued pollers.
    fn get_attn_lock(&self) -> Arc<WaitNode> {
        let node = WaitNode::new();
        let mut queues = self.wait_lock.lock();
        queues.attn.queue(&node);
        if !queues.attn.is_head(&node) {
            self.backend.interrupt_wait();
            while !queues.attn.is_head(&node) {
                node.wait(&mut queues);
            }
        }
        node
    }

    /// Acquires the right to poll the backend. Lower priority than the
    /// attention lock.
    fn get_poll_lock(&self) -> Arc<WaitNode> {
        let node = WaitNode::new();
        let mut queues = self.wait_lock.lock();
        if queues.attn.is_empty() {
            queues.attn.queue(&node);
        } else {
            queues.wait.queue(&node);
        }
        while !queues.attn.is_head(&node) {
            node.wait(&mut queues);
        }
        node
    }

    /// Releases the attention/poll lock. Called by the current holder on
    /// every exit path.
    fn release_lock(&self, node: &Arc<WaitNode>) {
        let mut queues = self.wait_lock.lock();
        let head = queues.attn.pop_head();
        debug_assert!(head.as_ref().map_or(false, |h| Arc::ptr_eq(h, node)));
        if let Some(next) = queues.attn.head() {
            next.signal();
        } else if let Some(promoted) = queues.wait.pop_head() {
            queues.attn.queue(&promoted);
            promoted.signal();
        }
    }
}

impl<B: Backend> fmt::Debug for EventLoop<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventLoop")
    }
}

/// Returns the process-wide default loop, created on first use.
pub fn system_loop() -> &'static EventLoop<EpollBackend> {
    lazy_static! {
        static ref SYSTEM_LOOP: EventLoop<EpollBackend> =
            EventLoop::new().expect("failed to create system event loop");
    }
    &SYSTEM_LOOP
}
