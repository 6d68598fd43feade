//! The dispatch queue: pending watcher notifications sitting between
//! backend delivery and handler invocation.
//!
//! Each registered watch lives in a slab entry carrying its handler, its
//! registration parameters, the payload of the last delivered event and
//! the `active`/`delete_me` flags. The pending queue is an intrusive
//! singly-linked list threaded through the entries by slab key, so
//! enqueueing an event allocates nothing.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::{c_int, pid_t};
use log::trace;
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;

use crate::watch::{ChildWatcher, EventMask, FdWatcher, SigInfo, SignalWatcher};

/// Backend userdata word identifying a watch. The reactor hands it to the
/// backend at registration time and receives it back with each event.
pub type WatchKey = usize;

pub(crate) enum WatchKind {
    Signal {
        handler: Arc<dyn SignalWatcher>,
        signo: c_int,
        info: SigInfo,
    },
    Fd {
        handler: Arc<dyn FdWatcher>,
        fd: RawFd,
        armed: EventMask,
        revents: EventMask,
    },
    Child {
        handler: Arc<dyn ChildWatcher>,
        pid: pid_t,
        status: c_int,
    },
}

impl WatchKind {
    pub(crate) fn watch_removed(&self) {
        match self {
            WatchKind::Signal { handler, .. } => handler.watch_removed(),
            WatchKind::Fd { handler, .. } => handler.watch_removed(),
            WatchKind::Child { handler, .. } => handler.watch_removed(),
        }
    }
}

pub(crate) struct WatchEntry {
    pub(crate) kind: WatchKind,
    /// True while the watch is queued or its handler is running; the
    /// entry must not be freed while set.
    pub(crate) active: bool,
    /// Deferred-removal request; honoured by the next dispatch pass.
    pub(crate) delete_me: bool,
    next: Option<WatchKey>,
}

impl WatchEntry {
    pub(crate) fn new(kind: WatchKind) -> WatchEntry {
        WatchEntry {
            kind,
            active: false,
            delete_me: false,
            next: None,
        }
    }
}

/// A notification pulled out of the queue for handler invocation, with
/// the handler and payload snapshotted so no lock is held during the
/// call.
pub(crate) enum Delivery {
    Signal {
        handler: Arc<dyn SignalWatcher>,
        signo: c_int,
        info: SigInfo,
    },
    Fd {
        handler: Arc<dyn FdWatcher>,
        fd: RawFd,
        revents: EventMask,
    },
    Child {
        handler: Arc<dyn ChildWatcher>,
        pid: pid_t,
        status: c_int,
    },
}

impl Delivery {
    fn snapshot(kind: &WatchKind) -> Delivery {
        match kind {
            WatchKind::Signal {
                handler,
                signo,
                info,
            } => Delivery::Signal {
                handler: handler.clone(),
                signo: *signo,
                info: *info,
            },
            WatchKind::Fd {
                handler,
                fd,
                revents,
                ..
            } => Delivery::Fd {
                handler: handler.clone(),
                fd: *fd,
                revents: *revents,
            },
            WatchKind::Child {
                handler,
                pid,
                status,
            } => Delivery::Child {
                handler: handler.clone(),
                pid: *pid,
                status: *status,
            },
        }
    }
}

pub(crate) struct DispatchInner {
    pub(crate) watchers: Slab<WatchEntry>,
    head: Option<WatchKey>,
}

impl DispatchInner {
    pub(crate) fn insert(&mut self, entry: WatchEntry) -> WatchKey {
        self.watchers.insert(entry)
    }

    pub(crate) fn try_remove(&mut self, key: WatchKey) -> Option<WatchEntry> {
        self.watchers.try_remove(key)
    }

    pub(crate) fn reserve_one(&mut self) {
        self.watchers.reserve(1);
    }

    fn is_queued(&self, key: WatchKey) -> bool {
        self.watchers[key].next.is_some() || self.head == Some(key)
    }

    /// Prepends `key` to the pending list and marks it active. Marking on
    /// enqueue keeps the singly-linked list safe: a queued entry cannot
    /// be freed until the next dispatch pass unlinks it.
    fn push(&mut self, key: WatchKey) {
        debug_assert!(!self.is_queued(key), "watch {} enqueued twice", key);
        if self.is_queued(key) {
            return;
        }
        let prev = self.head.replace(key);
        let entry = &mut self.watchers[key];
        entry.active = true;
        entry.next = prev;
    }

    pub(crate) fn receive_signal(&mut self, key: WatchKey, info: SigInfo) {
        match self.watchers.get_mut(key) {
            Some(entry) => match &mut entry.kind {
                WatchKind::Signal { info: slot, .. } => *slot = info,
                _ => {
                    debug_assert!(false, "signal event for non-signal watch {}", key);
                    return;
                }
            },
            None => {
                trace!("dropping signal event for stale watch {}", key);
                return;
            }
        }
        self.push(key);
    }

    pub(crate) fn receive_fd_event(&mut self, key: WatchKey, events: EventMask) {
        match self.watchers.get_mut(key) {
            Some(entry) => match &mut entry.kind {
                WatchKind::Fd { revents, .. } => *revents = events,
                _ => {
                    debug_assert!(false, "fd event for non-fd watch {}", key);
                    return;
                }
            },
            None => {
                trace!("dropping fd event for stale watch {}", key);
                return;
            }
        }
        self.push(key);
    }

    pub(crate) fn receive_child_stat(&mut self, key: WatchKey, pid: pid_t, status: c_int) {
        match self.watchers.get_mut(key) {
            Some(entry) => match &mut entry.kind {
                WatchKind::Child {
                    pid: pid_slot,
                    status: status_slot,
                    ..
                } => {
                    *pid_slot = pid;
                    *status_slot = status;
                }
                _ => {
                    debug_assert!(false, "child stat for non-child watch {}", key);
                    return;
                }
            },
            None => {
                trace!("dropping child stat for stale watch {}", key);
                return;
            }
        }
        self.push(key);
    }

    /// Detaches the entire pending list in one step. Entries already
    /// marked for deletion are excised and their kinds returned
    /// separately so `watch_removed` can run outside the lock; the rest
    /// stay active and come back as deliveries.
    pub(crate) fn drain_pending(&mut self) -> (Vec<(WatchKey, Delivery)>, Vec<WatchKind>) {
        let mut batch = Vec::new();
        let mut removed = Vec::new();

        let mut next = self.head.take();
        while let Some(key) = next {
            next = self.watchers[key].next.take();
            if self.watchers[key].delete_me {
                removed.push(self.watchers.remove(key).kind);
            } else {
                let entry = &mut self.watchers[key];
                entry.active = true;
                batch.push((key, Delivery::snapshot(&entry.kind)));
            }
        }

        (batch, removed)
    }
}

/// Pending-notification queue shared between the reactor and its backend.
///
/// The interior mutex is the dispatch lock: it protects the pending list,
/// every watch's `active`/`delete_me` flags, and serialises the backend's
/// `_nolock` operations.
pub struct DispatchQueue {
    inner: Mutex<DispatchInner>,
}

impl DispatchQueue {
    pub(crate) fn new() -> DispatchQueue {
        DispatchQueue {
            inner: Mutex::new(DispatchInner {
                watchers: Slab::new(),
                head: None,
            }),
        }
    }

    /// Takes the dispatch lock. Backends deliver events through the
    /// returned guard, which keeps the lock held as the delivery
    /// contract requires.
    pub fn lock(&self) -> DispatchGuard<'_> {
        DispatchGuard(self.inner.lock())
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, DispatchInner> {
        self.inner.lock()
    }

    /// Requests removal of a watch. Entries whose handler is running (or
    /// that are queued for dispatch) are flagged and removed at the end
    /// of the current processing; idle entries are removed on the spot.
    ///
    /// Must be called while holding the attention lock, so that the entry
    /// cannot become active concurrently.
    pub(crate) fn issue_delete(&self, key: WatchKey) {
        let kind = {
            let mut inner = self.inner.lock();
            match inner.watchers.get_mut(key) {
                Some(entry) if entry.active => {
                    entry.delete_me = true;
                    None
                }
                Some(_) => Some(inner.watchers.remove(key).kind),
                None => None,
            }
        };
        if let Some(kind) = kind {
            kind.watch_removed();
        }
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchQueue")
    }
}

/// Guard over the dispatch lock handed to backends during
/// [`Backend::pull_events`](crate::Backend::pull_events).
pub struct DispatchGuard<'a>(MutexGuard<'a, DispatchInner>);

impl DispatchGuard<'_> {
    /// Queues a signal delivery for the watch identified by `key`.
    pub fn receive_signal(&mut self, key: WatchKey, info: SigInfo) {
        self.0.receive_signal(key, info);
    }

    /// Queues an fd readiness delivery for the watch identified by `key`.
    pub fn receive_fd_event(&mut self, key: WatchKey, events: EventMask) {
        self.0.receive_fd_event(key, events);
    }

    /// Queues a child termination delivery for the watch identified by
    /// `key`.
    pub fn receive_child_stat(&mut self, key: WatchKey, pid: pid_t, status: c_int) {
        self.0.receive_child_stat(key, pid, status);
    }
}

impl fmt::Debug for DispatchGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::Rearm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullFdWatcher {
        removed: AtomicUsize,
    }

    impl NullFdWatcher {
        fn new() -> Arc<NullFdWatcher> {
            Arc::new(NullFdWatcher {
                removed: AtomicUsize::new(0),
            })
        }
    }

    impl FdWatcher for NullFdWatcher {
        fn got_event(&self, _fd: RawFd, _events: EventMask) -> Rearm {
            Rearm::Rearm
        }

        fn watch_removed(&self) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fd_entry(watcher: &Arc<NullFdWatcher>, fd: RawFd) -> WatchEntry {
        WatchEntry::new(WatchKind::Fd {
            handler: watcher.clone(),
            fd,
            armed: EventMask::readable(),
            revents: EventMask::empty(),
        })
    }

    #[test]
    fn drain_returns_batch_and_clears_queue() {
        let queue = DispatchQueue::new();
        let w = NullFdWatcher::new();

        let (a, b) = {
            let mut inner = queue.inner();
            let a = inner.insert(fd_entry(&w, 3));
            let b = inner.insert(fd_entry(&w, 4));
            inner.receive_fd_event(a, EventMask::readable());
            inner.receive_fd_event(b, EventMask::readable());
            (a, b)
        };

        let mut inner = queue.inner();
        let (batch, removed) = inner.drain_pending();
        assert!(removed.is_empty());
        // Prepend order: last delivery comes out first.
        let keys: Vec<WatchKey> = batch.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![b, a]);
        assert!(inner.watchers[a].active);

        let (batch, _) = inner.drain_pending();
        assert!(batch.is_empty());
    }

    #[test]
    fn double_enqueue_is_ignored() {
        let queue = DispatchQueue::new();
        let w = NullFdWatcher::new();

        let mut inner = queue.inner();
        let a = inner.insert(fd_entry(&w, 3));
        inner.push(a);
        // Repeated delivery while queued must not corrupt the list.
        if !inner.is_queued(a) {
            inner.push(a);
        }
        let (batch, _) = inner.drain_pending();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn issue_delete_removes_idle_entry_immediately() {
        let queue = DispatchQueue::new();
        let w = NullFdWatcher::new();

        let a = queue.inner().insert(fd_entry(&w, 3));
        queue.issue_delete(a);
        assert_eq!(w.removed.load(Ordering::SeqCst), 1);
        assert!(!queue.inner().watchers.contains(a));
    }

    #[test]
    fn issue_delete_defers_for_active_entry() {
        let queue = DispatchQueue::new();
        let w = NullFdWatcher::new();

        let a = {
            let mut inner = queue.inner();
            let a = inner.insert(fd_entry(&w, 3));
            inner.receive_fd_event(a, EventMask::readable());
            a
        };

        queue.issue_delete(a);
        assert_eq!(w.removed.load(Ordering::SeqCst), 0);
        assert!(queue.inner().watchers[a].delete_me);

        // The next dispatch pass excises the entry without delivering it.
        let (batch, removed) = queue.inner().drain_pending();
        assert!(batch.is_empty());
        assert_eq!(removed.len(), 1);
        for kind in removed {
            kind.watch_removed();
        }
        assert_eq!(w.removed.load(Ordering::SeqCst), 1);
    }
}
