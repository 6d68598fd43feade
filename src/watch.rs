//! Watcher types: handler traits, the rearm decision, fd event masks and
//! signal information.

use std::fmt;
use std::ops;
use std::os::unix::io::RawFd;

use libc::{c_int, c_long, pid_t, uid_t};

/// Decision returned from a watcher callback, controlling what happens to
/// the watch afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Re-enable the watch; the handler will be called again when the
    /// source next fires.
    Rearm,
    /// Leave the watch installed but disarmed. No further events are
    /// delivered until it is explicitly re-enabled.
    Disarm,
    /// Deregister the watch and invoke `watch_removed`.
    Remove,
}

/// A set of file descriptor event flags.
///
/// Used both to express interest at registration time and to report
/// delivered readiness to [`FdWatcher::got_event`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventMask(u32);

const READABLE: u32 = 0b0_0001;
const WRITABLE: u32 = 0b0_0010;
const ERROR: u32 = 0b0_0100;
const HUP: u32 = 0b0_1000;
const ONE_SHOT: u32 = 0b1_0000;

impl EventMask {
    /// Returns an empty set.
    pub const fn empty() -> EventMask {
        EventMask(0)
    }

    /// Readiness for reading.
    pub const fn readable() -> EventMask {
        EventMask(READABLE)
    }

    /// Readiness for writing.
    pub const fn writable() -> EventMask {
        EventMask(WRITABLE)
    }

    /// An error condition on the descriptor.
    pub const fn error() -> EventMask {
        EventMask(ERROR)
    }

    /// Hangup on the descriptor.
    pub const fn hup() -> EventMask {
        EventMask(HUP)
    }

    /// One-shot delivery: the watch disarms itself when an event fires.
    pub const fn one_shot() -> EventMask {
        EventMask(ONE_SHOT)
    }

    /// Returns true if the set contains no flags.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set includes read readiness.
    pub fn is_readable(self) -> bool {
        self.contains(EventMask::readable())
    }

    /// Returns true if the set includes write readiness.
    pub fn is_writable(self) -> bool {
        self.contains(EventMask::writable())
    }

    /// Returns true if the set includes an error condition.
    pub fn is_error(self) -> bool {
        self.contains(EventMask::error())
    }

    /// Returns true if the set includes hangup.
    pub fn is_hup(self) -> bool {
        self.contains(EventMask::hup())
    }

    /// Returns true if the set requests one-shot delivery.
    pub fn is_one_shot(self) -> bool {
        self.contains(EventMask::one_shot())
    }

    /// Returns true if `self` is a superset of `other`.
    pub fn contains(self, other: EventMask) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Adds all flags in `other` to the set.
    pub fn insert(&mut self, other: EventMask) {
        self.0 |= other.0;
    }

    /// Drops all flags in `other` from the set.
    pub fn remove(&mut self, other: EventMask) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }
}

impl ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, other: EventMask) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }
}

impl ops::Sub for EventMask {
    type Output = EventMask;

    fn sub(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let flags = [
            (EventMask::readable(), "Readable"),
            (EventMask::writable(), "Writable"),
            (EventMask::error(), "Error"),
            (EventMask::hup(), "Hup"),
            (EventMask::one_shot(), "OneShot"),
        ];

        for &(flag, name) in &flags {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                first = false;
                write!(f, "{}", name)?;
            }
        }

        if first {
            write!(f, "(empty)")?;
        }

        Ok(())
    }
}

/// Information about a received signal.
///
/// This is a wrapper decoupled from any particular OS record; a backend
/// converts its native form (`siginfo_t`, `signalfd_siginfo`, ...) into
/// this shape. Fields an OS cannot supply are reported as zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    pub(crate) signo: c_int,
    pub(crate) code: c_int,
    pub(crate) pid: pid_t,
    pub(crate) uid: uid_t,
    pub(crate) errno: c_int,
    pub(crate) status: c_int,
    pub(crate) band: c_long,
    pub(crate) addr: usize,
    pub(crate) value_int: c_int,
    pub(crate) value_ptr: usize,
}

impl SigInfo {
    /// Creates a record carrying only the signal number.
    pub fn new(signo: c_int) -> SigInfo {
        SigInfo {
            signo,
            ..SigInfo::default()
        }
    }

    /// The signal number.
    pub fn signo(&self) -> c_int {
        self.signo
    }

    /// The signal code (`si_code`).
    pub fn code(&self) -> c_int {
        self.code
    }

    /// Pid of the sending process, where applicable.
    pub fn sending_pid(&self) -> pid_t {
        self.pid
    }

    /// Real uid of the sending process, where applicable.
    pub fn sending_uid(&self) -> uid_t {
        self.uid
    }

    /// Errno value associated with the signal (XSI).
    pub fn errno(&self) -> c_int {
        self.errno
    }

    /// Exit status or signal of a terminated child (SIGCHLD).
    pub fn status(&self) -> c_int {
        self.status
    }

    /// Band event (SIGPOLL/SIGIO, STREAMS).
    pub fn band(&self) -> c_long {
        self.band
    }

    /// Faulting address, for hardware-generated signals.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Integer payload sent with `sigqueue`.
    pub fn value_int(&self) -> c_int {
        self.value_int
    }

    /// Pointer payload sent with `sigqueue`, as an address.
    pub fn value_ptr(&self) -> usize {
        self.value_ptr
    }
}

impl From<&libc::signalfd_siginfo> for SigInfo {
    fn from(ssi: &libc::signalfd_siginfo) -> SigInfo {
        SigInfo {
            signo: ssi.ssi_signo as c_int,
            code: ssi.ssi_code,
            pid: ssi.ssi_pid as pid_t,
            uid: ssi.ssi_uid as uid_t,
            errno: ssi.ssi_errno,
            status: ssi.ssi_status,
            band: ssi.ssi_band as c_long,
            addr: ssi.ssi_addr as usize,
            value_int: ssi.ssi_int,
            value_ptr: ssi.ssi_ptr as usize,
        }
    }
}

/// Watcher for POSIX signal delivery.
///
/// The watched signal must be blocked in every thread participating in
/// the loop before registration; see [`block_signal`].
///
/// [`block_signal`]: crate::block_signal
pub trait SignalWatcher: Send + Sync {
    /// Called when the watched signal has been received.
    fn got_signal(&self, signo: c_int, info: &SigInfo) -> Rearm;

    /// Called when the watch has been removed.
    ///
    /// It is guaranteed that the handler is not currently running and
    /// will not be called again.
    fn watch_removed(&self) {}
}

/// Watcher for file descriptor readiness.
pub trait FdWatcher: Send + Sync {
    /// Called when the watched descriptor is ready. `events` holds the
    /// delivered readiness flags.
    ///
    /// The watch is disarmed while the handler runs; the return value
    /// decides whether it is re-enabled, left disarmed or removed.
    fn got_event(&self, fd: RawFd, events: EventMask) -> Rearm;

    /// Called when the watch has been removed.
    ///
    /// It is guaranteed that the handler is not currently running and
    /// will not be called again.
    fn watch_removed(&self) {}
}

/// Watcher for termination of a child process.
pub trait ChildWatcher: Send + Sync {
    /// Called once when the watched child terminates. `status` is the raw
    /// wait status, or `-1` if the status was collected elsewhere and is
    /// unavailable. The watch is removed implicitly afterwards.
    fn got_term_stat(&self, pid: pid_t, status: c_int);

    /// Called when the watch has been removed.
    ///
    /// It is guaranteed that the handler is not currently running and
    /// will not be called again.
    fn watch_removed(&self) {}
}

/// Identifies a registered signal watch.
///
/// Ids are invalidated when `watch_removed` runs for the watch; using one
/// afterwards is not detected reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalWatchId(pub(crate) usize);

/// Identifies a registered file descriptor watch.
///
/// Ids are invalidated when `watch_removed` runs for the watch; using one
/// afterwards is not detected reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdWatchId(pub(crate) usize);

/// Identifies a registered child process watch.
///
/// Ids are invalidated when `watch_removed` runs for the watch; using one
/// afterwards is not detected reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildWatchId(pub(crate) usize);
