//! Readiness backend built on epoll and signalfd.
//!
//! File descriptor watches are registered with `EPOLLONESHOT`, so a
//! delivery disarms the watch at the mechanism level until the reactor
//! re-enables it. Signal watches share one signalfd whose mask is grown
//! and shrunk as watches are armed and disarmed; a delivered signal is
//! taken out of the mask until rearmed, which gives signals the same
//! one-shot discipline. Child watches ride on an internal SIGCHLD
//! subscription plus a waitpid table.
//!
//! A pipe registered level-triggered provides `interrupt_wait`: waking a
//! poller is one write, and the byte stays readable until the next
//! `pull_events` drains it, so an interrupt issued before the wait even
//! starts is not lost.

use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::{c_int, pid_t};
use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::reaper::ChildReaper;
use super::Backend;
use crate::dispatch::{DispatchGuard, DispatchQueue, WatchKey};
use crate::watch::{EventMask, SigInfo};

// Linux _NSIG.
const MAX_SIG: usize = 65;

const EVENT_BATCH: usize = 64;

// Keys from the watch table are small slab indices; the top of the token
// space is reserved for the backend's own descriptors. Disabled fd
// watches carry the dead token because epoll reports EPOLLERR and
// EPOLLHUP regardless of the requested readiness bits.
const TOKEN_SIGNALFD: u64 = u64::MAX;
const TOKEN_WAKEUP: u64 = u64::MAX - 1;
const TOKEN_DISABLED: u64 = u64::MAX - 2;

#[derive(Clone, Copy)]
struct SignalWatch {
    key: WatchKey,
    armed: bool,
}

struct Tables {
    signals: [Option<SignalWatch>; MAX_SIG],
    children: ChildReaper,
}

/// [`Backend`] implementation over epoll and signalfd.
pub struct EpollBackend {
    epfd: RawFd,
    sigfd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    tables: Mutex<Tables>,
}

fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn to_epoll(mask: EventMask) -> u32 {
    let mut events = libc::EPOLLONESHOT as u32;
    if mask.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if mask.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn from_epoll(events: u32) -> EventMask {
    let mut mask = EventMask::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= EventMask::readable();
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= EventMask::writable();
    }
    if events & libc::EPOLLERR as u32 != 0 {
        mask |= EventMask::error();
    }
    if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        mask |= EventMask::hup();
    }
    mask
}

impl EpollBackend {
    /// Creates the epoll instance, the signalfd (with an initially empty
    /// mask) and the wake pipe.
    pub fn new() -> io::Result<EpollBackend> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let sigfd = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            match cvt(libc::signalfd(
                -1,
                &mask,
                libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
            )) {
                Ok(fd) => fd,
                Err(e) => {
                    libc::close(epfd);
                    return Err(e);
                }
            }
        };

        let mut pipe_fds = [0 as c_int; 2];
        if let Err(e) = cvt(unsafe {
            libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK)
        }) {
            unsafe {
                libc::close(epfd);
                libc::close(sigfd);
            }
            return Err(e);
        }

        let backend = EpollBackend {
            epfd,
            sigfd,
            wake_read: pipe_fds[0],
            wake_write: pipe_fds[1],
            tables: Mutex::new(Tables {
                signals: [None; MAX_SIG],
                children: ChildReaper::new(),
            }),
        };

        backend.epoll_ctl(libc::EPOLL_CTL_ADD, sigfd, libc::EPOLLIN as u32, TOKEN_SIGNALFD)?;
        backend.epoll_ctl(
            libc::EPOLL_CTL_ADD,
            backend.wake_read,
            libc::EPOLLIN as u32,
            TOKEN_WAKEUP,
        )?;

        Ok(backend)
    }

    fn epoll_ctl(&self, op: c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) }).map(|_| ())
    }

    /// Rebuilds the signalfd mask from the armed signal watches plus the
    /// internal SIGCHLD subscription.
    fn update_sigmask(&self, tables: &Tables) {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            for (signo, slot) in tables.signals.iter().enumerate() {
                if let Some(watch) = slot {
                    if watch.armed {
                        libc::sigaddset(&mut mask, signo as c_int);
                    }
                }
            }
            if !tables.children.is_empty() {
                libc::sigaddset(&mut mask, libc::SIGCHLD);
            }
            if libc::signalfd(self.sigfd, &mask, 0) == -1 {
                warn!(
                    "failed to update signalfd mask: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 128];
        loop {
            let rc = unsafe {
                libc::read(
                    self.wake_read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc < buf.len() as isize {
                break;
            }
        }
    }

    /// Reads everything the signalfd has to offer, reaping children on
    /// SIGCHLD and queueing deliveries for armed signal watches. Returns
    /// whether anything was delivered.
    fn read_signals(&self, pending: &mut DispatchGuard<'_>) -> bool {
        const SSI_SIZE: usize = mem::size_of::<libc::signalfd_siginfo>();
        let mut delivered = false;
        loop {
            let mut ssi: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let rc = unsafe {
                libc::read(
                    self.sigfd,
                    &mut ssi as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    SSI_SIZE,
                )
            };
            if rc != SSI_SIZE as isize {
                break;
            }

            let signo = ssi.ssi_signo as c_int;
            trace!("signalfd delivered signal {}", signo);

            let mut tables = self.tables.lock();

            if signo == libc::SIGCHLD && !tables.children.is_empty() {
                for (pid, key, status) in tables.children.reap() {
                    pending.receive_child_stat(key, pid, status);
                    delivered = true;
                }
            }

            // A delivery disarms the watch until the reactor rearms it.
            let key = match tables
                .signals
                .get_mut(signo as usize)
                .and_then(|slot| slot.as_mut())
            {
                Some(watch) if watch.armed => {
                    watch.armed = false;
                    Some(watch.key)
                }
                _ => None,
            };

            if key.is_some() || signo == libc::SIGCHLD {
                self.update_sigmask(&tables);
            }
            drop(tables);

            if let Some(key) = key {
                pending.receive_signal(key, SigInfo::from(&ssi));
                delivered = true;
            }
        }
        delivered
    }
}

impl Backend for EpollBackend {
    const HAS_BIDI_FD_WATCH: bool = true;
    const HAS_SEPARATE_RW_FD_WATCHES: bool = false;
    const INTERRUPT_AFTER_FD_ADD: bool = false;

    fn add_fd_watch(
        &self,
        fd: RawFd,
        key: WatchKey,
        mask: EventMask,
        enabled: bool,
        soft_fail: bool,
    ) -> io::Result<bool> {
        debug_assert!((key as u64) < TOKEN_DISABLED);
        let (events, token) = if enabled {
            (to_epoll(mask), key as u64)
        } else {
            (libc::EPOLLONESHOT as u32, TOKEN_DISABLED)
        };
        match self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, events, token) {
            Ok(()) => {
                debug!("added fd watch: fd={} key={}", fd, key);
                Ok(true)
            }
            Err(e) => {
                // Regular files and directories are not pollable.
                if soft_fail && e.raw_os_error() == Some(libc::EPERM) {
                    return Ok(false);
                }
                debug_assert!(
                    e.raw_os_error() != Some(libc::EEXIST),
                    "fd {} watched twice",
                    fd
                );
                Err(e)
            }
        }
    }

    fn add_bidi_fd_watch(
        &self,
        fd: RawFd,
        key: WatchKey,
        mask: EventMask,
        _emulate: bool,
    ) -> io::Result<EventMask> {
        debug_assert!((key as u64) < TOKEN_DISABLED);
        self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, to_epoll(mask), key as u64)?;
        debug!("added bidi fd watch: fd={} key={}", fd, key);
        Ok(EventMask::empty())
    }

    fn remove_fd_watch(&self, fd: RawFd, _mask: EventMask) {
        if let Err(e) = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            // The watch may already be gone if a handler removed it.
            trace!("removing fd watch for {}: {}", fd, e);
        } else {
            debug!("removed fd watch: fd={}", fd);
        }
    }

    fn remove_fd_watch_nolock(&self, fd: RawFd, mask: EventMask) {
        self.remove_fd_watch(fd, mask);
    }

    fn enable_fd_watch(&self, fd: RawFd, key: WatchKey, mask: EventMask) {
        if let Err(e) = self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, to_epoll(mask), key as u64) {
            warn!("failed to enable fd watch for {}: {}", fd, e);
        }
    }

    fn enable_fd_watch_nolock(&self, fd: RawFd, key: WatchKey, mask: EventMask) {
        self.enable_fd_watch(fd, key, mask);
    }

    fn disable_fd_watch(&self, fd: RawFd, _mask: EventMask) {
        if let Err(e) = self.epoll_ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            libc::EPOLLONESHOT as u32,
            TOKEN_DISABLED,
        ) {
            warn!("failed to disable fd watch for {}: {}", fd, e);
        }
    }

    fn disable_fd_watch_nolock(&self, fd: RawFd, mask: EventMask) {
        self.disable_fd_watch(fd, mask);
    }

    fn add_signal_watch(&self, signo: c_int, key: WatchKey) -> io::Result<()> {
        if signo < 1 || signo as usize >= MAX_SIG {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "signal number out of range",
            ));
        }
        let mut tables = self.tables.lock();
        debug_assert!(
            tables.signals[signo as usize].is_none(),
            "signal {} watched twice",
            signo
        );
        tables.signals[signo as usize] = Some(SignalWatch { key, armed: true });
        self.update_sigmask(&tables);
        debug!("added signal watch: signo={} key={}", signo, key);
        // The signal may already be pending; a blocked poller has to
        // recheck the signalfd directly.
        self.interrupt_wait();
        Ok(())
    }

    fn rearm_signal_watch_nolock(&self, signo: c_int, key: WatchKey) {
        let mut tables = self.tables.lock();
        let rearmed = match tables
            .signals
            .get_mut(signo as usize)
            .and_then(|slot| slot.as_mut())
        {
            Some(watch) => {
                watch.key = key;
                watch.armed = true;
                true
            }
            None => false,
        };
        if rearmed {
            self.update_sigmask(&tables);
            self.interrupt_wait();
        }
    }

    fn remove_signal_watch(&self, signo: c_int) {
        let mut tables = self.tables.lock();
        if let Some(slot) = tables.signals.get_mut(signo as usize) {
            *slot = None;
        }
        self.update_sigmask(&tables);
        debug!("removed signal watch: signo={}", signo);
    }

    fn remove_signal_watch_nolock(&self, signo: c_int) {
        self.remove_signal_watch(signo);
    }

    fn reserve_child_watch(&self) -> io::Result<()> {
        self.tables.lock().children.reserve()
    }

    fn add_child_watch(&self, pid: pid_t, key: WatchKey) -> io::Result<()> {
        let mut tables = self.tables.lock();
        tables.children.add(pid, key);
        self.update_sigmask(&tables);
        debug!("added child watch: pid={} key={}", pid, key);
        // The child may have exited already, with its SIGCHLD pending.
        self.interrupt_wait();
        Ok(())
    }

    fn add_reserved_child_watch(&self, pid: pid_t, key: WatchKey) {
        let mut tables = self.tables.lock();
        tables.children.add_reserved(pid, key);
        self.update_sigmask(&tables);
        debug!("added reserved child watch: pid={} key={}", pid, key);
        self.interrupt_wait();
    }

    fn remove_child_watch(&self, pid: pid_t) {
        let mut tables = self.tables.lock();
        let _ = tables.children.remove(pid);
        self.update_sigmask(&tables);
        debug!("removed child watch: pid={}", pid);
    }

    fn pull_events(&self, queue: &DispatchQueue, do_wait: bool) -> io::Result<()> {
        // Consume signals that are already pending before blocking: epoll
        // does not re-evaluate a signalfd when only its mask has changed,
        // so a signal that was pending before its watch was armed would
        // never surface through the interest list.
        let mut do_wait = do_wait;
        {
            let mut pending = queue.lock();
            if self.read_signals(&mut pending) {
                do_wait = false;
            }
        }

        let mut events: [libc::epoll_event; EVENT_BATCH] = unsafe { mem::zeroed() };
        let timeout = if do_wait { -1 } else { 0 };

        let rc = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                EVENT_BATCH as c_int,
                timeout,
            )
        };
        let count = match rc {
            -1 => {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    // Spurious wakeup; the caller loops.
                    return Ok(());
                }
                return Err(e);
            }
            0 => return Ok(()),
            n => n as usize,
        };

        trace!("loop process - {} events", count);

        let mut pending = queue.lock();
        for event in &events[..count] {
            let token = event.u64;
            let bits = event.events;
            match token {
                TOKEN_WAKEUP => self.drain_wake_pipe(),
                TOKEN_SIGNALFD => {
                    self.read_signals(&mut pending);
                }
                TOKEN_DISABLED => trace!("dropping event for disabled fd watch"),
                key => pending.receive_fd_event(key as WatchKey, from_epoll(bits)),
            }
        }

        Ok(())
    }

    fn interrupt_wait(&self) {
        // A full pipe already guarantees a wakeup.
        let rc = unsafe { libc::write(self.wake_write, b"\x01".as_ptr() as *const libc::c_void, 1) };
        if rc == -1 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EAGAIN) {
                warn!("failed to write wake byte: {}", e);
            }
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_write);
            libc::close(self.wake_read);
            libc::close(self.sigfd);
            libc::close(self.epfd);
        }
    }
}

impl fmt::Debug for EpollBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EpollBackend")
    }
}
