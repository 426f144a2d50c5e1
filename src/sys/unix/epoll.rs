use std::cmp::min;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, mem};

use log::{error, trace};

use crate::clause::{Clause, Trigger, Waiter};
use crate::fd;
use crate::sys::EVENTS_CAP;

/// End-of-changelist sentinel. A `next` link of 0 means "not linked".
const ENDLIST: u32 = u32::MAX;

// Error and hang-up conditions satisfy both directions: a closed or
// errored descriptor must never leave a coroutine blocked.
const IN_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32;
const OUT_EVENTS: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Readiness multiplexer backed by a Linux epoll instance.
///
/// Kernel-side registrations are not updated on every `wait_in`/`wait_out`
/// or wake-up. Instead descriptors whose desired registration may differ
/// from the one the kernel holds are pushed onto an intrusive *changelist*
/// (a singly linked stack threaded through the descriptor table) and
/// reconciled in a single pass at the start of the next [`poll`] cycle.
///
/// [`poll`]: Pollset::poll
#[derive(Debug)]
pub struct Pollset {
    efd: RawFd,
    /// Per-descriptor bookkeeping, indexed directly by fd number.
    fds: Box<[FdInfo]>,
    /// Head of the changelist: fd + 1, or `ENDLIST` when empty.
    changelist: u32,
}

#[derive(Clone, Debug)]
struct FdInfo {
    in_waiter: Option<Waiter>,
    out_waiter: Option<Waiter>,
    /// The descriptor has been verified live and is represented in the
    /// kernel pollset. Cleared only by `clean`.
    cached: bool,
    /// Event mask currently registered with the kernel.
    currevs: u32,
    /// Changelist link: 0 = not linked, otherwise fd + 1 of the next
    /// entry, or `ENDLIST` at the tail.
    next: u32,
}

impl FdInfo {
    const UNUSED: FdInfo = FdInfo {
        in_waiter: None,
        out_waiter: None,
        cached: false,
        currevs: 0,
        next: 0,
    };
}

impl Pollset {
    /// Create a new pollset: an epoll instance plus a descriptor table
    /// sized to the `RLIMIT_NOFILE` soft limit.
    pub fn new() -> io::Result<Pollset> {
        let efd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if efd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pollset {
            efd,
            fds: vec![FdInfo::UNUSED; fd::max_fds()].into_boxed_slice(),
            changelist: ENDLIST,
        })
    }

    /// Register `clause` to fire once `fd` becomes readable.
    ///
    /// Fails with `EBADF` if the descriptor is not open, `EBUSY` if
    /// another clause is already waiting for readability on it and
    /// `ENOTSUP` if the kernel refuses to poll this kind of descriptor
    /// (e.g. a regular file).
    pub fn wait_in(&mut self, clause: Clause, id: usize, fd: RawFd) -> io::Result<()> {
        trace!("registering read waiter: fd={}, clause={}", fd, clause);
        if fd < 0 || fd as usize >= self.fds.len() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let fdi = &mut self.fds[fd as usize];
        if fdi.in_waiter.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if !fdi.cached {
            // A fresh descriptor goes straight into the kernel pollset,
            // doubling as the liveness probe.
            epoll_ctl(self.efd, libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
                .map_err(not_pollable)?;
            fdi.currevs = libc::EPOLLIN as u32;
            fdi.next = 0;
            fdi.cached = true;
        } else if fdi.next == 0 {
            fdi.next = self.changelist;
            self.changelist = fd as u32 + 1;
        }
        fdi.in_waiter = Some(Waiter { clause, id });
        Ok(())
    }

    /// Register `clause` to fire once `fd` becomes writable.
    ///
    /// Same errors as [`wait_in`].
    ///
    /// [`wait_in`]: Pollset::wait_in
    pub fn wait_out(&mut self, clause: Clause, id: usize, fd: RawFd) -> io::Result<()> {
        trace!("registering write waiter: fd={}, clause={}", fd, clause);
        if fd < 0 || fd as usize >= self.fds.len() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let fdi = &mut self.fds[fd as usize];
        if fdi.out_waiter.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if !fdi.cached {
            epoll_ctl(self.efd, libc::EPOLL_CTL_ADD, fd, libc::EPOLLOUT as u32)
                .map_err(not_pollable)?;
            fdi.currevs = libc::EPOLLOUT as u32;
            fdi.next = 0;
            fdi.cached = true;
        } else if fdi.next == 0 {
            fdi.next = self.changelist;
            self.changelist = fd as u32 + 1;
        }
        fdi.out_waiter = Some(Waiter { clause, id });
        Ok(())
    }

    /// Unlink the read waiter from `fd` without triggering it.
    ///
    /// This is the clause teardown hook: when one clause of a choose
    /// operation fires, its siblings are cancelled through it. The
    /// descriptor is queued so the next poll cycle drops the dead
    /// direction from the kernel registration.
    pub fn cancel_in(&mut self, fd: RawFd) {
        trace!("cancelling read waiter: fd={}", fd);
        if fd < 0 || fd as usize >= self.fds.len() {
            return;
        }
        let fdi = &mut self.fds[fd as usize];
        fdi.in_waiter = None;
        if fdi.next == 0 {
            fdi.next = self.changelist;
            self.changelist = fd as u32 + 1;
        }
    }

    /// Unlink the write waiter from `fd` without triggering it.
    pub fn cancel_out(&mut self, fd: RawFd) {
        trace!("cancelling write waiter: fd={}", fd);
        if fd < 0 || fd as usize >= self.fds.len() {
            return;
        }
        let fdi = &mut self.fds[fd as usize];
        fdi.out_waiter = None;
        if fdi.next == 0 {
            fdi.next = self.changelist;
            self.changelist = fd as u32 + 1;
        }
    }

    /// Declare that `fd` is about to be closed or reused.
    ///
    /// Evicts the descriptor from the kernel pollset, unlinks it from the
    /// changelist and forgets the cached validation, so the next
    /// registration re-probes the kernel. Must not be called with a
    /// waiter still linked.
    pub fn clean(&mut self, fd: RawFd) {
        trace!("cleaning fd={}", fd);
        if fd < 0 || fd as usize >= self.fds.len() {
            return;
        }
        let fdi = &mut self.fds[fd as usize];
        assert!(fdi.in_waiter.is_none() && fdi.out_waiter.is_none(),
            "clean of fd {} with a live waiter", fd);
        if !fdi.cached {
            return;
        }
        if fdi.currevs != 0 {
            // The registration may already have been dropped by a
            // reconciliation pass racing the caller's bookkeeping.
            if let Err(err) = epoll_ctl(self.efd, libc::EPOLL_CTL_DEL, fd, 0) {
                assert_eq!(err.raw_os_error(), Some(libc::ENOENT),
                    "epoll_ctl(EPOLL_CTL_DEL) failed: {}", err);
            }
            fdi.currevs = 0;
        }
        fdi.cached = false;
        if fdi.next != 0 {
            self.unlink(fd as u32);
        }
    }

    /// Run a single wait cycle.
    ///
    /// First reconciles the changelist with the kernel, then blocks up to
    /// `timeout` (`None` blocks indefinitely, a zero duration is a
    /// non-blocking probe) and fires the clauses of all descriptors the
    /// kernel reports ready, with result code 0. Returns `Ok(true)` iff
    /// at least one clause fired, `Ok(false)` if the timeout elapsed
    /// first. An error with kind `Interrupted` means the wait was aborted
    /// by a signal before any event; the caller retries.
    pub fn poll<T>(&mut self, trigger: &mut T, timeout: Option<Duration>) -> io::Result<bool>
        where T: Trigger,
    {
        self.apply_changes();

        trace!("polling: timeout={:?}", timeout);
        let mut events: [libc::epoll_event; EVENTS_CAP] = unsafe { mem::zeroed() };
        let timeout_ms = timeout.map(duration_to_millis).unwrap_or(-1);
        let n = unsafe {
            libc::epoll_wait(self.efd, events.as_mut_ptr(),
                EVENTS_CAP as libc::c_int, timeout_ms)
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(err);
            }
            panic!("unexpected epoll_wait error: {}", err);
        }

        let mut fired = false;
        for event in &events[..n as usize] {
            let fd = event.u64 as usize;
            let revents = event.events;
            let fdi = &mut self.fds[fd];
            if revents & IN_EVENTS != 0 {
                if let Some(waiter) = fdi.in_waiter.take() {
                    trigger.trigger(waiter.clause, waiter.id, 0);
                    fired = true;
                }
            }
            if revents & OUT_EVENTS != 0 {
                if let Some(waiter) = fdi.out_waiter.take() {
                    trigger.trigger(waiter.clause, waiter.id, 0);
                    fired = true;
                }
            }
            // A direction without a waiter has a stale kernel
            // registration; queue the descriptor so the next cycle drops
            // that direction from the kernel mask.
            if fdi.next == 0 && (fdi.in_waiter.is_none() || fdi.out_waiter.is_none()) {
                fdi.next = self.changelist;
                self.changelist = fd as u32 + 1;
            }
        }
        Ok(fired)
    }

    /// Reconcile the kernel registration of every descriptor on the
    /// changelist with its waiter slots, draining the list.
    fn apply_changes(&mut self) {
        let mut item = self.changelist;
        self.changelist = ENDLIST;
        while item != ENDLIST {
            let fd = (item - 1) as usize;
            let fdi = &mut self.fds[fd];
            item = fdi.next;
            fdi.next = 0;

            let mut desired = 0;
            if fdi.in_waiter.is_some() {
                desired |= libc::EPOLLIN as u32;
            }
            if fdi.out_waiter.is_some() {
                desired |= libc::EPOLLOUT as u32;
            }
            if desired == fdi.currevs {
                continue;
            }
            let op = if desired == 0 {
                libc::EPOLL_CTL_DEL
            } else if fdi.currevs == 0 {
                libc::EPOLL_CTL_ADD
            } else {
                libc::EPOLL_CTL_MOD
            };
            if let Err(err) = epoll_ctl(self.efd, op, fd as RawFd, desired) {
                panic!("epoll_ctl reconciliation of fd {} failed: {}", fd, err);
            }
            fdi.currevs = desired;
        }
    }

    /// Unlink `fd` from the changelist by walking from the head. The
    /// caller must know the descriptor is linked.
    fn unlink(&mut self, fd: u32) {
        let target = fd + 1;
        let next = self.fds[fd as usize].next;
        if self.changelist == target {
            self.changelist = next;
        } else {
            let mut prev = self.changelist;
            loop {
                assert_ne!(prev, ENDLIST, "fd {} not on the changelist", fd);
                let p = (prev - 1) as usize;
                if self.fds[p].next == target {
                    self.fds[p].next = next;
                    break;
                }
                prev = self.fds[p].next;
            }
        }
        self.fds[fd as usize].next = 0;
    }
}

impl Drop for Pollset {
    fn drop(&mut self) {
        if unsafe { libc::close(self.efd) } == -1 {
            let err = io::Error::last_os_error();
            error!("error closing epoll instance: {}", err);
        }
    }
}

/// Translate the errors epoll returns for descriptor kinds it cannot
/// monitor (regular files, the epoll fd itself) into `ENOTSUP`.
fn not_pollable(err: io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::ELOOP) =>
            io::Error::from_raw_os_error(libc::ENOTSUP),
        _ => err,
    }
}

fn epoll_ctl(efd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
    let mut event = libc::epoll_event { events, u64: fd as u64 };
    if unsafe { libc::epoll_ctl(efd, op, fd, &mut event) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

const MILLIS_PER_SEC: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Convert a `Duration` to milliseconds, rounding up, capped at
/// `c_int::MAX`. A zero duration stays zero so that a non-blocking probe
/// remains non-blocking.
fn duration_to_millis(duration: Duration) -> libc::c_int {
    let subsec_millis =
        (u64::from(duration.subsec_nanos()) + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI;
    let millis = duration.as_secs().saturating_mul(MILLIS_PER_SEC)
        .saturating_add(subsec_millis);
    min(millis, libc::c_int::MAX as u64) as libc::c_int
}
