use std::cmp::min;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, mem, ptr};

use log::trace;

use crate::clause::{Clause, Trigger, Waiter};
use crate::fd;
use crate::sys::EVENTS_CAP;

// Of course each OS that implements kqueue has chosen to go for different
// types in the `kevent` structure, hence the type definitions below.

// Type of `nchanges` in the `kevent` system call.
#[cfg(not(target_os = "netbsd"))]
#[allow(non_camel_case_types)]
type nchanges_t = libc::c_int;
#[cfg(target_os = "netbsd")]
#[allow(non_camel_case_types)]
type nchanges_t = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
#[allow(non_camel_case_types)]
type kevent_filter_t = libc::c_short;
#[cfg(target_os = "macos")]
#[allow(non_camel_case_types)]
type kevent_filter_t = i16;
#[cfg(target_os = "netbsd")]
#[allow(non_camel_case_types)]
type kevent_filter_t = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
#[allow(non_camel_case_types)]
type kevent_flags_t = libc::c_ushort;
#[cfg(target_os = "macos")]
#[allow(non_camel_case_types)]
type kevent_flags_t = u16;
#[cfg(target_os = "netbsd")]
#[allow(non_camel_case_types)]
type kevent_flags_t = u32;

// Type of the `udata` field in the `kevent` structure.
#[cfg(any(target_os = "freebsd", target_os = "macos", target_os = "openbsd"))]
#[allow(non_camel_case_types)]
type kevent_udata_t = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
#[allow(non_camel_case_types)]
type kevent_udata_t = libc::intptr_t;

/// End-of-changelist sentinel. A `next` link of 0 means "not linked".
const ENDLIST: u32 = u32::MAX;

/// Size of the batched kernel change buffer.
const CHANGES_CAP: usize = 128;

// Direction bits for `currevs` and `firing`.
const IN: u8 = 1;
const OUT: u8 = 2;

/// Readiness multiplexer backed by a BSD kqueue instance.
///
/// kqueue registers filters, not event masks, so a single state transition
/// may need up to two kernel change entries for the same descriptor (one
/// per direction). Pending changes are tracked on an intrusive
/// *changelist* threaded through the descriptor table and turned into a
/// batched change buffer at the start of every [`poll`] cycle; the same
/// list doubles as the dispatch worklist for descriptors the kernel
/// reports ready.
///
/// [`poll`]: Pollset::poll
#[derive(Debug)]
pub struct Pollset {
    kfd: RawFd,
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
    /// Direction bits currently registered with the kernel.
    currevs: u8,
    /// Direction bits reported by the most recent wait, joined across
    /// multiple kernel events for the same descriptor.
    firing: u8,
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
        firing: 0,
        next: 0,
    };
}

impl Pollset {
    /// Create a new pollset: a kqueue instance plus a descriptor table
    /// sized to the `RLIMIT_NOFILE` soft limit.
    pub fn new() -> io::Result<Pollset> {
        let kfd = unsafe { libc::kqueue() };
        if kfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pollset {
            kfd,
            fds: vec![FdInfo::UNUSED; fd::max_fds()].into_boxed_slice(),
            changelist: ENDLIST,
        })
    }

    /// Register `clause` to fire once `fd` becomes readable.
    ///
    /// Fails with `EBADF` if the descriptor is not open and with `EBUSY`
    /// if another clause is already waiting for readability on it.
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
            register(self.kfd, fd, libc::EVFILT_READ)?;
            fdi.currevs = IN;
            fdi.firing = 0;
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
            register(self.kfd, fd, libc::EVFILT_WRITE)?;
            fdi.currevs = OUT;
            fdi.firing = 0;
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
    /// Evicts whichever filters are registered for the descriptor,
    /// unlinks it from the changelist and forgets the cached validation,
    /// so the next registration re-probes the kernel. Must not be called
    /// with a waiter still linked.
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
        let mut changes: [libc::kevent; 2] = unsafe { mem::zeroed() };
        let mut nchanges = 0;
        if fdi.currevs & IN != 0 {
            changes[nchanges] =
                new_kevent(fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_DELETE);
            nchanges += 1;
        }
        if fdi.currevs & OUT != 0 {
            changes[nchanges] =
                new_kevent(fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_DELETE);
            nchanges += 1;
        }
        if nchanges != 0 {
            let rc = unsafe {
                libc::kevent(self.kfd, changes.as_ptr(), nchanges as nchanges_t,
                    ptr::null_mut(), 0, ptr::null())
            };
            if rc == -1 {
                // The registration may already have been dropped by a
                // reconciliation pass racing the caller's bookkeeping.
                let err = io::Error::last_os_error();
                assert_eq!(err.raw_os_error(), Some(libc::ENOENT),
                    "kevent(EV_DELETE) failed: {}", err);
            }
            fdi.currevs = 0;
        }
        fdi.firing = 0;
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
        let mut changes: [libc::kevent; CHANGES_CAP] = unsafe { mem::zeroed() };
        let mut nchanges = 0;

        while self.changelist != ENDLIST {
            // Flush while one empty entry is still left so that both
            // filters of the next descriptor always fit into one batch.
            if nchanges >= CHANGES_CAP - 1 {
                flush_changes(self.kfd, &changes[..nchanges]);
                nchanges = 0;
            }
            let fd = (self.changelist - 1) as usize;
            let fdi = &mut self.fds[fd];
            if fdi.in_waiter.is_some() {
                if fdi.currevs & IN == 0 {
                    changes[nchanges] = new_kevent(
                        fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_ADD);
                    fdi.currevs |= IN;
                    nchanges += 1;
                }
            } else if fdi.currevs & IN != 0 {
                changes[nchanges] = new_kevent(
                    fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_DELETE);
                fdi.currevs &= !IN;
                nchanges += 1;
            }
            if fdi.out_waiter.is_some() {
                if fdi.currevs & OUT == 0 {
                    changes[nchanges] = new_kevent(
                        fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_ADD);
                    fdi.currevs |= OUT;
                    nchanges += 1;
                }
            } else if fdi.currevs & OUT != 0 {
                changes[nchanges] = new_kevent(
                    fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_DELETE);
                fdi.currevs &= !OUT;
                nchanges += 1;
            }
            fdi.firing = 0;
            self.changelist = fdi.next;
            fdi.next = 0;
        }

        // Hand the remaining changes to the kernel together with the wait.
        trace!("polling: timeout={:?}", timeout);
        let mut events: [libc::kevent; EVENTS_CAP] = unsafe { mem::zeroed() };
        let timespec = timeout.map(timespec_from_duration);
        let timespec_ptr = timespec
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(ptr::null());
        let n = unsafe {
            libc::kevent(self.kfd, changes.as_ptr(), nchanges as nchanges_t,
                events.as_mut_ptr(), EVENTS_CAP as nchanges_t, timespec_ptr)
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(err);
            }
            panic!("unexpected kevent error: {}", err);
        }

        // Join the events on a per-descriptor basis, reusing the
        // changelist as the dispatch worklist.
        for event in &events[..n as usize] {
            let data = event.data;
            assert!(event.flags & libc::EV_ERROR == 0,
                "kevent reported error on fd {}: {}", event.ident,
                io::Error::from_raw_os_error(data as i32));
            let fd = event.ident as usize;
            let fdi = &mut self.fds[fd];
            if event.flags & libc::EV_EOF != 0 {
                // A half-closed or closed endpoint readies both
                // directions, even though the kernel reports one filter.
                fdi.firing |= IN | OUT;
            } else {
                if event.filter == libc::EVFILT_READ {
                    fdi.firing |= IN;
                }
                if event.filter == libc::EVFILT_WRITE {
                    fdi.firing |= OUT;
                }
            }
            if fdi.next == 0 {
                fdi.next = self.changelist;
                self.changelist = fd as u32 + 1;
            }
        }

        // Fire the clauses. The walk leaves the entries linked so the
        // next cycle reconciles the now waiter-less directions.
        let mut fired = false;
        let mut item = self.changelist;
        while item != ENDLIST {
            let fd = (item - 1) as usize;
            let fdi = &mut self.fds[fd];
            if fdi.firing & IN != 0 {
                if let Some(waiter) = fdi.in_waiter.take() {
                    trigger.trigger(waiter.clause, waiter.id, 0);
                    fired = true;
                }
            }
            if fdi.firing & OUT != 0 {
                if let Some(waiter) = fdi.out_waiter.take() {
                    trigger.trigger(waiter.clause, waiter.id, 0);
                    fired = true;
                }
            }
            fdi.firing = 0;
            item = fdi.next;
        }
        Ok(fired)
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
        // Closing a kqueue fd is known to fail in the child after
        // fork(2), so the result is deliberately ignored.
        let _ = unsafe { libc::close(self.kfd) };
    }
}

/// Register a single filter for `fd`, used for the initial liveness
/// probing registration.
fn register(kfd: RawFd, fd: RawFd, filter: kevent_filter_t) -> io::Result<()> {
    let change = new_kevent(fd as libc::uintptr_t, filter, libc::EV_ADD);
    let rc = unsafe {
        libc::kevent(kfd, &change, 1, ptr::null_mut(), 0, ptr::null())
    };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBADF) {
            return Err(err);
        }
        panic!("unexpected kevent registration error: {}", err);
    }
    Ok(())
}

/// Apply a full batch of changes without waiting for events.
fn flush_changes(kfd: RawFd, changes: &[libc::kevent]) {
    let rc = unsafe {
        libc::kevent(kfd, changes.as_ptr(), changes.len() as nchanges_t,
            ptr::null_mut(), 0, ptr::null())
    };
    assert_ne!(rc, -1,
        "kevent change flush failed: {}", io::Error::last_os_error());
}

/// Create a new `kevent`.
fn new_kevent(ident: libc::uintptr_t, filter: kevent_filter_t, flags: kevent_flags_t) -> libc::kevent {
    libc::kevent {
        ident, filter, flags,
        fflags: 0,
        data: 0,
        udata: 0 as kevent_udata_t,
    }
}

/// Create a `timespec` from a duration.
fn timespec_from_duration(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: min(duration.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
        // `Duration::subsec_nanos` is guaranteed to be less than one
        // billion, making the cast to i32 safe. The cast itself is needed
        // for platforms where C's long is only 32 bits.
        tv_nsec: libc::c_long::from(duration.subsec_nanos() as i32),
    }
}
