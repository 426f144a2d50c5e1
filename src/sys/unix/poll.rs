use std::cmp::min;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{fmt, io};

use log::trace;

use crate::clause::{Clause, Trigger, Waiter};
use crate::fd;

/// Sentinel for a descriptor without a slot in the pollfd array.
const NO_IDX: u32 = u32::MAX;

// Error conditions satisfy both directions: a closed or errored descriptor
// must never leave a coroutine blocked.
const IN_EVENTS: libc::c_short =
    libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
const OUT_EVENTS: libc::c_short =
    libc::POLLOUT | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Readiness multiplexer backed by the portable `poll(2)` array scan.
///
/// Waiting descriptors live in a packed `pollfd` array; each descriptor's
/// `FdInfo` records its slot index so that registration and removal stay
/// O(1). Slots whose event mask drops to zero are removed by swapping in
/// the last entry of the array.
pub struct Pollset {
    /// Per-descriptor bookkeeping, indexed directly by fd number.
    fds: Box<[FdInfo]>,
    /// The packed array passed to `poll(2)`.
    pollset: Vec<libc::pollfd>,
}

#[derive(Clone, Debug)]
struct FdInfo {
    in_waiter: Option<Waiter>,
    out_waiter: Option<Waiter>,
    /// The descriptor has been verified to be a live kernel fd. Cleared
    /// only by `clean`.
    cached: bool,
    /// Slot in `pollset`, or `NO_IDX`.
    idx: u32,
}

impl FdInfo {
    const UNUSED: FdInfo = FdInfo {
        in_waiter: None,
        out_waiter: None,
        cached: false,
        idx: NO_IDX,
    };
}

impl Pollset {
    /// Create a new pollset, with the descriptor table sized to the
    /// `RLIMIT_NOFILE` soft limit.
    pub fn new() -> io::Result<Pollset> {
        Ok(Pollset {
            fds: vec![FdInfo::UNUSED; fd::max_fds()].into_boxed_slice(),
            pollset: Vec::new(),
        })
    }

    /// Register `clause` to fire once `fd` becomes readable.
    ///
    /// Fails with `EBADF` if the descriptor is not open and with `EBUSY` if
    /// another clause is already waiting for readability on it.
    pub fn wait_in(&mut self, clause: Clause, id: usize, fd: RawFd) -> io::Result<()> {
        trace!("registering read waiter: fd={}, clause={}", fd, clause);
        let idx = self.slot_for(fd)?;
        if self.fds[fd as usize].in_waiter.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.pollset[idx].events |= libc::POLLIN;
        self.fds[fd as usize].in_waiter = Some(Waiter { clause, id });
        Ok(())
    }

    /// Register `clause` to fire once `fd` becomes writable.
    ///
    /// Same errors as [`wait_in`].
    ///
    /// [`wait_in`]: Pollset::wait_in
    pub fn wait_out(&mut self, clause: Clause, id: usize, fd: RawFd) -> io::Result<()> {
        trace!("registering write waiter: fd={}, clause={}", fd, clause);
        let idx = self.slot_for(fd)?;
        if self.fds[fd as usize].out_waiter.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.pollset[idx].events |= libc::POLLOUT;
        self.fds[fd as usize].out_waiter = Some(Waiter { clause, id });
        Ok(())
    }

    /// Unlink the read waiter from `fd` without triggering it.
    ///
    /// This is the clause teardown hook: when one clause of a choose
    /// operation fires, its siblings are cancelled through it.
    pub fn cancel_in(&mut self, fd: RawFd) {
        trace!("cancelling read waiter: fd={}", fd);
        if fd < 0 || fd as usize >= self.fds.len() {
            return;
        }
        let fdi = &mut self.fds[fd as usize];
        fdi.in_waiter = None;
        if fdi.idx != NO_IDX {
            self.pollset[fdi.idx as usize].events &= !libc::POLLIN;
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
        if fdi.idx != NO_IDX {
            self.pollset[fdi.idx as usize].events &= !libc::POLLOUT;
        }
    }

    /// Declare that `fd` is about to be closed or reused.
    ///
    /// Drops the descriptor's slot and forgets the cached validation, so
    /// the next registration re-probes the kernel. Must not be called with
    /// a waiter still linked.
    pub fn clean(&mut self, fd: RawFd) {
        trace!("cleaning fd={}", fd);
        if fd < 0 || fd as usize >= self.fds.len() {
            return;
        }
        let fdi = &mut self.fds[fd as usize];
        assert!(fdi.in_waiter.is_none() && fdi.out_waiter.is_none(),
            "clean of fd {} with a live waiter", fd);
        fdi.cached = false;
        let idx = fdi.idx;
        if idx != NO_IDX {
            fdi.idx = NO_IDX;
            self.remove_slot(idx as usize);
        }
    }

    /// Run a single wait cycle.
    ///
    /// Blocks up to `timeout` (`None` blocks indefinitely, a zero duration
    /// is a non-blocking probe) and fires the clauses of all descriptors
    /// the kernel reports ready, with result code 0. Returns `Ok(true)`
    /// iff at least one clause fired, `Ok(false)` if the timeout elapsed
    /// first. An error with kind `Interrupted` means the wait was aborted
    /// by a signal before any event; the caller retries.
    pub fn poll<T>(&mut self, trigger: &mut T, timeout: Option<Duration>) -> io::Result<bool>
        where T: Trigger,
    {
        trace!("polling: fds={}, timeout={:?}", self.pollset.len(), timeout);
        let timeout_ms = timeout.map(duration_to_millis).unwrap_or(-1);
        let n = unsafe {
            libc::poll(self.pollset.as_mut_ptr(),
                self.pollset.len() as libc::nfds_t, timeout_ms)
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(err);
            }
            panic!("unexpected poll(2) error: {}", err);
        }

        let mut left = n as usize;
        let mut fired = false;
        let mut i = 0;
        while i != self.pollset.len() && left != 0 {
            let revents = self.pollset[i].revents;
            if revents == 0 {
                i += 1;
                continue;
            }
            left -= 1;
            let fd = self.pollset[i].fd as usize;
            if revents & IN_EVENTS != 0 {
                if let Some(waiter) = self.fds[fd].in_waiter.take() {
                    self.pollset[i].events &= !libc::POLLIN;
                    trigger.trigger(waiter.clause, waiter.id, 0);
                    fired = true;
                }
            }
            if revents & OUT_EVENTS != 0 {
                if let Some(waiter) = self.fds[fd].out_waiter.take() {
                    self.pollset[i].events &= !libc::POLLOUT;
                    trigger.trigger(waiter.clause, waiter.id, 0);
                    fired = true;
                }
            }
            if self.pollset[i].events == 0 {
                // Nobody is interested in the descriptor anymore. The
                // entry swapped into the vacated slot is re-examined in
                // this same cycle.
                self.fds[fd].idx = NO_IDX;
                self.remove_slot(i);
            } else {
                i += 1;
            }
        }
        Ok(fired)
    }

    /// Ensure `fd` is validated and owns a slot in the pollfd array,
    /// returning the slot index.
    fn slot_for(&mut self, fd: RawFd) -> io::Result<usize> {
        if fd < 0 || fd as usize >= self.fds.len() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let fdi = &mut self.fds[fd as usize];
        if fdi.idx != NO_IDX {
            return Ok(fdi.idx as usize);
        }
        if !fdi.cached {
            // Validation only, the returned flags carry no meaning here.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EBADF) {
                    return Err(err);
                }
                panic!("unexpected fcntl(F_GETFD) error: {}", err);
            }
            fdi.cached = true;
        }
        let idx = self.pollset.len();
        fdi.idx = idx as u32;
        self.pollset.push(libc::pollfd { fd, events: 0, revents: 0 });
        Ok(idx)
    }

    /// Remove a slot from the packed array, swapping in the last entry and
    /// fixing up its back reference.
    fn remove_slot(&mut self, idx: usize) {
        drop(self.pollset.swap_remove(idx));
        if idx != self.pollset.len() {
            let moved_fd = self.pollset[idx].fd as usize;
            assert_eq!(self.fds[moved_fd].idx as usize, self.pollset.len(),
                "pollfd array out of sync with the descriptor table");
            self.fds[moved_fd].idx = idx as u32;
        }
    }
}

impl fmt::Debug for Pollset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pollset")
            .field("pollset_size", &self.pollset.len())
            .finish()
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
