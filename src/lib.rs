//! A low-level file descriptor readiness multiplexer for cooperative
//! coroutine runtimes. The core of the library is [`Pollset`], of which one
//! instance exists per worker. A coroutine that blocks on a file
//! descriptor registers a [`Clause`] for the direction it waits on, the
//! scheduler then runs a wait cycle which blocks the process until at
//! least one descriptor is ready (or a timeout elapses) and fires the
//! waiting clauses back into the scheduler through the [`Trigger`] trait.
//!
//! Three backends implement the same contract; exactly one is selected at
//! build time based on the kernel:
//!
//! | Backend  | Kernel primitive | Platform |
//! |----------|------------------|----------|
//! | `poll`   | array scan       | POSIX fallback, see [`fallback`] |
//! | `epoll`  | reactor fd       | Linux, Android |
//! | `kqueue` | reactor fd       | FreeBSD, macOS, NetBSD, OpenBSD |
//!
//! # Semantics
//!
//! * Each `(fd, direction)` pair admits at most one waiting clause;
//!   callers needing more multiplex externally.
//! * Registration does not suspend, it only links state. Suspension and
//!   resumption belong to the surrounding scheduler.
//! * Consumers receive a single "ready" signal per registration and must
//!   re-register to wait again.
//! * Error and hang-up conditions fire *both* directions, so a closed or
//!   errored descriptor never leaves a coroutine blocked.
//! * Descriptor numbers are reused by the kernel; the scheduler must call
//!   `clean` just before a descriptor is closed so that the next
//!   registration of the same number re-validates it.
//! * A `Pollset` belongs to a single worker thread; there is no locking.
//!
//! # Examples
//!
//! Waiting for a pipe to become readable:
//!
//! ```
//! use std::time::Duration;
//!
//! use fdmux::{Clause, Pollset, Wakeup};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut pollset = Pollset::new()?;
//!
//! // A pipe with one byte in it, so the read end is readable.
//! let mut fds = [0; 2];
//! assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
//! let (r, w) = (fds[0], fds[1]);
//! assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
//!
//! // Register a clause waiting for readability and run one wait cycle.
//! // `Vec<Wakeup>` stands in for the scheduler.
//! let mut wakeups: Vec<Wakeup> = Vec::new();
//! pollset.wait_in(Clause(0), 0, r)?;
//! let fired = pollset.poll(&mut wakeups, Some(Duration::from_millis(100)))?;
//!
//! assert!(fired);
//! assert_eq!(wakeups, &[Wakeup { clause: Clause(0), id: 0, rc: 0 }]);
//! # unsafe { libc::close(r) };
//! # unsafe { libc::close(w) };
//! # Ok(())
//! # }
//! ```

#![warn(anonymous_parameters,
        bare_trait_objects,
        missing_debug_implementations,
        missing_docs,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
        variant_size_differences,
)]

mod clause;
mod fd;
mod sys;

pub use crate::clause::{Clause, Trigger, Wakeup};
pub use crate::sys::Pollset;

pub mod fallback {
    //! The portable backend based on the `poll(2)` array scan.
    //!
    //! This backend is compiled on every platform, next to the reactor
    //! backend re-exported as the crate's [`Pollset`], so the portable
    //! code path can be exercised anywhere.
    //!
    //! [`Pollset`]: crate::Pollset

    pub use crate::sys::unix::poll::Pollset;
}
