//! Collection of testing utilities.

// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::os::unix::io::RawFd;
use std::time::Duration;

/// Allowed margin for deadlines to be overrun.
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

/// Initialise the test setup, things like logging etc.
pub fn init() {
    let env = env_logger::Env::new().filter("LOG_LEVEL");
    // The logger could already be set, so we ignore the result.
    drop(env_logger::try_init_from_env(env));
}

/// A raw file descriptor, closed on drop.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    /// Returns the raw descriptor.
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Close the descriptor now rather than on drop.
    pub fn close(mut self) {
        assert_eq!(unsafe { libc::close(self.0) }, 0, "unable to close fd");
        self.0 = -1;
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            let _ = unsafe { libc::close(self.0) };
        }
    }
}

/// Create a new non-blocking pipe, returning the (read, write) ends.
pub fn pipe() -> (Fd, Fd) {
    let mut fds: [RawFd; 2] = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "unable to create pipe");
    for fd in &fds {
        assert_ne!(unsafe { libc::fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK) }, -1,
            "unable to make pipe non-blocking");
    }
    (Fd(fds[0]), Fd(fds[1]))
}

/// Create a connected non-blocking Unix stream socket pair.
pub fn socket_pair() -> (Fd, Fd) {
    let mut fds: [RawFd; 2] = [0; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0, "unable to create socket pair");
    for fd in &fds {
        assert_ne!(unsafe { libc::fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK) }, -1,
            "unable to make socket non-blocking");
    }
    (Fd(fds[0]), Fd(fds[1]))
}

/// Write a single byte into `fd`, asserting success.
pub fn write_byte(fd: &Fd) {
    assert_eq!(unsafe { libc::write(fd.raw(), b"x".as_ptr().cast(), 1) }, 1,
        "unable to write to fd");
}

/// A descriptor number inside the table bounds that was never opened.
pub fn unopened_fd() -> RawFd {
    let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) }, 0);
    if rlim.rlim_cur == libc::RLIM_INFINITY {
        return 65_535;
    }
    (rlim.rlim_cur - 1) as RawFd
}

/// Instantiate the end-to-end scenario suite against a backend. All
/// scenarios are backend independent; the suite runs once against the
/// platform default `Pollset` and once against the `poll(2)` fallback.
macro_rules! pollset_tests {
    ($pollset:ty) => {
        #[test]
        fn pipe_ready() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, w) = crate::util::pipe();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();
            crate::util::write_byte(&w);
            let fired = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap();
            assert!(fired);
            assert_eq!(wakeups, &[
                fdmux::Wakeup { clause: fdmux::Clause(1), id: 1, rc: 0 },
            ]);

            // The registration is gone: the next cycle is a timeout even
            // though the byte is still in the pipe.
            wakeups.clear();
            let fired = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(0)))
                .unwrap();
            assert!(!fired);
            assert!(wakeups.is_empty());
        }

        #[test]
        fn timeout_no_op() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            let timeout = std::time::Duration::from_millis(10);
            let start = std::time::Instant::now();
            let fired = pollset.poll(&mut wakeups, Some(timeout)).unwrap();
            let elapsed = start.elapsed();

            assert!(!fired);
            assert!(wakeups.is_empty());
            assert!(elapsed >= timeout, "returned too early: {:?}", elapsed);
            assert!(elapsed <= timeout + crate::util::TIMEOUT_MARGIN,
                "returned too late: {:?}", elapsed);
        }

        #[test]
        fn nonblocking_probe() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            let start = std::time::Instant::now();
            let fired = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(0)))
                .unwrap();
            assert!(!fired);
            assert!(start.elapsed() < crate::util::TIMEOUT_MARGIN);
        }

        #[test]
        fn dual_direction_coalescing() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (a, b) = crate::util::socket_pair();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            pollset.wait_in(fdmux::Clause(1), 1, a.raw()).unwrap();
            pollset.wait_out(fdmux::Clause(2), 2, a.raw()).unwrap();
            crate::util::write_byte(&b);

            // The socket is readable and writable at once; a single cycle
            // must wake both waiters.
            let fired = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap();
            assert!(fired);
            wakeups.sort_by_key(|wakeup| wakeup.id);
            assert_eq!(wakeups, &[
                fdmux::Wakeup { clause: fdmux::Clause(1), id: 1, rc: 0 },
                fdmux::Wakeup { clause: fdmux::Clause(2), id: 2, rc: 0 },
            ]);
        }

        #[test]
        fn hangup_broadcasts() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (a, b) = crate::util::socket_pair();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            pollset.wait_in(fdmux::Clause(1), 1, a.raw()).unwrap();
            pollset.wait_out(fdmux::Clause(2), 2, a.raw()).unwrap();
            // Closing the peer must wake both directions within one cycle.
            b.close();

            let fired = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap();
            assert!(fired);
            wakeups.sort_by_key(|wakeup| wakeup.id);
            assert_eq!(wakeups, &[
                fdmux::Wakeup { clause: fdmux::Clause(1), id: 1, rc: 0 },
                fdmux::Wakeup { clause: fdmux::Clause(2), id: 2, rc: 0 },
            ]);
        }

        #[test]
        fn already_registered() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, w) = crate::util::pipe();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();
            let err = pollset.wait_in(fdmux::Clause(2), 2, r.raw()).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

            // The original waiter is untouched by the failed registration.
            crate::util::write_byte(&w);
            let fired = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap();
            assert!(fired);
            assert_eq!(wakeups, &[
                fdmux::Wakeup { clause: fdmux::Clause(1), id: 1, rc: 0 },
            ]);

            // Same rule for the write direction.
            let (r2, w2) = crate::util::pipe();
            pollset.wait_out(fdmux::Clause(3), 3, w2.raw()).unwrap();
            let err = pollset.wait_out(fdmux::Clause(4), 4, w2.raw()).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
            drop(r2);
        }

        #[test]
        fn bad_fd() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();

            // Negative descriptors.
            let err = pollset.wait_in(fdmux::Clause(1), 1, -1).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));
            let err = pollset.wait_out(fdmux::Clause(1), 1, -1).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));

            // A descriptor number that was never opened.
            let unopened = crate::util::unopened_fd();
            let err = pollset.wait_in(fdmux::Clause(1), 1, unopened).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));
            let err = pollset.wait_out(fdmux::Clause(1), 1, unopened).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        }

        #[test]
        fn fd_reuse_after_clean() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, w) = crate::util::pipe();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();
            crate::util::write_byte(&w);
            assert!(pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap());

            // Declare the descriptor gone, then actually close it.
            pollset.clean(r.raw());
            r.close();
            w.close();

            // The freshly released numbers are usually handed right back
            // by the kernel, but nothing below depends on that.
            let (r2, w2) = crate::util::pipe();
            wakeups.clear();
            pollset.wait_in(fdmux::Clause(2), 2, r2.raw()).unwrap();
            // No readiness inherited from the previous life of the number.
            assert!(!pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(10)))
                .unwrap());
            assert!(wakeups.is_empty());

            crate::util::write_byte(&w2);
            assert!(pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap());
            assert_eq!(wakeups, &[
                fdmux::Wakeup { clause: fdmux::Clause(2), id: 2, rc: 0 },
            ]);
        }

        #[test]
        fn idempotent_clean() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, _w) = crate::util::pipe();

            // Clean of a never-registered descriptor is a no-op.
            pollset.clean(r.raw());
            pollset.clean(r.raw());

            // And of a registered one, once its waiter is cancelled.
            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();
            pollset.cancel_in(r.raw());
            pollset.clean(r.raw());
            pollset.clean(r.raw());

            // Out-of-range descriptors are ignored.
            pollset.clean(-1);
        }

        #[test]
        #[should_panic(expected = "live waiter")]
        fn clean_with_live_waiter_panics() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, _w) = crate::util::pipe();
            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();
            pollset.clean(r.raw());
        }

        #[test]
        fn cancelled_clause_does_not_fire() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, w) = crate::util::pipe();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();

            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();
            pollset.cancel_in(r.raw());
            crate::util::write_byte(&w);
            assert!(!pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(10)))
                .unwrap());
            assert!(wakeups.is_empty());

            // The slot is free for a new clause.
            pollset.wait_in(fdmux::Clause(2), 2, r.raw()).unwrap();
            assert!(pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_millis(100)))
                .unwrap());
            assert_eq!(wakeups, &[
                fdmux::Wakeup { clause: fdmux::Clause(2), id: 2, rc: 0 },
            ]);
        }

        extern "C" fn noop_signal_handler(_: libc::c_int) {}

        #[test]
        fn interrupted_by_signal() {
            crate::util::init();
            let mut pollset = <$pollset>::new().unwrap();
            let (r, _w) = crate::util::pipe();
            let mut wakeups: Vec<fdmux::Wakeup> = Vec::new();
            pollset.wait_in(fdmux::Clause(1), 1, r.raw()).unwrap();

            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = noop_signal_handler as libc::sighandler_t;
                libc::sigemptyset(&mut action.sa_mask);
                // No SA_RESTART, the wait must observe the interruption.
                assert_eq!(
                    libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
            }

            // Deliver the signal to this very thread while it is blocked
            // in the kernel wait.
            let target = unsafe { libc::pthread_self() } as usize;
            let killer = std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                unsafe { libc::pthread_kill(target as libc::pthread_t, libc::SIGUSR1) };
            });

            let start = std::time::Instant::now();
            let err = pollset
                .poll(&mut wakeups, Some(std::time::Duration::from_secs(5)))
                .unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
            assert!(start.elapsed() < std::time::Duration::from_secs(5));
            // No clause fired on the interrupted cycle.
            assert!(wakeups.is_empty());
            killer.join().unwrap();
        }
    };
}
