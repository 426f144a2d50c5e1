//! Upper bound on file descriptor numbers.

/// Bound used when `RLIMIT_NOFILE` is unlimited or can't be read.
const DEFAULT_MAX_FDS: usize = 65_536;

/// Returns the upper bound on descriptor values for this process.
///
/// Descriptor tables are allocated with this many entries and indexed
/// directly by fd number. The value is the `RLIMIT_NOFILE` soft limit; an
/// unlimited soft limit is clamped so the table stays allocatable.
pub(crate) fn max_fds() -> usize {
    let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if rc != 0 || rlim.rlim_cur == libc::RLIM_INFINITY {
        return DEFAULT_MAX_FDS;
    }
    rlim.rlim_cur as usize
}
