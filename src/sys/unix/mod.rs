pub mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::Pollset;

#[cfg(any(target_os = "freebsd", target_os = "macos",
          target_os = "netbsd", target_os = "openbsd"))]
pub mod kqueue;

#[cfg(any(target_os = "freebsd", target_os = "macos",
          target_os = "netbsd", target_os = "openbsd"))]
pub use self::kqueue::Pollset;

#[cfg(not(any(target_os = "linux", target_os = "android",
              target_os = "freebsd", target_os = "macos",
              target_os = "netbsd", target_os = "openbsd")))]
pub use self::poll::Pollset;
