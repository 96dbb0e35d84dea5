//! Cross-thread wakeup plumbing.
//!
//! The loop owns one wake pipe, an `eventfd(2)` on Linux and a non-blocking
//! self-pipe elsewhere, registered with the poller under
//! [`WAKE_TOKEN`](super::poller::WAKE_TOKEN). Async handles, worker-pool
//! completions and the SIGCHLD watcher all funnel through it: each keeps an
//! atomic pending flag and only touches the pipe on the false→true edge, so
//! any number of signals between two loop iterations coalesce into a single
//! poller wakeup.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The loop's wake pipe. `notify` may be called from any thread and never
/// blocks; `drain` runs on the loop thread after the poller reports the
/// read side ready.
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    #[cfg(target_os = "linux")]
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakePipe {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok(WakePipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    pub(crate) fn notify(&self) {
        notify_fd(self.write_fd);
    }

    /// Empties the pipe so the poller stops reporting it ready.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                if n < 0 && crate::error::errno() == libc::EINTR {
                    continue;
                }
                break;
            }
            // eventfd resets on a single read; pipes may hold more bytes.
            if (n as usize) < buf.len() {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

// Raw fds, used read-only after construction.
unsafe impl Send for WakePipe {}
unsafe impl Sync for WakePipe {}

/// Writes one wakeup token to a wake-pipe write end. Async-signal-safe:
/// a single `write(2)`, full-pipe errors ignored (the loop is already
/// scheduled to wake in that case).
pub(crate) fn notify_fd(fd: RawFd) {
    #[cfg(target_os = "linux")]
    let (ptr, len) = {
        static ONE: u64 = 1;
        (&ONE as *const u64 as *const libc::c_void, 8)
    };
    #[cfg(not(target_os = "linux"))]
    let (ptr, len) = {
        static BYTE: u8 = 1;
        (&BYTE as *const u8 as *const libc::c_void, 1)
    };

    loop {
        let n = unsafe { libc::write(fd, ptr, len) };
        if n >= 0 {
            return;
        }
        match crate::error::errno() {
            libc::EINTR => continue,
            _ => return,
        }
    }
}

/// Shared core of one async handle.
pub(crate) struct AsyncCore {
    pub(crate) pending: AtomicBool,
    pub(crate) wake: Arc<WakePipe>,
}

/// Thread-safe sender for an async handle.
///
/// The only legal way to reach a running loop from another thread. Cloning
/// is cheap; `send` never blocks. All sends that land before the loop
/// thread next dispatches the handle's callback coalesce into a single
/// invocation.
#[derive(Clone)]
pub struct AsyncSender {
    pub(crate) core: Arc<AsyncCore>,
}

impl AsyncSender {
    pub fn send(&self) {
        if !self.core.pending.swap(true, Ordering::AcqRel) {
            self.core.wake.notify();
        }
    }
}
