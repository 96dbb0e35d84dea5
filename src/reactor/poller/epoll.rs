use super::{Interest, PollEvent};

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// Readiness backend over `epoll(7)`.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

const MAX_EVENTS: usize = 1024;

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Poller {
            epoll_fd,
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    pub(crate) fn add(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn modify(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Already gone; nothing to unregister.
            if err.raw_os_error() == Some(libc::ENOENT) || err.raw_os_error() == Some(libc::EBADF) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut mask = 0u32;
        if interest.read {
            mask |= libc::EPOLLIN as u32;
        }
        if interest.write {
            mask |= libc::EPOLLOUT as u32;
        }

        let mut event = libc::epoll_event {
            events: mask,
            u64: token as u64,
        };

        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for readiness for up to `timeout_ms` milliseconds.
    ///
    /// A timeout of 0 polls, -1 blocks until an event arrives. A wait
    /// interrupted by a signal reports zero events.
    pub(crate) fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<()> {
        out.clear();

        let n = unsafe {
            self.events.set_len(0);
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.capacity() as libc::c_int,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for event in &self.events {
            let err_or_hup =
                event.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;

            out.push(PollEvent {
                token: event.u64 as usize,
                readable: event.events & libc::EPOLLIN as u32 != 0 || err_or_hup,
                writable: event.events & libc::EPOLLOUT as u32 != 0 || err_or_hup,
            });
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
