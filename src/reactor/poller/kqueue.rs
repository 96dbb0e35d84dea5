use super::{Interest, PollEvent};

use libc::{
    kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE,
};
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, ptr};

/// Readiness backend over `kqueue(2)`.
pub(crate) struct Poller {
    kqueue: RawFd,
    events: Vec<kevent>,
}

const MAX_EVENTS: usize = 1024;

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let kqueue = unsafe { kqueue() };
        if kqueue < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            libc::fcntl(kqueue, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok(Poller {
            kqueue,
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    pub(crate) fn add(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(fd, token, interest)
    }

    pub(crate) fn modify(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(fd, token, interest)
    }

    pub(crate) fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.apply(fd, 0, Interest::NONE)
    }

    /// Sets both filters for `fd` to match `interest`. Adding is an
    /// idempotent update under kqueue, and removal errors for filters that
    /// were never added are reported in the event list, which we ignore.
    fn apply(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let filter_flags = |wanted: bool| if wanted { EV_ADD | EV_ENABLE } else { EV_DELETE };

        let changes = [
            kevent {
                ident: fd as usize,
                filter: EVFILT_READ,
                flags: filter_flags(interest.read),
                fflags: 0,
                data: 0,
                udata: token as *mut _,
            },
            kevent {
                ident: fd as usize,
                filter: EVFILT_WRITE,
                flags: filter_flags(interest.write),
                fflags: 0,
                data: 0,
                udata: token as *mut _,
            },
        ];

        let ret = unsafe {
            kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) || err.raw_os_error() == Some(libc::EBADF) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Waits for readiness for up to `timeout_ms` milliseconds.
    ///
    /// A timeout of 0 polls, -1 blocks until an event arrives. A wait
    /// interrupted by a signal reports zero events.
    pub(crate) fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<()> {
        out.clear();

        let ts;
        let timespec_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            let timeout = Duration::from_millis(timeout_ms as u64);
            ts = timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            &ts as *const timespec
        };

        let n = unsafe {
            self.events.set_len(0);
            kevent(
                self.kqueue,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timespec_ptr,
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
            let token = event.udata as usize;
            let readable = event.filter == EVFILT_READ;
            let writable = event.filter == EVFILT_WRITE;

            // kqueue reports the two filters separately; merge per token.
            match out.iter_mut().find(|e| e.token == token) {
                Some(merged) => {
                    merged.readable |= readable;
                    merged.writable |= writable;
                }
                None => out.push(PollEvent {
                    token,
                    readable,
                    writable,
                }),
            }
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kqueue);
        }
    }
}
