//! Named pipes over `AF_UNIX` stream sockets, plus the connected pairs the
//! process spawner uses for child stdio.

use super::{set_nonblocking_cloexec, sync_state, StreamKind, StreamState};
use crate::error::{errno, Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::handle::{Handle, HandleData, HandleFlags};
use crate::reactor::request::Request;

use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

fn new_socket() -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::last_os());
    }
    set_nonblocking_cloexec(fd);
    Ok(fd)
}

fn unix_addr(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::NameTooLong);
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let base = &addr as *const _ as usize;
    let path_off = &addr.sun_path as *const _ as usize - base;
    Ok((addr, (path_off + bytes.len() + 1) as libc::socklen_t))
}

/// A CLOEXEC `socketpair(2)`; one end stays in the parent as a pipe
/// handle, the other is duplicated into the child.
pub(crate) fn socketpair_cloexec() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(Error::last_os());
    }
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

impl EventLoop {
    pub fn pipe_init(&mut self) -> Result<Handle> {
        Ok(self.new_handle(HandleData::Stream(StreamState::new(StreamKind::Pipe))))
    }

    /// Binds the pipe to a filesystem path. The path must not already
    /// exist.
    pub fn pipe_bind(&mut self, h: Handle, path: impl AsRef<Path>) -> Result<()> {
        let (addr, len) = unix_addr(path.as_ref())?;
        let fd = self.pipe_socket(h)?;

        let ret = unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Connects to a bound pipe. `AF_UNIX` connects normally complete
    /// inline; either way the outcome arrives through the callback.
    pub fn pipe_connect(
        &mut self,
        h: Handle,
        path: impl AsRef<Path>,
        cb: impl FnOnce(&mut EventLoop, Handle, Result<()>) + 'static,
    ) -> Result<Request> {
        let (addr, len) = unix_addr(path.as_ref())?;
        let fd = self.pipe_socket(h)?;
        {
            let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
            if slot.flags.intersects(
                HandleFlags::CONNECTING | HandleFlags::CONNECTED | HandleFlags::LISTENING,
            ) {
                return Err(Error::Inval);
            }
        }

        let ret = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
        let req = self.requests.create();

        if ret == 0 {
            if let Some(slot) = self.handles.get_mut(h.0) {
                slot.flags.insert(
                    HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE,
                );
            }
            self.defer(move |lp| {
                lp.requests.complete();
                cb(lp, h, Ok(()));
            });
            return Ok(req);
        }

        match errno() {
            libc::EINPROGRESS => {
                let slot = self.handles.get_mut(h.0).expect("stream slot");
                slot.flags.insert(HandleFlags::CONNECTING);
                let st = slot.stream_mut().expect("stream state");
                st.connect_req = Some((req, Box::new(cb)));
                sync_state(self, h);
            }
            raw => {
                let err = Error::from_errno(raw);
                self.defer(move |lp| {
                    lp.requests.complete();
                    cb(lp, h, Err(err));
                });
            }
        }
        Ok(req)
    }

    /// Adopts an existing descriptor as a connected pipe. Used for the
    /// parent ends of spawn stdio pairs, or any inherited stream fd.
    pub fn pipe_open(&mut self, h: Handle, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(Error::BadF);
        }
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.kind != StreamKind::Pipe || st.fd >= 0 {
            return Err(Error::Inval);
        }

        set_nonblocking_cloexec(fd);
        st.fd = fd;
        slot.flags
            .insert(HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE);
        Ok(())
    }

    fn pipe_socket(&mut self, h: Handle) -> Result<RawFd> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.kind != StreamKind::Pipe {
            return Err(Error::Inval);
        }
        if st.fd < 0 {
            st.fd = new_socket()?;
        }
        Ok(st.fd)
    }
}
