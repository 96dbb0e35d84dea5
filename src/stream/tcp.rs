//! TCP socket plumbing behind the stream engine.

use super::{addr, set_nonblocking_cloexec, sync_state, StreamKind, StreamState};
use crate::error::{errno, Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::handle::{Handle, HandleData, HandleFlags};
use crate::reactor::request::Request;

use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

fn new_socket(domain: libc::c_int) -> Result<RawFd> {
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::last_os());
    }
    set_nonblocking_cloexec(fd);
    Ok(fd)
}

fn domain_for(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

impl EventLoop {
    pub fn tcp_init(&mut self) -> Result<Handle> {
        Ok(self.new_handle(HandleData::Stream(StreamState::new(StreamKind::Tcp))))
    }

    /// Creates the socket on first use and binds it to `bind_addr`.
    pub fn tcp_bind(&mut self, h: Handle, bind_addr: SocketAddr) -> Result<()> {
        let fd = self.tcp_socket(h, domain_for(&bind_addr))?;

        let reuse: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let (storage, len) = addr::to_storage(&bind_addr);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Begins a non-blocking connect. The callback receives the outcome;
    /// writes issued before it completes are queued and flushed afterwards.
    pub fn tcp_connect(
        &mut self,
        h: Handle,
        peer: SocketAddr,
        cb: impl FnOnce(&mut EventLoop, Handle, Result<()>) + 'static,
    ) -> Result<Request> {
        let fd = self.tcp_socket(h, domain_for(&peer))?;
        {
            let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
            if slot.flags.intersects(
                HandleFlags::CONNECTING | HandleFlags::CONNECTED | HandleFlags::LISTENING,
            ) {
                return Err(Error::Inval);
            }
        }

        let (storage, len) = addr::to_storage(&peer);
        let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
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

    pub fn tcp_getsockname(&self, h: Handle) -> Result<SocketAddr> {
        self.tcp_name(h, |fd, storage, len| unsafe {
            libc::getsockname(fd, storage, len)
        })
    }

    pub fn tcp_getpeername(&self, h: Handle) -> Result<SocketAddr> {
        self.tcp_name(h, |fd, storage, len| unsafe {
            libc::getpeername(fd, storage, len)
        })
    }

    pub fn tcp_nodelay(&mut self, h: Handle, enabled: bool) -> Result<()> {
        let fd = self.stream_fd(h)?;
        let flag: libc::c_int = enabled as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &flag as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    fn tcp_socket(&mut self, h: Handle, domain: libc::c_int) -> Result<RawFd> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.kind != StreamKind::Tcp {
            return Err(Error::Inval);
        }
        if st.fd < 0 {
            st.fd = new_socket(domain)?;
        }
        Ok(st.fd)
    }

    fn stream_fd(&self, h: Handle) -> Result<RawFd> {
        let slot = self.handles.get(h.0).ok_or(Error::BadF)?;
        let st = slot.stream().ok_or(Error::Inval)?;
        if st.fd < 0 {
            return Err(Error::BadF);
        }
        Ok(st.fd)
    }

    fn tcp_name(
        &self,
        h: Handle,
        get: impl Fn(RawFd, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    ) -> Result<SocketAddr> {
        let fd = self.stream_fd(h)?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let ret = get(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len);
        if ret < 0 {
            return Err(Error::last_os());
        }
        addr::from_storage(&storage).ok_or(Error::Inval)
    }
}
