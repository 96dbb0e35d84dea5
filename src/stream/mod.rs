//! Stream engine: the read pump, the write queue and the shutdown path
//! shared by TCP sockets and pipes.
//!
//! Reads and writes proceed independently. Reading is a pump: whenever the
//! backend reports readability, the engine allocates a buffer through the
//! user's alloc callback, performs one non-blocking `read(2)` and delivers
//! the result, repeating until the syscall would block, EOF, or an error.
//! Writes go through a FIFO queue with per-request progress tracking; a
//! request that completes in the initial inline attempt reports through the
//! pending phase of the next iteration, never synchronously. Shutdown waits
//! for the queue to drain, then half-closes the write side.

mod addr;
pub(crate) mod pipe;
mod tcp;

use crate::error::{errno, Error, Result};
use crate::reactor::core::{EventLoop, PendingCb};
use crate::reactor::handle::{Handle, HandleFlags};
use crate::reactor::poller::Interest;
use crate::reactor::request::Request;

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use tracing::trace;

/// Buffer size suggested to alloc callbacks.
const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Reads drained per readability event before yielding back to the poller.
const MAX_READS_PER_EVENT: usize = 32;

const MAX_IOVECS: usize = 32;

pub(crate) type AllocCb = Box<dyn FnMut(&mut EventLoop, Handle, usize) -> Vec<u8>>;
pub(crate) type ReadCb = Box<dyn FnMut(&mut EventLoop, Handle, Result<Vec<u8>>)>;
pub(crate) type WriteCb = Box<dyn FnOnce(&mut EventLoop, Handle, Result<()>)>;
pub(crate) type ConnectCb = Box<dyn FnOnce(&mut EventLoop, Handle, Result<()>)>;
pub(crate) type ShutdownCb = Box<dyn FnOnce(&mut EventLoop, Handle, Result<()>)>;
pub(crate) type ConnectionCb = Box<dyn FnMut(&mut EventLoop, Handle, Result<()>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Tcp,
    Pipe,
}

pub(crate) struct WriteReq {
    req: Request,
    bufs: Vec<Vec<u8>>,
    /// Index of the first unwritten buffer.
    idx: usize,
    /// Bytes of `bufs[idx]` already written.
    off: usize,
    cb: WriteCb,
}

pub(crate) struct ListenerState {
    pub(crate) connection_cb: Option<ConnectionCb>,
    /// Accepted peer not yet claimed by `accept`. While occupied the
    /// listener's read interest is dropped (back-pressure).
    pub(crate) pending_fd: Option<RawFd>,
}

pub(crate) struct StreamState {
    pub(crate) fd: RawFd,
    pub(crate) kind: StreamKind,
    registered: bool,
    interest: Interest,
    alloc_cb: Option<AllocCb>,
    read_cb: Option<ReadCb>,
    write_queue: VecDeque<WriteReq>,
    shutdown_req: Option<(Request, ShutdownCb)>,
    connect_req: Option<(Request, ConnectCb)>,
    pub(crate) listener: Option<ListenerState>,
}

impl StreamState {
    pub(crate) fn new(kind: StreamKind) -> Self {
        StreamState {
            fd: -1,
            kind,
            registered: false,
            interest: Interest::NONE,
            alloc_cb: None,
            read_cb: None,
            write_queue: VecDeque::new(),
            shutdown_req: None,
            connect_req: None,
            listener: None,
        }
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

pub(crate) fn set_nonblocking_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

/// Errors that poison the whole stream: every queued operation fails with
/// the same code and the handle becomes unusable (but stays open until the
/// user closes it).
fn is_fatal(err: Error) -> bool {
    matches!(
        err,
        Error::ConnReset | Error::Pipe | Error::BadF | Error::NotConn
    )
}

// -- interest / activity bookkeeping ----------------------------------------

/// Reconciles the poller registration and the handle's active flag with
/// what the stream currently needs.
pub(crate) fn sync_state(lp: &mut EventLoop, h: Handle) {
    let desired = {
        let Some(slot) = lp.handles.get_mut(h.0) else {
            return;
        };
        if slot.is_closing() {
            return;
        }
        let flags = slot.flags;
        let Some(st) = slot.stream_mut() else {
            return;
        };
        if st.fd < 0 {
            return;
        }

        let listener_ready = st
            .listener
            .as_ref()
            .map(|l| l.pending_fd.is_none())
            .unwrap_or(false);
        let want = Interest {
            read: flags.contains(HandleFlags::READING)
                || (flags.contains(HandleFlags::LISTENING) && listener_ready),
            write: !st.write_queue.is_empty() || flags.contains(HandleFlags::CONNECTING),
        };
        let busy = want.read
            || want.write
            || st.shutdown_req.is_some()
            || flags.contains(HandleFlags::LISTENING);

        Some((st.fd, st.registered, st.interest, want, busy))
    };

    let Some((fd, registered, current, want, busy)) = desired else {
        return;
    };

    if !registered && !want.is_none() {
        if lp.poller.add(fd, h.0, want).is_ok() {
            if let Some(st) = lp.handles.get_mut(h.0).and_then(|s| s.stream_mut()) {
                st.registered = true;
                st.interest = want;
            }
        }
    } else if registered && want.is_none() {
        let _ = lp.poller.delete(fd);
        if let Some(st) = lp.handles.get_mut(h.0).and_then(|s| s.stream_mut()) {
            st.registered = false;
            st.interest = Interest::NONE;
        }
    } else if registered && want != current {
        if lp.poller.modify(fd, h.0, want).is_ok() {
            if let Some(st) = lp.handles.get_mut(h.0).and_then(|s| s.stream_mut()) {
                st.interest = want;
            }
        }
    }

    if busy {
        lp.start_handle(h);
    } else {
        lp.stop_handle(h);
    }
}

// -- event dispatch ----------------------------------------------------------

pub(crate) fn on_event(lp: &mut EventLoop, h: Handle, readable: bool, writable: bool) {
    let flags = match lp.handles.get(h.0) {
        Some(slot) if !slot.is_closing() => slot.flags,
        _ => return,
    };

    if flags.contains(HandleFlags::CONNECTING) && (writable || readable) {
        finish_connect(lp, h);
    }

    if readable {
        let flags = current_flags(lp, h);
        if flags.contains(HandleFlags::LISTENING) {
            do_accept(lp, h);
        } else if flags.contains(HandleFlags::READING) {
            do_read(lp, h);
        }
    }

    if writable {
        do_write(lp, h);
    }

    sync_state(lp, h);
}

fn current_flags(lp: &EventLoop, h: Handle) -> HandleFlags {
    lp.handles
        .get(h.0)
        .filter(|slot| !slot.is_closing())
        .map(|slot| slot.flags)
        .unwrap_or(HandleFlags::empty())
}

// -- connect -----------------------------------------------------------------

fn finish_connect(lp: &mut EventLoop, h: Handle) {
    let (fd, pending) = {
        let Some(slot) = lp.handles.get_mut(h.0) else {
            return;
        };
        slot.flags.remove(HandleFlags::CONNECTING);
        let Some(st) = slot.stream_mut() else {
            return;
        };
        (st.fd, st.connect_req.take())
    };

    let result = so_error(fd);

    if let Some(slot) = lp.handles.get_mut(h.0) {
        if result.is_ok() {
            slot.flags
                .insert(HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE);
        }
    }

    if let Some((_req, cb)) = pending {
        lp.requests.complete();
        cb(lp, h, result);
    }

    if let Err(err) = result {
        if is_fatal(err) {
            fail_queued(lp, h, err);
        }
    }
}

fn so_error(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    if err != 0 {
        return Err(Error::from_errno(err));
    }
    Ok(())
}

// -- read pump ----------------------------------------------------------------

fn do_read(lp: &mut EventLoop, h: Handle) {
    for _ in 0..MAX_READS_PER_EVENT {
        let fd = {
            let Some(slot) = lp.handles.get_mut(h.0) else {
                return;
            };
            if slot.is_closing() || !slot.flags.contains(HandleFlags::READING) {
                return;
            }
            match slot.stream_mut() {
                Some(st) if st.fd >= 0 => st.fd,
                _ => return,
            }
        };

        let Some(mut alloc) = take_alloc(lp, h) else {
            return;
        };
        let mut buf = alloc(lp, h, DEFAULT_READ_SIZE);
        restore_alloc(lp, h, alloc);
        if buf.is_empty() {
            read_stop_inner(lp, h);
            deliver_read(lp, h, Err(Error::NoMem));
            return;
        }

        // The alloc callback ran user code; re-verify before the syscall.
        let still_reading = lp
            .handles
            .get(h.0)
            .map(|slot| {
                !slot.is_closing()
                    && slot.flags.contains(HandleFlags::READING)
                    && slot.stream().map(|st| st.fd == fd).unwrap_or(false)
            })
            .unwrap_or(false);
        if !still_reading {
            return;
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

        if n > 0 {
            buf.truncate(n as usize);
            deliver_read(lp, h, Ok(buf));
            continue;
        }

        if n == 0 {
            if let Some(slot) = lp.handles.get_mut(h.0) {
                slot.flags.insert(HandleFlags::EOF);
                slot.flags.remove(HandleFlags::READING);
            }
            deliver_read(lp, h, Err(Error::Eof));
            return;
        }

        match errno() {
            libc::EINTR => continue,
            raw if raw == libc::EAGAIN || raw == libc::EWOULDBLOCK => return,
            raw => {
                let err = Error::from_errno(raw);
                read_stop_inner(lp, h);
                deliver_read(lp, h, Err(err));
                if is_fatal(err) {
                    fail_queued(lp, h, err);
                }
                return;
            }
        }
    }
}

fn take_alloc(lp: &mut EventLoop, h: Handle) -> Option<AllocCb> {
    lp.handles
        .get_mut(h.0)
        .and_then(|slot| slot.stream_mut())
        .and_then(|st| st.alloc_cb.take())
}

fn restore_alloc(lp: &mut EventLoop, h: Handle, alloc: AllocCb) {
    if let Some(st) = lp.handles.get_mut(h.0).and_then(|slot| slot.stream_mut()) {
        if st.alloc_cb.is_none() {
            st.alloc_cb = Some(alloc);
        }
    }
}

fn deliver_read(lp: &mut EventLoop, h: Handle, result: Result<Vec<u8>>) {
    let cb_opt = lp
        .handles
        .get_mut(h.0)
        .and_then(|slot| slot.stream_mut())
        .and_then(|st| st.read_cb.take());
    let Some(mut cb) = cb_opt else { return };

    cb(lp, h, result);

    if let Some(slot) = lp.handles.get_mut(h.0) {
        if !slot.is_closing() {
            if let Some(st) = slot.stream_mut() {
                if st.read_cb.is_none() {
                    st.read_cb = Some(cb);
                }
            }
        }
    }
}

fn read_stop_inner(lp: &mut EventLoop, h: Handle) {
    if let Some(slot) = lp.handles.get_mut(h.0) {
        slot.flags.remove(HandleFlags::READING);
    }
}

// -- write queue ---------------------------------------------------------------

enum Progress {
    Done,
    Partial,
    Failed(Error),
}

/// Drives the front request as far as the socket allows.
fn write_front(fd: RawFd, wr: &mut WriteReq) -> Progress {
    loop {
        if wr.idx >= wr.bufs.len() {
            return Progress::Done;
        }

        let mut iovecs = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_IOVECS];
        let mut count = 0;
        for (i, buf) in wr.bufs[wr.idx..].iter().enumerate() {
            if count == MAX_IOVECS {
                break;
            }
            let skip = if i == 0 { wr.off } else { 0 };
            if skip >= buf.len() {
                continue;
            }
            iovecs[count] = libc::iovec {
                iov_base: buf[skip..].as_ptr() as *mut libc::c_void,
                iov_len: buf.len() - skip,
            };
            count += 1;
        }
        if count == 0 {
            return Progress::Done;
        }

        let n = unsafe { libc::writev(fd, iovecs.as_ptr(), count as libc::c_int) };
        if n < 0 {
            match errno() {
                libc::EINTR => continue,
                raw if raw == libc::EAGAIN || raw == libc::EWOULDBLOCK => return Progress::Partial,
                raw => return Progress::Failed(Error::from_errno(raw)),
            }
        }

        let mut remaining = n as usize;
        while remaining > 0 {
            let left_in_buf = wr.bufs[wr.idx].len() - wr.off;
            if remaining >= left_in_buf {
                remaining -= left_in_buf;
                wr.idx += 1;
                wr.off = 0;
            } else {
                wr.off += remaining;
                remaining = 0;
            }
        }
        if wr.idx >= wr.bufs.len() {
            return Progress::Done;
        }
    }
}

enum DrainStep {
    Completed(Request, WriteCb),
    Errored(Request, WriteCb, Error),
    WouldBlock,
    Empty,
    Gone,
}

fn do_write(lp: &mut EventLoop, h: Handle) {
    loop {
        let step = {
            let Some(slot) = lp.handles.get_mut(h.0) else {
                return;
            };
            if slot.is_closing() || slot.flags.contains(HandleFlags::CONNECTING) {
                return;
            }
            match slot.stream_mut() {
                Some(st) if st.fd >= 0 => {
                    if st.write_queue.is_empty() {
                        DrainStep::Empty
                    } else {
                        let fd = st.fd;
                        let front = st.write_queue.front_mut().expect("non-empty queue");
                        match write_front(fd, front) {
                            Progress::Done => {
                                let wr = st.write_queue.pop_front().expect("front");
                                DrainStep::Completed(wr.req, wr.cb)
                            }
                            Progress::Partial => DrainStep::WouldBlock,
                            Progress::Failed(err) => {
                                let wr = st.write_queue.pop_front().expect("front");
                                DrainStep::Errored(wr.req, wr.cb, err)
                            }
                        }
                    }
                }
                _ => DrainStep::Gone,
            }
        };

        match step {
            DrainStep::Gone | DrainStep::WouldBlock => return,
            DrainStep::Empty => {
                maybe_shutdown(lp, h);
                return;
            }
            DrainStep::Completed(req, cb) => {
                trace!(stream = h.0, request = req.0, "write drained");
                lp.requests.complete();
                cb(lp, h, Ok(()));
            }
            DrainStep::Errored(req, cb, err) => {
                trace!(stream = h.0, request = req.0, error = %err, "write failed");
                lp.requests.complete();
                cb(lp, h, Err(err));
                if is_fatal(err) {
                    fail_queued(lp, h, err);
                    return;
                }
            }
        }
    }
}

/// Half-closes the write side once the queue has drained.
fn maybe_shutdown(lp: &mut EventLoop, h: Handle) {
    let work = {
        let Some(slot) = lp.handles.get_mut(h.0) else {
            return;
        };
        if slot.is_closing() || slot.flags.contains(HandleFlags::CONNECTING) {
            return;
        }
        match slot.stream_mut() {
            Some(st) if st.write_queue.is_empty() && st.shutdown_req.is_some() => {
                let (req, cb) = st.shutdown_req.take().expect("shutdown request");
                Some((st.fd, req, cb))
            }
            _ => None,
        }
    };

    let Some((fd, _req, cb)) = work else { return };
    let result = if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
        Err(Error::last_os())
    } else {
        Ok(())
    };
    lp.requests.complete();
    cb(lp, h, result);
    sync_state(lp, h);
}

/// Fails every queued write and the pending shutdown with `err`.
fn fail_queued(lp: &mut EventLoop, h: Handle, err: Error) {
    loop {
        let cb_opt = {
            let st = lp.handles.get_mut(h.0).and_then(|slot| slot.stream_mut());
            match st {
                Some(st) => st
                    .write_queue
                    .pop_front()
                    .map(|wr| wr.cb)
                    .or_else(|| st.shutdown_req.take().map(|(_, cb)| cb)),
                None => None,
            }
        };
        let Some(cb) = cb_opt else { break };
        lp.requests.complete();
        cb(lp, h, Err(err));
    }
}

// -- accept --------------------------------------------------------------------

fn do_accept(lp: &mut EventLoop, h: Handle) {
    loop {
        let fd = {
            let Some(slot) = lp.handles.get_mut(h.0) else {
                return;
            };
            if slot.is_closing() || !slot.flags.contains(HandleFlags::LISTENING) {
                return;
            }
            match slot.stream_mut() {
                Some(st) => {
                    let backpressured = st
                        .listener
                        .as_ref()
                        .map(|l| l.pending_fd.is_some())
                        .unwrap_or(true);
                    if backpressured {
                        // Peer not claimed; stop accepting until the user
                        // calls `accept`.
                        return;
                    }
                    st.fd
                }
                None => return,
            }
        };

        let peer = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if peer < 0 {
            match errno() {
                libc::EINTR | libc::ECONNABORTED => continue,
                raw if raw == libc::EAGAIN || raw == libc::EWOULDBLOCK => return,
                raw => {
                    let err = Error::from_errno(raw);
                    deliver_connection(lp, h, Err(err));
                    return;
                }
            }
        }
        set_nonblocking_cloexec(peer);
        trace!(listener = h.0, fd = peer, "accepted connection");

        if let Some(listener) = lp
            .handles
            .get_mut(h.0)
            .and_then(|slot| slot.stream_mut())
            .and_then(|st| st.listener.as_mut())
        {
            listener.pending_fd = Some(peer);
        } else {
            unsafe {
                libc::close(peer);
            }
            return;
        }

        deliver_connection(lp, h, Ok(()));
    }
}

fn deliver_connection(lp: &mut EventLoop, h: Handle, result: Result<()>) {
    let cb_opt = lp
        .handles
        .get_mut(h.0)
        .and_then(|slot| slot.stream_mut())
        .and_then(|st| st.listener.as_mut())
        .and_then(|l| l.connection_cb.take());
    let Some(mut cb) = cb_opt else { return };

    cb(lp, h, result);

    if let Some(listener) = lp
        .handles
        .get_mut(h.0)
        .filter(|slot| !slot.is_closing())
        .and_then(|slot| slot.stream_mut())
        .and_then(|st| st.listener.as_mut())
    {
        if listener.connection_cb.is_none() {
            listener.connection_cb = Some(cb);
        }
    }
}

// -- close ---------------------------------------------------------------------

/// Disarms a closing stream: deregisters and closes the descriptor, then
/// hands back one cancellation callback per queued request so the close
/// path can deliver them in the current iteration.
pub(crate) fn close_reset(lp: &mut EventLoop, h: Handle) -> Vec<PendingCb> {
    let mut canceled: Vec<PendingCb> = Vec::new();

    let Some(slot) = lp.handles.get_mut(h.0) else {
        return canceled;
    };
    let fd;
    let registered;
    {
        let Some(st) = slot.stream_mut() else {
            return canceled;
        };
        fd = st.fd;
        registered = st.registered;
        st.registered = false;
        st.alloc_cb = None;
        st.read_cb = None;

        if let Some(listener) = st.listener.as_mut() {
            match listener.pending_fd.take() {
                Some(peer) => {
                    unsafe {
                        libc::close(peer);
                    }
                    if let Some(mut cb) = listener.connection_cb.take() {
                        canceled.push(Box::new(move |lp: &mut EventLoop| {
                            cb(lp, h, Err(Error::Canceled));
                        }));
                    }
                }
                None => listener.connection_cb = None,
            }
        }

        for wr in st.write_queue.drain(..) {
            let cb = wr.cb;
            canceled.push(Box::new(move |lp: &mut EventLoop| {
                lp.requests.complete();
                cb(lp, h, Err(Error::Canceled));
            }));
        }
        if let Some((_req, cb)) = st.shutdown_req.take() {
            canceled.push(Box::new(move |lp: &mut EventLoop| {
                lp.requests.complete();
                cb(lp, h, Err(Error::Canceled));
            }));
        }
        if let Some((_req, cb)) = st.connect_req.take() {
            canceled.push(Box::new(move |lp: &mut EventLoop| {
                lp.requests.complete();
                cb(lp, h, Err(Error::Canceled));
            }));
        }
        st.fd = -1;
    }

    if fd >= 0 {
        if registered {
            let _ = lp.poller.delete(fd);
        }
        unsafe {
            libc::close(fd);
        }
    }

    canceled
}

// -- public stream operations ---------------------------------------------------

impl EventLoop {
    /// Puts the stream in read mode. `alloc` is asked for a buffer before
    /// every read; `read_cb` receives the filled buffer, [`Error::Eof`] at
    /// end of stream, or the read error.
    pub fn read_start(
        &mut self,
        h: Handle,
        alloc: impl FnMut(&mut EventLoop, Handle, usize) -> Vec<u8> + 'static,
        read_cb: impl FnMut(&mut EventLoop, Handle, Result<Vec<u8>>) + 'static,
    ) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        if slot.flags.contains(HandleFlags::LISTENING) {
            return Err(Error::Inval);
        }
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.fd < 0 {
            return Err(Error::NotConn);
        }
        st.alloc_cb = Some(Box::new(alloc));
        st.read_cb = Some(Box::new(read_cb));
        slot.flags.insert(HandleFlags::READING);

        sync_state(self, h);
        Ok(())
    }

    /// Cancels read delivery. Callbacks already taken for the current event
    /// observe the cleared read flag and deliver nothing further.
    pub fn read_stop(&mut self, h: Handle) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        st.alloc_cb = None;
        st.read_cb = None;
        slot.flags.remove(HandleFlags::READING);

        sync_state(self, h);
        Ok(())
    }

    /// Queues `bufs` for writing. The engine writes as much as it can
    /// immediately; the remainder drains in FIFO order as the socket
    /// becomes writable. The callback fires once the whole request is
    /// written or failed, never from inside this call.
    pub fn write(
        &mut self,
        h: Handle,
        bufs: Vec<Vec<u8>>,
        cb: impl FnOnce(&mut EventLoop, Handle, Result<()>) + 'static,
    ) -> Result<Request> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        if slot.flags.contains(HandleFlags::SHUTTING) {
            return Err(Error::Pipe);
        }
        if slot.flags.contains(HandleFlags::LISTENING) {
            return Err(Error::Inval);
        }
        if bufs.iter().map(Vec::len).sum::<usize>() == 0 {
            return Err(Error::Inval);
        }
        let connecting = slot.flags.contains(HandleFlags::CONNECTING);
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.fd < 0 && !connecting {
            return Err(Error::NotConn);
        }

        let req = self.requests.create();
        let st = self
            .handles
            .get_mut(h.0)
            .and_then(|slot| slot.stream_mut())
            .expect("stream slot");

        let mut wr = WriteReq {
            req,
            bufs,
            idx: 0,
            off: 0,
            cb: Box::new(cb),
        };

        if !connecting && st.write_queue.is_empty() && st.fd >= 0 {
            match write_front(st.fd, &mut wr) {
                Progress::Done => {
                    let cb = wr.cb;
                    self.defer(move |lp| {
                        lp.requests.complete();
                        cb(lp, h, Ok(()));
                    });
                    return Ok(req);
                }
                Progress::Failed(err) => {
                    let cb = wr.cb;
                    self.defer(move |lp| {
                        lp.requests.complete();
                        cb(lp, h, Err(err));
                    });
                    return Ok(req);
                }
                Progress::Partial => {
                    st.write_queue.push_back(wr);
                }
            }
        } else {
            st.write_queue.push_back(wr);
        }

        sync_state(self, h);
        Ok(req)
    }

    /// Half-closes the write side once every queued write has drained.
    /// Later writes fail with [`Error::Pipe`]. At most one shutdown may be
    /// pending per stream.
    pub fn shutdown(
        &mut self,
        h: Handle,
        cb: impl FnOnce(&mut EventLoop, Handle, Result<()>) + 'static,
    ) -> Result<Request> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        if slot.flags.contains(HandleFlags::SHUTTING) {
            return Err(Error::Busy);
        }
        let connecting = slot.flags.contains(HandleFlags::CONNECTING);
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.fd < 0 && !connecting {
            return Err(Error::NotConn);
        }

        let req = self.requests.create();
        let slot = self.handles.get_mut(h.0).expect("stream slot");
        slot.flags.insert(HandleFlags::SHUTTING);
        let st = slot.stream_mut().expect("stream state");
        st.shutdown_req = Some((req, Box::new(cb)));

        if !connecting && st.write_queue.is_empty() {
            let deferred_h = h;
            self.defer(move |lp| maybe_shutdown(lp, deferred_h));
        }
        sync_state(self, h);
        Ok(req)
    }

    /// Starts accepting connections. The callback fires once per incoming
    /// peer; claim the peer with [`EventLoop::accept`]. Until then the
    /// listener stays disarmed.
    pub fn listen(
        &mut self,
        h: Handle,
        backlog: i32,
        cb: impl FnMut(&mut EventLoop, Handle, Result<()>) + 'static,
    ) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::BadF);
        }
        if slot.flags.contains(HandleFlags::LISTENING) {
            return Err(Error::Inval);
        }
        let st = slot.stream_mut().ok_or(Error::Inval)?;
        if st.fd < 0 {
            return Err(Error::Inval);
        }

        if unsafe { libc::listen(st.fd, backlog) } < 0 {
            return Err(Error::last_os());
        }
        st.listener = Some(ListenerState {
            connection_cb: Some(Box::new(cb)),
            pending_fd: None,
        });
        slot.flags.insert(HandleFlags::LISTENING);

        sync_state(self, h);
        Ok(())
    }

    /// Claims the pending accepted peer as a new connected stream handle.
    /// Fails with [`Error::Again`] when no peer is pending.
    pub fn accept(&mut self, server: Handle) -> Result<Handle> {
        let (peer, kind) = {
            let slot = self.handles.get_mut(server.0).ok_or(Error::BadF)?;
            if !slot.flags.contains(HandleFlags::LISTENING) {
                return Err(Error::Inval);
            }
            let st = slot.stream_mut().ok_or(Error::Inval)?;
            let listener = st.listener.as_mut().ok_or(Error::Inval)?;
            let peer = listener.pending_fd.take().ok_or(Error::Again)?;
            (peer, st.kind)
        };

        let mut state = StreamState::new(kind);
        state.fd = peer;
        let client = self.new_handle(crate::reactor::handle::HandleData::Stream(state));
        if let Some(slot) = self.handles.get_mut(client.0) {
            slot.flags
                .insert(HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE);
        }

        // Pending slot is free again; re-arm the listener.
        sync_state(self, server);
        Ok(client)
    }
}
