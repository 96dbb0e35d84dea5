//! The event-loop driver.
//!
//! Each iteration walks a fixed phase order: refresh the cached clock, run
//! due timers, run callbacks deferred from the previous iteration, run idle
//! then prepare handles, block in the poller, dispatch the poller's events,
//! run check handles, and finally run close callbacks for handles that were
//! closed in an earlier iteration. The loop stays alive while any handle is
//! both active and ref'd, any request is in flight, or any close is still
//! pending.

use crate::builder::{LoopBuilder, LoopConfig};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::reactor::handle::{
    AsyncState, CloseCb, Handle, HandleData, HandleFlags, HandleKind, HandleSlot, PollState,
    TickCb, TickKind, TickState,
};
use crate::reactor::poller::{Interest, PollEvent, Poller, Ready, WAKE_TOKEN};
use crate::reactor::request::Requests;
use crate::reactor::wakeup::{AsyncCore, AsyncSender, WakePipe};
use crate::timer::TimerHeap;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// How `run` drives the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Iterate until no live handles or requests remain, or `stop` is called.
    Default,
    /// One full iteration; the poller may block.
    Once,
    /// One full iteration without blocking.
    NoWait,
}

/// A callback deferred to the pending phase of a later iteration.
pub(crate) type PendingCb = Box<dyn FnOnce(&mut EventLoop)>;

/// A single-threaded reactor.
///
/// All handles live in the loop's arena and are addressed by [`Handle`]
/// ids. Exactly one thread may drive a loop; the only operations legal from
/// other threads are [`AsyncSender::send`] and work running on the loop's
/// thread pool.
pub struct EventLoop {
    pub(crate) handles: crate::utils::slab::Slab<HandleSlot>,
    pub(crate) requests: Requests,
    pub(crate) timers: TimerHeap,
    pub(crate) poller: Poller,
    events_scratch: Vec<PollEvent>,
    pub(crate) pending: VecDeque<PendingCb>,
    idle_handles: Vec<Handle>,
    prepare_handles: Vec<Handle>,
    check_handles: Vec<Handle>,
    async_handles: Vec<Handle>,
    closing: VecDeque<(Handle, u64)>,
    pub(crate) processes: HashMap<i32, Handle>,
    pub(crate) pool: Pool,
    pub(crate) wake: Arc<WakePipe>,
    pub(crate) chld_slot: Option<usize>,
    time_origin: Instant,
    cached_now: u64,
    pub(crate) iteration: u64,
    active_handles: usize,
    stop_flag: bool,
    pub(crate) config: LoopConfig,
}

impl EventLoop {
    /// Creates a loop with the default configuration.
    pub fn new() -> Result<Self> {
        LoopBuilder::new().build()
    }

    pub(crate) fn with_config(config: LoopConfig) -> Result<Self> {
        let mut poller = Poller::new()?;
        let wake = Arc::new(WakePipe::new()?);
        poller.add(wake.read_fd(), WAKE_TOKEN, Interest::READ)?;

        let pool = Pool::new(wake.clone(), config.pool_size);

        Ok(EventLoop {
            handles: crate::utils::slab::Slab::new(),
            requests: Requests::new(),
            timers: TimerHeap::new(),
            poller,
            events_scratch: Vec::new(),
            pending: VecDeque::new(),
            idle_handles: Vec::new(),
            prepare_handles: Vec::new(),
            check_handles: Vec::new(),
            async_handles: Vec::new(),
            closing: VecDeque::new(),
            processes: HashMap::new(),
            pool,
            wake,
            chld_slot: None,
            time_origin: Instant::now(),
            cached_now: 0,
            iteration: 0,
            active_handles: 0,
            stop_flag: false,
            config,
        })
    }

    /// Milliseconds since loop creation, sampled once per iteration.
    pub fn now(&self) -> u64 {
        self.cached_now
    }

    /// Refreshes the cached clock. The loop does this at the top of every
    /// iteration; call it manually after a long-blocking callback.
    pub fn update_time(&mut self) {
        self.cached_now = self.time_origin.elapsed().as_millis() as u64;
    }

    /// The advisory pre-posted accept count configured at build time.
    /// Readiness backends record it without acting on it.
    pub fn pipe_pending_instances(&self) -> u32 {
        self.config.pipe_pending_instances
    }

    /// Whether anything keeps the loop running: an active ref'd handle, an
    /// in-flight request, or a pending close.
    pub fn alive(&self) -> bool {
        self.active_handles > 0 || self.requests.in_flight() > 0 || !self.closing.is_empty()
    }

    /// Requests loop exit; `run` returns after the current iteration.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    /// Drives the loop. Returns `true` when more work is pending (relevant
    /// for [`RunMode::Once`] and [`RunMode::NoWait`]), `false` when the
    /// loop has drained.
    pub fn run(&mut self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.update_time();
        }

        while alive && !self.stop_flag {
            self.update_time();
            crate::timer::run_due_timers(self);
            self.run_pending();
            self.run_ticks(TickKind::Idle);
            self.run_ticks(TickKind::Prepare);

            let timeout = if mode == RunMode::NoWait {
                0
            } else {
                self.backend_timeout()
            };
            trace!(timeout, iteration = self.iteration, "entering poller");
            self.poll_io(timeout);

            self.run_ticks(TickKind::Check);
            self.run_closing_handles();

            self.iteration += 1;
            alive = self.alive();

            if matches!(mode, RunMode::Once | RunMode::NoWait) {
                break;
            }
        }

        self.stop_flag = false;
        debug!(alive, "loop run finished");
        alive
    }

    // -- phase helpers -----------------------------------------------------

    fn run_pending(&mut self) {
        // Snapshot the length: callbacks queued while draining run in the
        // pending phase of the next iteration.
        let queued = self.pending.len();
        for _ in 0..queued {
            let Some(cb) = self.pending.pop_front() else {
                break;
            };
            cb(self);
        }
    }

    fn backend_timeout(&self) -> i32 {
        if self.stop_flag {
            return 0;
        }
        if !self.pending.is_empty() || !self.closing.is_empty() {
            return 0;
        }
        // Active idle handles fire every iteration, so the poller must not
        // block while one exists.
        if !self.idle_handles.is_empty() {
            return 0;
        }
        if !self.alive() {
            return 0;
        }

        match self.timers.next_deadline() {
            Some(deadline) => deadline.saturating_sub(self.cached_now).min(i32::MAX as u64) as i32,
            None => -1,
        }
    }

    fn poll_io(&mut self, timeout: i32) {
        let mut events = std::mem::take(&mut self.events_scratch);
        if let Err(err) = self.poller.wait(timeout, &mut events) {
            debug!(error = %err, "poller wait failed");
        }

        for event in &events {
            self.dispatch_event(*event);
        }

        events.clear();
        self.events_scratch = events;
    }

    fn dispatch_event(&mut self, event: PollEvent) {
        if event.token == WAKE_TOKEN {
            self.on_wakeup();
            return;
        }

        let h = Handle(event.token);
        let kind = match self.handles.get(h.0) {
            Some(slot) if !slot.is_closing() => slot.kind(),
            _ => return,
        };

        match kind {
            HandleKind::Stream => {
                crate::stream::on_event(self, h, event.readable, event.writable);
            }
            HandleKind::PollWatch => self.run_poll_watch(h, event),
            _ => {}
        }
    }

    fn on_wakeup(&mut self) {
        self.wake.drain();
        crate::process::check_sigchld(self);
        crate::pool::run_completions(self);
        self.run_asyncs();
    }

    fn run_asyncs(&mut self) {
        let list = self.async_handles.clone();
        for h in list {
            let cb_opt = match self.handles.get_mut(h.0) {
                Some(slot) if !slot.is_closing() => match slot.async_mut() {
                    Some(state) if state.core.pending.swap(false, Ordering::AcqRel) => {
                        state.cb.take()
                    }
                    _ => None,
                },
                _ => None,
            };

            let Some(mut cb) = cb_opt else { continue };
            cb(self, h);
            self.restore_async_cb(h, cb);
        }
    }

    fn restore_async_cb(&mut self, h: Handle, cb: crate::reactor::handle::AsyncCb) {
        if let Some(slot) = self.handles.get_mut(h.0) {
            if !slot.is_closing() {
                if let Some(state) = slot.async_mut() {
                    if state.cb.is_none() {
                        state.cb = Some(cb);
                    }
                }
            }
        }
    }

    fn run_poll_watch(&mut self, h: Handle, event: PollEvent) {
        let cb_opt = match self.handles.get_mut(h.0) {
            Some(slot) if slot.flags.contains(HandleFlags::ACTIVE) => {
                slot.poll_mut().and_then(|state| state.cb.take())
            }
            _ => None,
        };

        let Some(mut cb) = cb_opt else { return };
        cb(
            self,
            h,
            Ready {
                readable: event.readable,
                writable: event.writable,
            },
        );

        if let Some(slot) = self.handles.get_mut(h.0) {
            if !slot.is_closing() {
                if let Some(state) = slot.poll_mut() {
                    if state.cb.is_none() {
                        state.cb = Some(cb);
                    }
                }
            }
        }
    }

    fn run_ticks(&mut self, kind: TickKind) {
        let list = self.tick_list(kind).clone();
        for h in list {
            let cb_opt = match self.handles.get_mut(h.0) {
                Some(slot)
                    if slot.flags.contains(HandleFlags::ACTIVE) && !slot.is_closing() =>
                {
                    slot.tick_mut(kind).and_then(|state| state.cb.take())
                }
                _ => None,
            };

            let Some(mut cb) = cb_opt else { continue };
            cb(self, h);

            if let Some(slot) = self.handles.get_mut(h.0) {
                if !slot.is_closing() {
                    if let Some(state) = slot.tick_mut(kind) {
                        if state.cb.is_none() {
                            state.cb = Some(cb);
                        }
                    }
                }
            }
        }
    }

    fn run_closing_handles(&mut self) {
        // Only handles closed in an earlier iteration finalize now; a close
        // requested during this iteration waits for the next one.
        while let Some(&(_, closed_at)) = self.closing.front() {
            if closed_at >= self.iteration {
                break;
            }
            let (h, _) = self.closing.pop_front().expect("closing entry");
            let Some(slot) = self.handles.remove(h.0) else {
                continue;
            };
            if let Some(cb) = slot.close_cb {
                cb(self, h);
            }
        }
    }

    // -- handle lifecycle --------------------------------------------------

    pub(crate) fn new_handle(&mut self, data: HandleData) -> Handle {
        Handle(self.handles.insert(HandleSlot::new(data)))
    }

    pub(crate) fn start_handle(&mut self, h: Handle) {
        if let Some(slot) = self.handles.get_mut(h.0) {
            if !slot.flags.contains(HandleFlags::ACTIVE) {
                slot.flags.insert(HandleFlags::ACTIVE);
                if slot.flags.contains(HandleFlags::REF) {
                    self.active_handles += 1;
                }
            }
        }
    }

    pub(crate) fn stop_handle(&mut self, h: Handle) {
        if let Some(slot) = self.handles.get_mut(h.0) {
            if slot.flags.contains(HandleFlags::ACTIVE) {
                slot.flags.remove(HandleFlags::ACTIVE);
                if slot.flags.contains(HandleFlags::REF) {
                    self.active_handles -= 1;
                }
            }
        }
    }

    /// Makes the handle count toward loop liveness again.
    pub fn ref_handle(&mut self, h: Handle) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if !slot.flags.contains(HandleFlags::REF) {
            slot.flags.insert(HandleFlags::REF);
            if slot.flags.contains(HandleFlags::ACTIVE) {
                self.active_handles += 1;
            }
        }
        Ok(())
    }

    /// Lets the loop exit even while the handle is active.
    pub fn unref_handle(&mut self, h: Handle) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.flags.contains(HandleFlags::REF) {
            slot.flags.remove(HandleFlags::REF);
            if slot.flags.contains(HandleFlags::ACTIVE) {
                self.active_handles -= 1;
            }
        }
        Ok(())
    }

    pub fn is_active(&self, h: Handle) -> bool {
        self.handles
            .get(h.0)
            .map(|slot| slot.flags.contains(HandleFlags::ACTIVE))
            .unwrap_or(false)
    }

    pub fn is_closing(&self, h: Handle) -> bool {
        self.handles
            .get(h.0)
            .map(HandleSlot::is_closing)
            .unwrap_or(false)
    }

    /// Defers a callback to the pending phase of the next iteration.
    pub(crate) fn defer(&mut self, cb: impl FnOnce(&mut EventLoop) + 'static) {
        self.pending.push_back(Box::new(cb));
    }

    // -- close protocol ----------------------------------------------------

    /// Closes a handle without a close callback. See [`EventLoop::close_with`].
    pub fn close(&mut self, h: Handle) -> Result<()> {
        self.close_impl(h, None)
    }

    /// Closes a handle.
    ///
    /// Idempotent per handle; only the first close's callback ever fires.
    /// The handle is disarmed from every subsystem immediately and queued
    /// requests receive [`Error::Canceled`] in the current iteration, but
    /// `cb` runs in the close phase of a later iteration. No callback for
    /// the handle runs after `cb`.
    pub fn close_with(
        &mut self,
        h: Handle,
        cb: impl FnOnce(&mut EventLoop, Handle) + 'static,
    ) -> Result<()> {
        self.close_impl(h, Some(Box::new(cb)))
    }

    fn close_impl(&mut self, h: Handle, cb: Option<CloseCb>) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Ok(());
        }
        slot.flags.insert(HandleFlags::CLOSING);
        slot.close_cb = cb;
        let kind = slot.kind();

        let mut canceled: Vec<PendingCb> = Vec::new();
        match kind {
            HandleKind::Timer => {
                if let Some(state) = self.handles.get_mut(h.0).and_then(HandleSlot::timer_mut) {
                    state.generation += 1;
                    state.cb = None;
                }
            }
            HandleKind::Idle => self.idle_handles.retain(|&other| other != h),
            HandleKind::Prepare => self.prepare_handles.retain(|&other| other != h),
            HandleKind::Check => self.check_handles.retain(|&other| other != h),
            HandleKind::Async => self.async_handles.retain(|&other| other != h),
            HandleKind::PollWatch => {
                if let Some(state) = self.handles.get_mut(h.0).and_then(HandleSlot::poll_mut) {
                    let fd = state.fd;
                    if state.registered {
                        state.registered = false;
                        let _ = self.poller.delete(fd);
                    }
                }
            }
            HandleKind::Stream => {
                canceled = crate::stream::close_reset(self, h);
            }
            HandleKind::Process => {
                if let Some(state) = self.handles.get_mut(h.0).and_then(HandleSlot::process_mut) {
                    let pid = state.pid;
                    state.exit_cb = None;
                    self.processes.remove(&pid);
                }
            }
        }

        self.stop_handle(h);
        let iter = self.iteration;
        self.closing.push_back((h, iter));

        for cancel in canceled {
            cancel(self);
        }
        Ok(())
    }

    // -- idle / prepare / check --------------------------------------------

    pub fn idle_init(&mut self) -> Result<Handle> {
        Ok(self.new_handle(HandleData::Idle(TickState { cb: None })))
    }

    pub fn prepare_init(&mut self) -> Result<Handle> {
        Ok(self.new_handle(HandleData::Prepare(TickState { cb: None })))
    }

    pub fn check_init(&mut self) -> Result<Handle> {
        Ok(self.new_handle(HandleData::Check(TickState { cb: None })))
    }

    pub fn idle_start(
        &mut self,
        h: Handle,
        cb: impl FnMut(&mut EventLoop, Handle) + 'static,
    ) -> Result<()> {
        self.tick_start(h, TickKind::Idle, Box::new(cb))
    }

    pub fn prepare_start(
        &mut self,
        h: Handle,
        cb: impl FnMut(&mut EventLoop, Handle) + 'static,
    ) -> Result<()> {
        self.tick_start(h, TickKind::Prepare, Box::new(cb))
    }

    pub fn check_start(
        &mut self,
        h: Handle,
        cb: impl FnMut(&mut EventLoop, Handle) + 'static,
    ) -> Result<()> {
        self.tick_start(h, TickKind::Check, Box::new(cb))
    }

    pub fn idle_stop(&mut self, h: Handle) -> Result<()> {
        self.tick_stop(h, TickKind::Idle)
    }

    pub fn prepare_stop(&mut self, h: Handle) -> Result<()> {
        self.tick_stop(h, TickKind::Prepare)
    }

    pub fn check_stop(&mut self, h: Handle) -> Result<()> {
        self.tick_stop(h, TickKind::Check)
    }

    fn tick_start(&mut self, h: Handle, kind: TickKind, cb: TickCb) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::Inval);
        }
        let state = slot.tick_mut(kind).ok_or(Error::Inval)?;
        state.cb = Some(cb);

        if !self.handles.get(h.0).expect("slot").flags.contains(HandleFlags::ACTIVE) {
            self.tick_list(kind).push(h);
            self.start_handle(h);
        }
        Ok(())
    }

    fn tick_stop(&mut self, h: Handle, kind: TickKind) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        let state = slot.tick_mut(kind).ok_or(Error::Inval)?;
        state.cb = None;

        if self.handles.get(h.0).expect("slot").flags.contains(HandleFlags::ACTIVE) {
            self.tick_list(kind).retain(|&other| other != h);
            self.stop_handle(h);
        }
        Ok(())
    }

    fn tick_list(&mut self, kind: TickKind) -> &mut Vec<Handle> {
        match kind {
            TickKind::Idle => &mut self.idle_handles,
            TickKind::Prepare => &mut self.prepare_handles,
            TickKind::Check => &mut self.check_handles,
        }
    }

    // -- async wakeup handles ----------------------------------------------

    /// Creates an async handle. The callback runs on the loop thread after
    /// any thread calls [`AsyncSender::send`]; sends coalesce per iteration.
    pub fn async_init(
        &mut self,
        cb: impl FnMut(&mut EventLoop, Handle) + 'static,
    ) -> Result<Handle> {
        let core = Arc::new(AsyncCore {
            pending: AtomicBool::new(false),
            wake: self.wake.clone(),
        });
        let h = self.new_handle(HandleData::Async(AsyncState {
            core,
            cb: Some(Box::new(cb)),
        }));
        self.async_handles.push(h);
        self.start_handle(h);
        Ok(h)
    }

    /// A cloneable, thread-safe sender for an async handle.
    pub fn async_sender(&mut self, h: Handle) -> Result<AsyncSender> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        let state = slot.async_mut().ok_or(Error::Inval)?;
        Ok(AsyncSender {
            core: state.core.clone(),
        })
    }

    // -- poll handles (fd watchers) ----------------------------------------

    /// Watches a caller-owned file descriptor. The loop never closes `fd`.
    pub fn poll_init(&mut self, fd: std::os::unix::io::RawFd) -> Result<Handle> {
        Ok(self.new_handle(HandleData::PollWatch(PollState {
            fd,
            interest: Interest::NONE,
            registered: false,
            cb: None,
        })))
    }

    pub fn poll_start(
        &mut self,
        h: Handle,
        interest: Interest,
        cb: impl FnMut(&mut EventLoop, Handle, Ready) + 'static,
    ) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::Inval);
        }
        let state = slot.poll_mut().ok_or(Error::Inval)?;
        state.cb = Some(Box::new(cb));
        state.interest = interest;
        let (fd, registered) = (state.fd, state.registered);

        if registered {
            self.poller.modify(fd, h.0, interest)?;
        } else {
            self.poller.add(fd, h.0, interest)?;
            if let Some(state) = self.handles.get_mut(h.0).and_then(HandleSlot::poll_mut) {
                state.registered = true;
            }
        }
        self.start_handle(h);
        Ok(())
    }

    pub fn poll_stop(&mut self, h: Handle) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        let state = slot.poll_mut().ok_or(Error::Inval)?;
        state.cb = None;
        let (fd, registered) = (state.fd, state.registered);
        state.registered = false;

        if registered {
            let _ = self.poller.delete(fd);
        }
        self.stop_handle(h);
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.pool.shutdown();
        if let Some(slot) = self.chld_slot.take() {
            crate::process::release_chld_slot(slot);
        }
    }
}
