//! Handle model: identity, flags, per-kind payload.
//!
//! A [`Handle`] is a stable index into the loop's slot arena. The slot
//! carries the flag word, the close callback and the kind-specific payload.
//! A handle contributes to loop liveness exactly when it is both ACTIVE and
//! REF; a CLOSING handle can never be re-armed and its close callback runs
//! in a later loop iteration than the close request.

use crate::process::ProcessState;
use crate::reactor::core::EventLoop;
use crate::reactor::poller::{Interest, Ready};
use crate::reactor::wakeup::AsyncCore;
use crate::stream::StreamState;
use crate::timer::TimerState;

use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Identifier of a loop-bound handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub(crate) usize);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HandleFlags: u32 {
        const ACTIVE     = 1 << 0;
        const REF        = 1 << 1;
        const CLOSING    = 1 << 2;
        const READABLE   = 1 << 3;
        const WRITABLE   = 1 << 4;
        const CONNECTED  = 1 << 5;
        const CONNECTING = 1 << 6;
        const LISTENING  = 1 << 7;
        const SHUTTING   = 1 << 8;
        const EOF        = 1 << 9;
        const READING    = 1 << 10;
    }
}

pub(crate) type TickCb = Box<dyn FnMut(&mut EventLoop, Handle)>;
pub(crate) type AsyncCb = Box<dyn FnMut(&mut EventLoop, Handle)>;
pub(crate) type PollCb = Box<dyn FnMut(&mut EventLoop, Handle, Ready)>;
pub(crate) type CloseCb = Box<dyn FnOnce(&mut EventLoop, Handle)>;

/// Which phase list an idle/prepare/check handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickKind {
    Idle,
    Prepare,
    Check,
}

pub(crate) struct TickState {
    pub(crate) cb: Option<TickCb>,
}

pub(crate) struct AsyncState {
    pub(crate) core: Arc<AsyncCore>,
    pub(crate) cb: Option<AsyncCb>,
}

pub(crate) struct PollState {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) registered: bool,
    pub(crate) cb: Option<PollCb>,
}

pub(crate) enum HandleData {
    Timer(TimerState),
    Idle(TickState),
    Prepare(TickState),
    Check(TickState),
    Async(AsyncState),
    PollWatch(PollState),
    Stream(StreamState),
    Process(ProcessState),
}

/// Coarse kind tag, used where the payload must not stay borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Timer,
    Idle,
    Prepare,
    Check,
    Async,
    PollWatch,
    Stream,
    Process,
}

pub(crate) struct HandleSlot {
    pub(crate) flags: HandleFlags,
    pub(crate) data: HandleData,
    pub(crate) close_cb: Option<CloseCb>,
}

impl HandleSlot {
    pub(crate) fn new(data: HandleData) -> Self {
        HandleSlot {
            flags: HandleFlags::REF,
            data,
            close_cb: None,
        }
    }

    pub(crate) fn kind(&self) -> HandleKind {
        match self.data {
            HandleData::Timer(_) => HandleKind::Timer,
            HandleData::Idle(_) => HandleKind::Idle,
            HandleData::Prepare(_) => HandleKind::Prepare,
            HandleData::Check(_) => HandleKind::Check,
            HandleData::Async(_) => HandleKind::Async,
            HandleData::PollWatch(_) => HandleKind::PollWatch,
            HandleData::Stream(_) => HandleKind::Stream,
            HandleData::Process(_) => HandleKind::Process,
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.flags.contains(HandleFlags::CLOSING)
    }

    pub(crate) fn timer_mut(&mut self) -> Option<&mut TimerState> {
        match &mut self.data {
            HandleData::Timer(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn tick_mut(&mut self, kind: TickKind) -> Option<&mut TickState> {
        match (&mut self.data, kind) {
            (HandleData::Idle(state), TickKind::Idle) => Some(state),
            (HandleData::Prepare(state), TickKind::Prepare) => Some(state),
            (HandleData::Check(state), TickKind::Check) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn async_mut(&mut self) -> Option<&mut AsyncState> {
        match &mut self.data {
            HandleData::Async(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn poll_mut(&mut self) -> Option<&mut PollState> {
        match &mut self.data {
            HandleData::PollWatch(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn stream(&self) -> Option<&StreamState> {
        match &self.data {
            HandleData::Stream(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut StreamState> {
        match &mut self.data {
            HandleData::Stream(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn process_mut(&mut self) -> Option<&mut ProcessState> {
        match &mut self.data {
            HandleData::Process(state) => Some(state),
            _ => None,
        }
    }
}
