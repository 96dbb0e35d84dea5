//! Reactor subsystem: the event-loop driver, the handle/request model, the
//! poller backend and the cross-thread wakeup primitive.

pub(crate) mod core;
pub(crate) mod handle;
pub(crate) mod poller;
pub(crate) mod request;
pub(crate) mod wakeup;

pub use self::core::{EventLoop, RunMode};
pub use self::handle::Handle;
pub use self::poller::{Interest, Ready};
pub use self::request::Request;
pub use self::wakeup::AsyncSender;
