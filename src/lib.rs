//! Callback-driven asynchronous I/O event loop.
//!
//! One reactor multiplexes network sockets, child processes, filesystem
//! operations, timers, cross-thread signalling and a blocking-work thread
//! pool. Each loop iteration runs a fixed phase order (timers, deferred
//! callbacks, idle, prepare, poll, check, close), and the loop keeps
//! running while any active ref'd handle or in-flight request remains.
//!
//! # Architecture
//!
//! - **EventLoop**: the single-threaded driver; owns every handle and request
//! - **Handle**: long-lived object bound to a loop (timer, stream, process, ...)
//! - **Request**: one-shot operation record (write, shutdown, work, ...)
//! - **Poller**: readiness backend, `epoll(7)` on Linux, `kqueue(2)` on BSDs
//! - **AsyncSender**: the only thread-safe entry point into a running loop
//! - **Worker pool**: fixed threads for jobs that cannot be made non-blocking
//!
//! # Example
//!
//! ```no_run
//! use evloop::{EventLoop, RunMode};
//!
//! let mut lp = EventLoop::new().unwrap();
//! let timer = lp.timer_init().unwrap();
//! lp.timer_start(timer, 50, 0, |lp, timer| {
//!     println!("fired at {}ms", lp.now());
//!     lp.close(timer).unwrap();
//! })
//! .unwrap();
//! lp.run(RunMode::Default);
//! ```

mod builder;
mod dns;
mod error;
mod fs;
mod pool;
pub mod process;
mod reactor;
mod stream;
mod timer;
mod utils;

pub use builder::LoopBuilder;
pub use error::{Error, Result};
pub use process::{kill_pid, ProcessFlags, SpawnOptions, Stdio};
pub use reactor::{AsyncSender, EventLoop, Handle, Interest, Ready, Request, RunMode};
