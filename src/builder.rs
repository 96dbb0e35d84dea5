//! Fluent builder for loop construction.

use crate::error::Result;
use crate::reactor::core::EventLoop;

/// Resolved configuration carried by a running loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopConfig {
    pub(crate) pool_size: usize,
    pub(crate) pipe_pending_instances: u32,
}

/// Builder for [`EventLoop`] instances.
///
/// # Example
/// ```no_run
/// use evloop::LoopBuilder;
///
/// let lp = LoopBuilder::new().pool_size(8).build().unwrap();
/// # drop(lp);
/// ```
pub struct LoopBuilder {
    pool_size: usize,
    pipe_pending_instances: u32,
}

impl Default for LoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopBuilder {
    pub fn new() -> Self {
        LoopBuilder {
            pool_size: 4,
            pipe_pending_instances: 4,
        }
    }

    /// Upper bound on worker-pool threads. The effective count is capped
    /// by the machine's parallelism and is always at least one.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Advisory count of pre-posted accepts for pipe listeners. Only
    /// meaningful to completion-model backends; the readiness engine
    /// records and ignores it.
    pub fn pipe_pending_instances(mut self, count: u32) -> Self {
        self.pipe_pending_instances = count.max(1);
        self
    }

    pub fn build(self) -> Result<EventLoop> {
        EventLoop::with_config(LoopConfig {
            pool_size: self.pool_size,
            pipe_pending_instances: self.pipe_pending_instances,
        })
    }
}
