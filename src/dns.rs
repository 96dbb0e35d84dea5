//! Address resolution over the worker pool.

use crate::error::{Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::request::Request;

use std::net::{SocketAddr, ToSocketAddrs};

impl EventLoop {
    /// Resolves `node:service` on a pool thread. The callback receives
    /// every resolved address, in resolver order.
    pub fn getaddrinfo(
        &mut self,
        node: impl Into<String>,
        service: u16,
        cb: impl FnOnce(&mut EventLoop, Result<Vec<SocketAddr>>) + 'static,
    ) -> Result<Request> {
        let node = node.into();
        self.queue_work(
            move || -> Result<Vec<SocketAddr>> {
                let addrs = (node.as_str(), service)
                    .to_socket_addrs()
                    .map_err(Error::from)?
                    .collect();
                Ok(addrs)
            },
            move |lp, res| cb(lp, res.and_then(|inner| inner)),
        )
    }
}
