//! Filesystem operations.
//!
//! Disk I/O cannot be made reliably non-blocking, so every operation here
//! is a worker-pool job: the blocking call runs on a pool thread and the
//! callback receives the result on the loop thread. Each call returns the
//! underlying work [`Request`], which counts toward loop liveness until
//! the callback has run.

use crate::error::{Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::request::Request;

use std::fs;
use std::path::PathBuf;

fn flatten<T>(res: Result<Result<T>>) -> Result<T> {
    res.and_then(|inner| inner)
}

impl EventLoop {
    /// Reads a whole file.
    pub fn fs_read_file(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<Vec<u8>>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || fs::read(&path).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    /// Creates or truncates a file with the given contents.
    pub fn fs_write_file(
        &mut self,
        path: impl Into<PathBuf>,
        contents: Vec<u8>,
        cb: impl FnOnce(&mut EventLoop, Result<()>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || fs::write(&path, &contents).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    pub fn fs_stat(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<fs::Metadata>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || fs::metadata(&path).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    pub fn fs_mkdir(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<()>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || fs::create_dir(&path).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    pub fn fs_rmdir(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<()>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || fs::remove_dir(&path).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    pub fn fs_unlink(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<()>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || fs::remove_file(&path).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    pub fn fs_rename(
        &mut self,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<()>) + 'static,
    ) -> Result<Request> {
        let (from, to) = (from.into(), to.into());
        self.queue_work(
            move || fs::rename(&from, &to).map_err(Error::from),
            move |lp, res| cb(lp, flatten(res)),
        )
    }

    /// Lists a directory's entries.
    pub fn fs_readdir(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut EventLoop, Result<Vec<PathBuf>>) + 'static,
    ) -> Result<Request> {
        let path = path.into();
        self.queue_work(
            move || {
                let mut entries = Vec::new();
                for entry in fs::read_dir(&path).map_err(Error::from)? {
                    entries.push(entry.map_err(Error::from)?.path());
                }
                Ok(entries)
            },
            move |lp, res| cb(lp, flatten(res)),
        )
    }
}
