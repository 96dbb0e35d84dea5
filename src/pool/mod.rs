//! Worker thread pool for blocking jobs.
//!
//! A fixed set of threads shares a FIFO job queue guarded by a mutex and
//! condition variable. Workers may block arbitrarily; finished items land
//! in the loop's completion queue and the loop is signalled through the
//! wake pipe, so completion callbacks always run on the loop thread, FIFO
//! by completion time. Threads start lazily on the first submission.

use crate::error::{Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::request::Request;
use crate::reactor::wakeup::WakePipe;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, trace};

type Payload = Box<dyn Any + Send>;

/// A loop-side completion callback. The payload is downcast back to the
/// submitter's result type before the user callback runs.
type DoneCb = Box<dyn FnOnce(&mut EventLoop, std::result::Result<Payload, Error>)>;

enum Outcome {
    Done(Payload),
    Canceled,
    Panicked(Box<dyn Any + Send>),
}

struct Completion {
    id: u64,
    outcome: Outcome,
}

/// Mutex-guarded handoff between workers and the loop thread. This is the
/// only structure both sides touch; the lock is held only to enqueue or
/// dequeue.
pub(crate) struct CompletionQueue {
    queue: Mutex<VecDeque<Completion>>,
    pending: AtomicBool,
    wake: Arc<WakePipe>,
}

impl CompletionQueue {
    fn push(&self, completion: Completion) {
        self.queue.lock().unwrap().push_back(completion);
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.wake.notify();
        }
    }

    fn pop(&self) -> Option<Completion> {
        self.queue.lock().unwrap().pop_front()
    }
}

struct Job {
    id: u64,
    work: Box<dyn FnOnce() -> Payload + Send>,
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

pub(crate) struct Pool {
    shared: Arc<Shared>,
    completions: Arc<CompletionQueue>,
    threads: Vec<thread::JoinHandle<()>>,
    max_threads: usize,
    done_cbs: HashMap<u64, DoneCb>,
}

impl Pool {
    pub(crate) fn new(wake: Arc<WakePipe>, max_threads: usize) -> Self {
        Pool {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
            completions: Arc::new(CompletionQueue {
                queue: Mutex::new(VecDeque::new()),
                pending: AtomicBool::new(false),
                wake,
            }),
            threads: Vec::new(),
            max_threads,
            done_cbs: HashMap::new(),
        }
    }

    fn ensure_started(&mut self) {
        if !self.threads.is_empty() {
            return;
        }

        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let size = cores.min(self.max_threads).max(1);
        debug!(threads = size, "starting worker pool");

        for index in 0..size {
            let shared = self.shared.clone();
            let completions = self.completions.clone();
            let handle = thread::Builder::new()
                .name(format!("evloop-worker-{index}"))
                .spawn(move || worker_main(shared, completions))
                .expect("spawn pool worker");
            self.threads.push(handle);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.cond.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>, completions: Arc<CompletionQueue>) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                state = shared.cond.wait(state).unwrap();
            }
        };

        let id = job.id;
        let outcome = match catch_unwind(AssertUnwindSafe(job.work)) {
            Ok(payload) => Outcome::Done(payload),
            Err(panic) => Outcome::Panicked(panic),
        };
        trace!(id, "work item finished");
        completions.push(Completion { id, outcome });
    }
}

/// Dispatches queued completions on the loop thread. Runs in the I/O phase
/// right after the wake pipe drains.
pub(crate) fn run_completions(lp: &mut EventLoop) {
    if !lp.pool.completions.pending.swap(false, Ordering::AcqRel) {
        return;
    }

    while let Some(completion) = lp.pool.completions.pop() {
        let Some(done) = lp.pool.done_cbs.remove(&completion.id) else {
            continue;
        };
        lp.requests.complete();
        match completion.outcome {
            Outcome::Done(payload) => done(lp, Ok(payload)),
            Outcome::Canceled => done(lp, Err(Error::Canceled)),
            // Re-raise user panics on the loop thread instead of killing a
            // worker silently.
            Outcome::Panicked(panic) => resume_unwind(panic),
        }
    }
}

impl EventLoop {
    /// Submits `work` to the pool. It runs exactly once on some worker
    /// thread and may block; `done` then runs on the loop thread with the
    /// result, or with [`Error::Canceled`] if the item was cancelled before
    /// a worker picked it up.
    pub fn queue_work<T, W, D>(&mut self, work: W, done: D) -> Result<Request>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(&mut EventLoop, Result<T>) + 'static,
    {
        self.pool.ensure_started();

        let req = self.requests.create();
        self.pool.done_cbs.insert(
            req.0,
            Box::new(move |lp, res| {
                let mapped = res.map(|payload| {
                    *payload
                        .downcast::<T>()
                        .expect("work item payload type mismatch")
                });
                done(lp, mapped);
            }),
        );

        let job = Job {
            id: req.0,
            work: Box::new(move || Box::new(work()) as Payload),
        };
        self.pool.shared.state.lock().unwrap().jobs.push_back(job);
        self.pool.shared.cond.notify_one();
        trace!(id = req.0, "work item queued");
        Ok(req)
    }

    /// Cancels a not-yet-started work item; its `done` callback still runs
    /// once, with [`Error::Canceled`]. Fails with [`Error::Busy`] when a
    /// worker already picked the item up.
    pub fn cancel_work(&mut self, req: Request) -> Result<()> {
        if !self.pool.done_cbs.contains_key(&req.0) {
            return Err(Error::NoEnt);
        }

        let removed = {
            let mut state = self.pool.shared.state.lock().unwrap();
            match state.jobs.iter().position(|job| job.id == req.0) {
                Some(pos) => {
                    state.jobs.remove(pos);
                    true
                }
                None => false,
            }
        };

        if !removed {
            return Err(Error::Busy);
        }
        self.pool.completions.push(Completion {
            id: req.0,
            outcome: Outcome::Canceled,
        });
        Ok(())
    }
}
