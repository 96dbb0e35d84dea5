//! Child-process supervision: spawn, exit reaping, kill.
//!
//! Spawning uses `fork(2)` plus a CLOEXEC signalling pipe: the child
//! reports its exec errno through the pipe, so the parent learns reliably
//! whether `execve` happened. Everything the child touches after the fork
//! is prepared beforehand; the child performs only async-signal-safe calls.
//!
//! Exit collection is process-wide: one SIGCHLD handler stores into a
//! fixed table of per-loop flag/wake-fd slots, and each loop sweeps its own
//! children with `waitpid(WNOHANG)` on the loop thread. Exit callbacks are
//! dispatched only after the whole sweep finishes.

pub mod winargs;

use crate::error::{errno, Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::handle::{Handle, HandleData, HandleFlags};
use crate::reactor::wakeup::notify_fd;
use crate::stream::pipe::socketpair_cloexec;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Once;
use tracing::debug;

pub(crate) type ExitCb = Box<dyn FnOnce(&mut EventLoop, Handle, i64, i32)>;

pub(crate) struct ProcessState {
    pub(crate) pid: i32,
    pub(crate) exit_cb: Option<ExitCb>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcessFlags: u32 {
        /// Detach the child into its own session.
        const DETACHED = 1 << 0;
        /// Restore the default SIGPIPE disposition in the child.
        const RESET_SIGPIPE = 1 << 1;
        /// Skip argv quoting when building a Windows command line.
        const WINDOWS_VERBATIM_ARGUMENTS = 1 << 2;
        /// Hide the child's console window on Windows.
        const WINDOWS_HIDE = 1 << 3;
    }
}

/// One stdio table entry. Entry 0 is read-direction by convention,
/// entries 1 and 2 write-direction.
pub enum Stdio {
    /// Redirect to the null device (slots 0..=2) or leave closed.
    Ignore,
    /// Duplicate an existing descriptor into the child.
    InheritFd(RawFd),
    /// Duplicate a stream handle's descriptor into the child.
    InheritStream(Handle),
    /// Forge a connected pair; the parent keeps one end as a pipe handle.
    Pipe,
}

pub struct SpawnOptions {
    /// Program path, searched against PATH when it contains no slash.
    pub program: String,
    pub args: Vec<String>,
    /// Child environment; `None` inherits the parent's.
    pub env: Option<Vec<(String, String)>>,
    pub cwd: Option<PathBuf>,
    pub stdio: Vec<Stdio>,
    pub flags: ProcessFlags,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SpawnOptions {
    pub fn new(program: impl Into<String>) -> Self {
        SpawnOptions {
            program: program.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            stdio: Vec::new(),
            flags: ProcessFlags::empty(),
            uid: None,
            gid: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdio(mut self, entry: Stdio) -> Self {
        self.stdio.push(entry);
        self
    }
}

// -- SIGCHLD demultiplexing ---------------------------------------------------

const CHLD_SLOTS: usize = 64;

struct ChldSlot {
    wake_fd: AtomicI32,
    pending: AtomicBool,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: ChldSlot = ChldSlot {
    wake_fd: AtomicI32::new(-1),
    pending: AtomicBool::new(false),
};

static SLOTS: [ChldSlot; CHLD_SLOTS] = [EMPTY_SLOT; CHLD_SLOTS];
static INSTALL_HANDLER: Once = Once::new();

fn set_errno(value: i32) {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = value;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    unsafe {
        *libc::__error() = value;
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    let _ = value;
}

/// Async-signal-safe: atomic loads/stores and `write(2)` only, with errno
/// saved across the body.
extern "C" fn on_sigchld(_signum: libc::c_int) {
    let saved = errno();
    for slot in SLOTS.iter() {
        let fd = slot.wake_fd.load(Ordering::Relaxed);
        if fd >= 0 {
            slot.pending.store(true, Ordering::Release);
            notify_fd(fd);
        }
    }
    set_errno(saved);
}

fn install_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = on_sigchld;
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
    }
}

fn ensure_chld_slot(lp: &mut EventLoop) -> Result<()> {
    if lp.chld_slot.is_some() {
        return Ok(());
    }

    let wake_fd = lp.wake.write_fd();
    for (index, slot) in SLOTS.iter().enumerate() {
        if slot
            .wake_fd
            .compare_exchange(-1, wake_fd, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            lp.chld_slot = Some(index);
            INSTALL_HANDLER.call_once(install_handler);
            return Ok(());
        }
    }
    Err(Error::NoMem)
}

pub(crate) fn release_chld_slot(index: usize) {
    SLOTS[index].wake_fd.store(-1, Ordering::Release);
    SLOTS[index].pending.store(false, Ordering::Release);
}

/// Called from the wakeup path; sweeps children if SIGCHLD arrived.
pub(crate) fn check_sigchld(lp: &mut EventLoop) {
    let Some(index) = lp.chld_slot else { return };
    if SLOTS[index].pending.swap(false, Ordering::AcqRel) {
        reap_children(lp);
    }
}

fn reap_children(lp: &mut EventLoop) {
    let watched: Vec<(i32, Handle)> = lp.processes.iter().map(|(&pid, &h)| (pid, h)).collect();

    let mut exited = Vec::new();
    for (pid, h) in watched {
        let mut status: libc::c_int = 0;
        let ret = loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret == -1 && errno() == libc::EINTR {
                continue;
            }
            break ret;
        };
        // 0: still running; -1: not our child anymore (reaped elsewhere).
        if ret != pid {
            continue;
        }

        let exit_status = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status) as i64
        } else {
            0
        };
        let term_signal = if libc::WIFSIGNALED(status) {
            libc::WTERMSIG(status)
        } else {
            0
        };
        exited.push((pid, h, exit_status, term_signal));
    }

    // Callbacks run only after the whole sweep, so a callback spawning a
    // new child cannot re-enter the sweep.
    for (pid, h, exit_status, term_signal) in exited {
        debug!(pid, exit_status, term_signal, "child exited");
        lp.processes.remove(&pid);
        lp.stop_handle(h);
        let cb = lp
            .handles
            .get_mut(h.0)
            .and_then(|slot| slot.process_mut())
            .and_then(|state| state.exit_cb.take());
        if let Some(cb) = cb {
            cb(lp, h, exit_status, term_signal);
        }
    }
}

// -- spawn --------------------------------------------------------------------

fn cstring(bytes: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::Inval)
}

fn exec_candidates(program: &str) -> Result<Vec<CString>> {
    if program.contains('/') {
        return Ok(vec![cstring(program)?]);
    }

    let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());
    let mut candidates = Vec::new();
    for dir in std::env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        candidates.push(cstring(dir.join(program).as_os_str().as_bytes())?);
    }
    if candidates.is_empty() {
        return Err(Error::NoEnt);
    }
    Ok(candidates)
}

fn env_block(env: &Option<Vec<(String, String)>>) -> Result<Vec<CString>> {
    match env {
        Some(pairs) => pairs
            .iter()
            .map(|(key, value)| cstring(format!("{key}={value}")))
            .collect(),
        None => std::env::vars_os()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                cstring(entry)
            })
            .collect(),
    }
}

fn make_cloexec_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    #[cfg(target_os = "linux")]
    {
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::last_os());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
    }
    Ok((fds[0], fds[1]))
}

/// Everything the child touches after the fork. Built entirely before the
/// fork: the child may not allocate.
struct ChildContext {
    stdio_child_fds: Vec<RawFd>,
    detached: bool,
    reset_sigpipe: bool,
    old_mask: libc::sigset_t,
    devnull: CString,
    cwd: Option<CString>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    candidates: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    err_fd: RawFd,
}

/// Runs between `fork` and `execve`. Only async-signal-safe calls; any
/// failure writes the errno to the signalling pipe and exits 127.
unsafe fn child_after_fork(ctx: &ChildContext) -> ! {
    libc::sigprocmask(libc::SIG_SETMASK, &ctx.old_mask, std::ptr::null_mut());

    if ctx.detached {
        libc::setsid();
    }

    for (fd, &use_fd) in ctx.stdio_child_fds.iter().enumerate() {
        let fd = fd as RawFd;
        let mut use_fd = use_fd;

        if use_fd < 0 {
            if fd >= 3 {
                continue;
            }
            // stdin/stdout/stderr always point somewhere, even when ignored
            let mode = if fd == 0 { libc::O_RDONLY } else { libc::O_RDWR };
            use_fd = libc::open(ctx.devnull.as_ptr(), mode);
            if use_fd < 0 {
                child_fail(ctx.err_fd, errno());
            }
        }

        if use_fd == fd {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        } else if libc::dup2(use_fd, fd) < 0 {
            child_fail(ctx.err_fd, errno());
        }

        if fd <= 2 {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        }
    }

    if let Some(cwd) = &ctx.cwd {
        if libc::chdir(cwd.as_ptr()) < 0 {
            child_fail(ctx.err_fd, errno());
        }
    }

    if ctx.uid.is_some() || ctx.gid.is_some() {
        // Optimistic: drops supplementary groups when running as root.
        libc::setgroups(0, std::ptr::null());
    }
    if let Some(gid) = ctx.gid {
        if libc::setgid(gid) < 0 {
            child_fail(ctx.err_fd, errno());
        }
    }
    if let Some(uid) = ctx.uid {
        if libc::setuid(uid) < 0 {
            child_fail(ctx.err_fd, errno());
        }
    }

    if ctx.reset_sigpipe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let mut saw_eacces = false;
    for candidate in &ctx.candidates {
        libc::execve(candidate.as_ptr(), ctx.argv.as_ptr(), ctx.envp.as_ptr());
        match errno() {
            libc::EACCES => saw_eacces = true,
            libc::ENOENT | libc::ENOTDIR => {}
            _ => break,
        }
    }

    let mut err = errno();
    if saw_eacces && (err == libc::ENOENT || err == libc::ENOTDIR) {
        err = libc::EACCES;
    }
    child_fail(ctx.err_fd, err)
}

unsafe fn child_fail(err_fd: RawFd, err: i32) -> ! {
    let value: i32 = err;
    loop {
        let n = libc::write(
            err_fd,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>(),
        );
        if n >= 0 || errno() != libc::EINTR {
            break;
        }
    }
    libc::_exit(127)
}

impl EventLoop {
    /// Spawns a child process.
    ///
    /// Returns the process handle and, aligned with the stdio table, a
    /// pipe handle for every [`Stdio::Pipe`] entry. `exit_cb` fires exactly
    /// once with `(exit_status, term_signal)` after the child is reaped.
    pub fn spawn(
        &mut self,
        options: SpawnOptions,
        exit_cb: impl FnOnce(&mut EventLoop, Handle, i64, i32) + 'static,
    ) -> Result<(Handle, Vec<Option<Handle>>)> {
        let stdio_count = options.stdio.len().max(3);

        // (parent end, child end) per slot; -1 where not applicable.
        let mut parent_fds = vec![-1 as RawFd; stdio_count];
        let mut child_fds = vec![-1 as RawFd; stdio_count];
        let cleanup_pipes = |parent_fds: &[RawFd], child_fds: &[RawFd], pipes_only: &[bool]| {
            for i in 0..parent_fds.len() {
                if pipes_only[i] {
                    if parent_fds[i] >= 0 {
                        unsafe { libc::close(parent_fds[i]) };
                    }
                    if child_fds[i] >= 0 {
                        unsafe { libc::close(child_fds[i]) };
                    }
                }
            }
        };
        let mut is_pipe = vec![false; stdio_count];

        for (i, entry) in options.stdio.iter().enumerate() {
            match entry {
                Stdio::Ignore => {}
                Stdio::InheritFd(fd) => child_fds[i] = *fd,
                Stdio::InheritStream(h) => {
                    let fd = self
                        .handles
                        .get(h.0)
                        .and_then(|slot| slot.stream())
                        .map(|st| st.fd)
                        .filter(|&fd| fd >= 0);
                    match fd {
                        Some(fd) => child_fds[i] = fd,
                        None => {
                            cleanup_pipes(&parent_fds, &child_fds, &is_pipe);
                            return Err(Error::Inval);
                        }
                    }
                }
                Stdio::Pipe => {
                    let (parent_end, child_end) = match socketpair_cloexec() {
                        Ok(pair) => pair,
                        Err(err) => {
                            cleanup_pipes(&parent_fds, &child_fds, &is_pipe);
                            return Err(err);
                        }
                    };
                    parent_fds[i] = parent_end;
                    child_fds[i] = child_end;
                    is_pipe[i] = true;
                }
            }
        }

        let spawn_result = self.spawn_child(&options, &child_fds);

        // The child ends of forged pairs belong to the child alone.
        for i in 0..stdio_count {
            if is_pipe[i] && child_fds[i] >= 0 {
                unsafe { libc::close(child_fds[i]) };
                child_fds[i] = -1;
            }
        }

        let pid = match spawn_result {
            Ok(pid) => pid,
            Err(err) => {
                cleanup_pipes(&parent_fds, &child_fds, &is_pipe);
                return Err(err);
            }
        };

        let mut pipe_handles = vec![None; options.stdio.len()];
        for (i, slot) in pipe_handles.iter_mut().enumerate() {
            if is_pipe[i] {
                let h = self.pipe_init()?;
                self.pipe_open(h, parent_fds[i])?;
                *slot = Some(h);
            }
        }

        let process = self.new_handle(HandleData::Process(ProcessState {
            pid,
            exit_cb: Some(Box::new(exit_cb)),
        }));
        self.processes.insert(pid, process);
        self.start_handle(process);
        debug!(pid, program = %options.program, "spawned child");

        Ok((process, pipe_handles))
    }

    /// Fork/exec with the errno signalling pipe. Returns the child pid.
    fn spawn_child(&mut self, options: &SpawnOptions, child_fds: &[RawFd]) -> Result<i32> {
        ensure_chld_slot(self)?;

        let candidates = exec_candidates(&options.program)?;
        let mut argv_owned = Vec::with_capacity(options.args.len() + 1);
        argv_owned.push(cstring(options.program.as_bytes())?);
        for arg in &options.args {
            argv_owned.push(cstring(arg.as_bytes())?);
        }
        let envp_owned = env_block(&options.env)?;

        let mut argv: Vec<*const libc::c_char> =
            argv_owned.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> =
            envp_owned.iter().map(|s| s.as_ptr()).collect();
        envp.push(std::ptr::null());

        let cwd = match &options.cwd {
            Some(path) => Some(cstring(path.as_os_str().as_bytes())?),
            None => None,
        };

        let (err_read, err_write) = make_cloexec_pipe()?;

        // Block every signal around the fork; the child restores the old
        // mask before exec.
        let mut all_signals: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigfillset(&mut all_signals);
            libc::pthread_sigmask(libc::SIG_SETMASK, &all_signals, &mut old_mask);
        }

        let ctx = ChildContext {
            stdio_child_fds: child_fds.to_vec(),
            detached: options.flags.contains(ProcessFlags::DETACHED),
            reset_sigpipe: options.flags.contains(ProcessFlags::RESET_SIGPIPE),
            old_mask,
            devnull: cstring("/dev/null")?,
            cwd,
            uid: options.uid,
            gid: options.gid,
            candidates,
            argv,
            envp,
            err_fd: err_write,
        };

        let pid = unsafe { libc::fork() };

        if pid == 0 {
            unsafe { child_after_fork(&ctx) };
        }

        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
            libc::close(err_write);
        }

        if pid < 0 {
            let err = Error::last_os();
            unsafe { libc::close(err_read) };
            return Err(err);
        }

        // EOF means exec happened; four bytes carry the child's errno.
        let mut exec_errno: i32 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    err_read,
                    &mut exec_errno as *mut i32 as *mut libc::c_void,
                    std::mem::size_of::<i32>(),
                )
            };
            if n == -1 && errno() == libc::EINTR {
                continue;
            }
            if n != std::mem::size_of::<i32>() as isize {
                exec_errno = 0;
            }
            break;
        }
        unsafe { libc::close(err_read) };

        if exec_errno != 0 {
            // Reap the stillborn child now; it was never registered, so the
            // SIGCHLD sweep would not claim it.
            let mut status: libc::c_int = 0;
            loop {
                let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
                if ret == -1 && errno() == libc::EINTR {
                    continue;
                }
                break;
            }
            return Err(Error::from_errno(exec_errno));
        }

        Ok(pid)
    }

    pub fn process_pid(&self, h: Handle) -> Result<i32> {
        match self.handles.get(h.0).map(|slot| &slot.data) {
            Some(HandleData::Process(state)) => Ok(state.pid),
            _ => Err(Error::Inval),
        }
    }

    /// Sends `signum` to the child. Signal 0 probes liveness: `Ok` for a
    /// live process, [`Error::Srch`] for a dead and reaped one.
    pub fn process_kill(&mut self, h: Handle, signum: i32) -> Result<()> {
        let pid = self.process_pid(h)?;
        let slot = self.handles.get(h.0).ok_or(Error::BadF)?;
        if !slot.flags.contains(HandleFlags::ACTIVE) && signum == 0 {
            // Already reaped; the pid may have been recycled.
            return Err(Error::Srch);
        }
        kill_pid(pid, signum)
    }
}

/// Sends a signal to an arbitrary pid.
pub fn kill_pid(pid: i32, signum: i32) -> Result<()> {
    if unsafe { libc::kill(pid, signum) } < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}
