//! Portable error taxonomy.
//!
//! Every fallible operation in the crate reports one of these codes. OS
//! errors are translated on the spot; anything without a mapping collapses
//! to [`Error::Unknown`] with the raw errno retained for debugging.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Portable error codes.
///
/// The set mirrors the errno values the loop can actually surface, plus
/// [`Error::Eof`] (end of stream, reported through read callbacks) and
/// [`Error::Canceled`] (the operation's handle was closed or the work item
/// was cancelled before it ran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("permission denied")]
    Acces,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("address already in use")]
    AddrInUse,
    #[error("bad file descriptor")]
    BadF,
    #[error("resource busy or locked")]
    Busy,
    #[error("operation canceled")]
    Canceled,
    #[error("connection refused")]
    ConnRefused,
    #[error("connection reset by peer")]
    ConnReset,
    #[error("file already exists")]
    Exist,
    #[error("invalid argument")]
    Inval,
    #[error("i/o error")]
    Io,
    #[error("illegal operation on a directory")]
    IsDir,
    #[error("too many symbolic links encountered")]
    Loop,
    #[error("too many open files")]
    MFile,
    #[error("name too long")]
    NameTooLong,
    #[error("no such file or directory")]
    NoEnt,
    #[error("not enough memory")]
    NoMem,
    #[error("no space left on device")]
    NoSpc,
    #[error("function not implemented")]
    NoSys,
    #[error("socket is not connected")]
    NotConn,
    #[error("not a directory")]
    NotDir,
    #[error("socket operation on non-socket")]
    NotSock,
    #[error("broken pipe")]
    Pipe,
    #[error("no such process")]
    Srch,
    #[error("connection timed out")]
    TimedOut,
    #[error("end of file")]
    Eof,
    #[error("unknown error (os error {0})")]
    Unknown(i32),
}

impl Error {
    /// Translates a raw errno value.
    pub fn from_errno(raw: i32) -> Self {
        // EWOULDBLOCK aliases EAGAIN on some platforms but not all.
        if raw == libc::EWOULDBLOCK {
            return Error::Again;
        }

        match raw {
            libc::EACCES => Error::Acces,
            libc::EAGAIN => Error::Again,
            libc::EADDRINUSE => Error::AddrInUse,
            libc::EBADF => Error::BadF,
            libc::EBUSY => Error::Busy,
            libc::ECANCELED => Error::Canceled,
            libc::ECONNREFUSED => Error::ConnRefused,
            libc::ECONNRESET => Error::ConnReset,
            libc::EEXIST => Error::Exist,
            libc::EINVAL => Error::Inval,
            libc::EIO => Error::Io,
            libc::EISDIR => Error::IsDir,
            libc::ELOOP => Error::Loop,
            libc::EMFILE | libc::ENFILE => Error::MFile,
            libc::ENAMETOOLONG => Error::NameTooLong,
            libc::ENOENT => Error::NoEnt,
            libc::ENOMEM => Error::NoMem,
            libc::ENOSPC => Error::NoSpc,
            libc::ENOSYS => Error::NoSys,
            libc::ENOTCONN => Error::NotConn,
            libc::ENOTDIR => Error::NotDir,
            libc::ENOTSOCK => Error::NotSock,
            libc::EPIPE => Error::Pipe,
            libc::ESRCH => Error::Srch,
            libc::ETIMEDOUT => Error::TimedOut,
            other => Error::Unknown(other),
        }
    }

    /// Translates the calling thread's current errno.
    pub(crate) fn last_os() -> Self {
        Error::from_errno(errno())
    }

    /// The conventional symbolic name, e.g. `"EAGAIN"`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Acces => "EACCES",
            Error::Again => "EAGAIN",
            Error::AddrInUse => "EADDRINUSE",
            Error::BadF => "EBADF",
            Error::Busy => "EBUSY",
            Error::Canceled => "ECANCELED",
            Error::ConnRefused => "ECONNREFUSED",
            Error::ConnReset => "ECONNRESET",
            Error::Exist => "EEXIST",
            Error::Inval => "EINVAL",
            Error::Io => "EIO",
            Error::IsDir => "EISDIR",
            Error::Loop => "ELOOP",
            Error::MFile => "EMFILE",
            Error::NameTooLong => "ENAMETOOLONG",
            Error::NoEnt => "ENOENT",
            Error::NoMem => "ENOMEM",
            Error::NoSpc => "ENOSPC",
            Error::NoSys => "ENOSYS",
            Error::NotConn => "ENOTCONN",
            Error::NotDir => "ENOTDIR",
            Error::NotSock => "ENOTSOCK",
            Error::Pipe => "EPIPE",
            Error::Srch => "ESRCH",
            Error::TimedOut => "ETIMEDOUT",
            Error::Eof => "EOF",
            Error::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Error::Eof;
        }

        match err.raw_os_error() {
            Some(raw) => Error::from_errno(raw),
            None => Error::Unknown(0),
        }
    }
}

pub(crate) fn errno() -> i32 {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    unsafe {
        *libc::__error()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_common_codes() {
        assert_eq!(Error::from_errno(libc::ENOENT), Error::NoEnt);
        assert_eq!(Error::from_errno(libc::ECONNRESET), Error::ConnReset);
        assert_eq!(Error::from_errno(libc::EWOULDBLOCK), Error::Again);
        assert_eq!(Error::from_errno(libc::EAGAIN), Error::Again);
    }

    #[test]
    fn unmapped_code_keeps_raw_value() {
        match Error::from_errno(12345) {
            Error::Unknown(raw) => assert_eq!(raw, 12345),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn io_error_round_trip() {
        let err = io::Error::from_raw_os_error(libc::EPIPE);
        assert_eq!(Error::from(err), Error::Pipe);
        assert_eq!(Error::Pipe.code(), "EPIPE");
    }
}
