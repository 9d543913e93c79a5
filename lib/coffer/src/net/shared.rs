use nix::errno::Errno;
use std::fmt;
use std::io;

/// Why a session was torn down. Forms the first handler argument and selects
/// the final line written to the info file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reason {
    Success,
    Timeout,
    Error,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Success => "success",
            Reason::Timeout => "timeout",
            Reason::Error => "error",
        }
    }
}

/// Classification of a failed datagram receive. `Retry` covers the
/// would-block and interrupted cases where the donor retransmits anyway.
#[derive(Debug, Eq, PartialEq)]
pub enum RecvError {
    Retry,
    Fatal(io::ErrorKind),
}

impl From<io::Error> for RecvError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => RecvError::Retry,
            kind => RecvError::Fatal(kind),
        }
    }
}

impl From<Errno> for RecvError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN | Errno::EINTR => RecvError::Retry,
            errno => RecvError::Fatal(io::Error::from_raw_os_error(errno as i32).kind()),
        }
    }
}

/// Malformed inbound frames. All of these are logged and dropped without an
/// acknowledgement; the donor retransmits.
#[derive(Debug, Eq, PartialEq)]
pub enum FrameError {
    Runt { got: usize },
    Length { declared: u32, actual: usize },
    ShortKdh { got: usize },
    Truncated,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Runt { got } => write!(f, "runt packet ({} bytes)", got),
            FrameError::Length { declared, actual } => {
                write!(f, "declared payload length {} but {} bytes present", declared, actual)
            }
            FrameError::ShortKdh { got } => write!(f, "dump header too small ({} bytes)", got),
            FrameError::Truncated => write!(f, "truncated frame"),
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(_: io::Error) -> Self {
        FrameError::Truncated
    }
}

/// Conditions that are fatal to a single session. Everything here maps to a
/// handler invocation with reason `error`.
#[derive(Debug)]
pub enum SessionError {
    Write { offset: u64, source: io::Error },
    Socket(io::Error),
}

impl SessionError {
    /// The message an operator sees, matching what the OS reports without
    /// the Rust error decoration.
    pub fn os_message(err: &io::Error) -> String {
        match err.raw_os_error() {
            Some(raw) => Errno::from_raw(raw).desc().to_string(),
            None => err.to_string(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::Write { offset, source } => {
                write!(f, "write error @ offset {:08x}: {}", offset, Self::os_message(source))
            }
            SessionError::Socket(source) => {
                write!(f, "receive error: {}", Self::os_message(source))
            }
        }
    }
}

/// Allocation of spool files for a new session failed. The listener logs and
/// drops; the donor times out and retries.
#[derive(Debug)]
pub enum SpoolError {
    Exhausted,
    Os(Errno),
}

impl fmt::Display for SpoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpoolError::Exhausted => write!(f, "no free dump index"),
            SpoolError::Os(errno) => write!(f, "{}", errno.desc()),
        }
    }
}

impl From<Errno> for SpoolError {
    fn from(errno: Errno) -> Self {
        SpoolError::Os(errno)
    }
}

/// Startup failures. Any of these aborts the daemon before it serves.
#[derive(Debug)]
pub enum SetupError {
    Io(io::Error),
    Os(Errno),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::Io(err) => write!(f, "{}", err),
            SetupError::Os(errno) => write!(f, "{}", errno.desc()),
        }
    }
}

impl From<io::Error> for SetupError {
    fn from(err: io::Error) -> Self {
        SetupError::Io(err)
    }
}

impl From<Errno> for SetupError {
    fn from(errno: Errno) -> Self {
        SetupError::Os(errno)
    }
}
