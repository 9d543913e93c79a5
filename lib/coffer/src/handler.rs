//! The handler worker: a subprocess forked at startup, while the daemon
//! still holds full authority, that retains a pre-opened descriptor to the
//! notification script and is permitted to execute exactly that descriptor.
//! The main process only ever sends it event descriptions.

use crate::net::shared::{Reason, SetupError};
use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{self, AccessFlags, ForkResult};
use serde_derive::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::ptr;
use strata::logging::{self, Logger};

const MAX_REQUEST: usize = 4096;
const MAX_REPLY: usize = 256;

#[derive(Serialize, Deserialize)]
struct Request {
    reason: String,
    ip: String,
    hostname: String,
    infofile: String,
    corefile: String,
}

#[derive(Serialize, Deserialize)]
struct Reply {
    error: i32,
}

/// The daemon-side end of the worker channel.
pub struct HandlerChannel {
    chan: UnixDatagram,
    log: Logger,
}

/// Forks the worker. The child never returns from this call; the parent
/// gets back the request channel. Must run before the process sheds its
/// authority and before any threads exist.
pub fn spawn(script: &Path, log: &Logger) -> Result<HandlerChannel, SetupError> {
    unistd::access(script, AccessFlags::F_OK | AccessFlags::X_OK)?;

    // Deliberately without O_CLOEXEC: executing an interpreter script
    // through a descriptor requires the descriptor to survive the exec.
    let cpath = CString::new(script.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(Errno::last().into());
    }
    let script_file = unsafe { File::from_raw_fd(fd) };

    let (parent, child) = seqpacket_pair()?;

    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child: pid } => {
            drop(child);
            drop(script_file);

            let log = log.new(logging::o!("subsystem" => "handler"));
            logging::info!(log, "handler worker running";
                           "script" => script.display().to_string(), "pid" => pid.as_raw());

            Ok(HandlerChannel { chan: parent, log })
        }
        ForkResult::Child => {
            drop(parent);
            worker_main(child, script_file, &cpath)
        }
    }
}

impl HandlerChannel {
    /// Asks the worker to fire the notification script with the fixed
    /// argument vector. Fire-and-forget: the reply only reports whether the
    /// worker could fork, never how the script fared.
    pub fn exec_handler(
        &self,
        reason: Reason,
        ip: &str,
        hostname: &str,
        infofile: &str,
        corefile: &str,
    ) -> io::Result<()> {
        let request = Request {
            reason: reason.as_str().to_string(),
            ip: ip.to_string(),
            hostname: hostname.to_string(),
            infofile: infofile.to_string(),
            corefile: corefile.to_string(),
        };

        logging::debug!(self.log, "dispatching handler";
                        "reason" => reason.as_str(), "ip" => ip, "hostname" => hostname);

        let encoded = serde_json::to_vec(&request)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.chan.send(&encoded)?;

        let mut buf = [0u8; MAX_REPLY];
        let len = self.chan.recv(&mut buf)?;
        let reply: Reply = serde_json::from_slice(&buf[..len])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        if reply.error != 0 {
            return Err(io::Error::from_raw_os_error(reply.error));
        }

        Ok(())
    }
}

/// Request loop of the worker process. Exits when the daemon side of the
/// channel goes away.
fn worker_main(chan: UnixDatagram, script: File, argv0: &CString) -> ! {
    // Fired handlers are never waited on; let the kernel reap them.
    unsafe {
        let _ = signal(Signal::SIGCHLD, SigHandler::SigIgn);
    }

    let mut buf = [0u8; MAX_REQUEST];
    loop {
        let len = match chan.recv(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(len) => len,
        };

        let request: Request = match serde_json::from_slice(&buf[..len]) {
            Ok(request) => request,
            Err(_) => continue,
        };

        let error = fire(&script, argv0, &request);

        if let Ok(encoded) = serde_json::to_vec(&Reply { error }) {
            let _ = chan.send(&encoded);
        }
    }

    unsafe { libc::_exit(0) }
}

/// Rewinds the pre-opened descriptor and executes it in a fresh child with
/// the fixed argument vector and an empty environment. Returns the OS error
/// code when the fork (or the rewind) fails, zero otherwise.
fn fire(script: &File, argv0: &CString, request: &Request) -> i32 {
    if (&*script).seek(SeekFrom::Start(0)).is_err() {
        return Errno::last() as i32;
    }

    let args = match build_argv(argv0, request) {
        Some(args) => args,
        None => return Errno::EINVAL as i32,
    };

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => 0,
        Ok(ForkResult::Child) => {
            let mut argv: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
            argv.push(ptr::null());
            let envp: [*const libc::c_char; 1] = [ptr::null()];

            unsafe {
                libc::fexecve(script.as_raw_fd(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(1)
            }
        }
        Err(errno) => errno as i32,
    }
}

fn build_argv(argv0: &CString, request: &Request) -> Option<Vec<CString>> {
    let mut args = Vec::with_capacity(6);
    args.push(argv0.clone());
    for field in &[
        &request.reason,
        &request.ip,
        &request.hostname,
        &request.infofile,
        &request.corefile,
    ] {
        args.push(CString::new(field.as_bytes()).ok()?);
    }
    Some(args)
}

fn seqpacket_pair() -> Result<(UnixDatagram, UnixDatagram), Errno> {
    let mut fds = [0 as libc::c_int; 2];

    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }

    // SOCK_SEQPACKET keeps the message framing of a datagram socket but
    // reports EOF when the peer closes, which is how the worker learns the
    // daemon is gone.
    let parent = unsafe { UnixDatagram::from_raw_fd(fds[0]) };
    let child = unsafe { UnixDatagram::from_raw_fd(fds[1]) };
    Ok((parent, child))
}
