//! The spool directory: exclusive-create filename allocation and `.last`
//! symlink maintenance, all relative to the directory descriptor opened at
//! startup.

pub mod coalescer;

use crate::net::shared::{SetupError, SpoolError};
use nix::errno::Errno;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use strata::logging::{self, Logger};

/// Maximum saved dumps per donor host.
pub const MAX_DUMPS: u32 = 256;

pub struct Spool {
    dir: File,
    log: Logger,
}

/// The file pair owned by one session. Both files stay open for the
/// session's lifetime; the names are relative to the spool directory.
pub struct DumpFiles {
    pub index: u32,
    pub info_name: String,
    pub core_name: String,
    pub info: File,
    pub core: File,
}

impl Spool {
    pub fn open(path: &Path, log: &Logger) -> Result<Spool, SetupError> {
        let dir = File::open(path)?;
        Ok(Spool::from_dir(dir, path, log))
    }

    /// Wraps a directory handle the caller opened earlier. The daemon opens
    /// it before detaching, while relative paths still mean what the
    /// operator wrote; `path` is only used for log context.
    pub fn from_dir(dir: File, path: &Path, log: &Logger) -> Spool {
        Spool {
            dir,
            log: log.new(logging::o!("dumpdir" => path.display().to_string())),
        }
    }

    /// A donor-requested sub-path must be empty or a single plain component.
    pub fn valid_subpath(path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        if path == "." || path == ".." {
            return false;
        }

        !path.bytes().any(|b| b == b'/' || b == 0)
    }

    /// Scans `info.<host>.0 ..= .255` for an index where both the info and
    /// core file can be created exclusively. The info file is created first;
    /// a core-file failure removes it so the pair stays in sync.
    pub fn allocate(&self, subdir: &str, host: &str) -> Result<DumpFiles, SpoolError> {
        for index in 0..MAX_DUMPS {
            let info_name = prefixed(subdir, &format!("info.{}.{}", host, index));
            let core_name = prefixed(subdir, &format!("vmcore.{}.{}", host, index));

            let info = match self.create_new(&info_name, libc::O_WRONLY | libc::O_APPEND) {
                Ok(file) => file,
                Err(Errno::EEXIST) => continue,
                Err(errno) => {
                    logging::warn!(self.log, "cannot create info file";
                                   "file" => &info_name, "err" => errno.desc());
                    continue;
                }
            };

            let core = match self.create_new(&core_name, libc::O_RDWR) {
                Ok(file) => file,
                Err(errno) => {
                    // Keep the index pair in sync.
                    drop(info);
                    let _ = self.unlink(&info_name);
                    if errno != Errno::EEXIST {
                        logging::warn!(self.log, "cannot create core file";
                                       "file" => &core_name, "err" => errno.desc());
                    }
                    continue;
                }
            };

            return Ok(DumpFiles { index, info_name, core_name, info, core });
        }

        Err(SpoolError::Exhausted)
    }

    /// Re-points `info.<host>.last` and `vmcore.<host>.last` at the pair
    /// just completed. Replacement is unlink-then-symlink; a reader polling
    /// for the links may observe a brief gap.
    pub fn publish_last(&self, subdir: &str, host: &str, index: u32) -> Result<(), SpoolError> {
        for kind in &["vmcore", "info"] {
            let link = prefixed(subdir, &format!("{}.{}.last", kind, host));
            // Target relative to the directory holding the link.
            let target = format!("{}.{}.{}", kind, host, index);

            match self.unlink(&link) {
                Ok(()) | Err(Errno::ENOENT) => (),
                Err(errno) => return Err(errno.into()),
            }
            self.symlink(&target, &link)?;
        }

        Ok(())
    }

    fn create_new(&self, name: &str, oflags: libc::c_int) -> Result<File, Errno> {
        let cname = cpath(name)?;

        let fd = unsafe {
            libc::openat(
                self.dir.as_raw_fd(),
                cname.as_ptr(),
                oflags | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(Errno::last());
        }

        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn unlink(&self, name: &str) -> Result<(), Errno> {
        let cname = cpath(name)?;

        match unsafe { libc::unlinkat(self.dir.as_raw_fd(), cname.as_ptr(), 0) } {
            0 => Ok(()),
            _ => Err(Errno::last()),
        }
    }

    fn symlink(&self, target: &str, link: &str) -> Result<(), Errno> {
        let ctarget = cpath(target)?;
        let clink = cpath(link)?;

        match unsafe { libc::symlinkat(ctarget.as_ptr(), self.dir.as_raw_fd(), clink.as_ptr()) } {
            0 => Ok(()),
            _ => Err(Errno::last()),
        }
    }
}

fn prefixed(subdir: &str, name: &str) -> String {
    if subdir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", subdir, name)
    }
}

fn cpath(name: &str) -> Result<CString, Errno> {
    CString::new(name).map_err(|_| Errno::EINVAL)
}
