//! The capability gate: everything the daemon is allowed to touch after
//! startup, gathered into one owned context. Built exactly once, while the
//! process still holds its full authority, then borrowed by the event loop
//! for the rest of the daemon's life.

use crate::handler::HandlerChannel;
use crate::net::dispenser::Dispenser;
use crate::net::shared::SetupError;
use crate::resolve::Resolver;
use crate::spool::Spool;
use nix::errno::Errno;
use strata::logging::{self, Logger};

pub struct Gate {
    pub spool: Spool,
    pub resolver: Resolver,
    pub dispenser: Dispenser,
    pub handler: Option<HandlerChannel>,
}

impl Gate {
    /// Assembles the post-startup authority set and seals the process: from
    /// here on the daemon writes only under the spool directory, speaks only
    /// through the dispenser and handler channels, and cannot regain
    /// privileges across an exec.
    pub fn seal(
        spool: Spool,
        resolver: Resolver,
        dispenser: Dispenser,
        handler: Option<HandlerChannel>,
        log: &Logger,
    ) -> Result<Gate, SetupError> {
        no_new_privs()?;

        logging::info!(log, "ambient authority reduced";
                       "handler" => handler.is_some());

        Ok(Gate { spool, resolver, dispenser, handler })
    }
}

fn no_new_privs() -> Result<(), SetupError> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(SetupError::Os(Errno::last()));
    }

    Ok(())
}
