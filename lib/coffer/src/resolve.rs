//! Reverse resolution of donor addresses to the short hostname used in
//! spool file names.

use dns_lookup::{getnameinfo, LookupError};
use std::net::{SocketAddr, SocketAddrV4};
use strata::logging::{self, Logger};

pub struct Resolver {
    log: Logger,
}

impl Resolver {
    pub fn new(log: &Logger) -> Resolver {
        Resolver {
            log: log.new(logging::o!("subsystem" => "resolver")),
        }
    }

    /// Resolves a donor address with name-required semantics, stripping the
    /// domain suffix. When no name exists the printable address is used
    /// instead; only a failure of both lookups is an error.
    pub fn short_hostname(&self, addr: SocketAddrV4) -> Result<String, LookupError> {
        let sockaddr = SocketAddr::V4(addr);

        match getnameinfo(&sockaddr, libc::NI_NAMEREQD) {
            Ok((host, _)) => {
                let short = match host.find('.') {
                    Some(dot) => host[..dot].to_string(),
                    None => host,
                };
                Ok(short)
            }
            Err(err) => {
                logging::debug!(self.log, "no name for donor, falling back to numeric form";
                                "ip" => %addr.ip(), "err" => ?err);
                let (host, _) = getnameinfo(&sockaddr, 0)?;
                Ok(host)
            }
        }
    }
}
