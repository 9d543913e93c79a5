//! Per-donor session state and message handling.

use crate::net::shared::SessionError;
use crate::net::wire::{self, DumpHeader, MsgType, Packet};
use crate::spool::coalescer::Coalescer;
use crate::spool::{DumpFiles, Spool};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::FileExt;
use std::time::Instant;
use strata::logging::{self, Logger};
use strata::time::format_timestamp;

/// Log a progress mark roughly every 16 MiB of stream.
const PROGRESS_INTERVAL: u32 = (16 * 1024 * 1024 / wire::DATA_SIZE) as u32;

/// What a service round left behind: either the session keeps streaming or
/// the dump was committed and the session is done.
#[derive(Debug, Eq, PartialEq)]
pub enum Outcome {
    Streaming,
    Finished,
}

pub struct Session {
    ip: Ipv4Addr,
    hostname: String,
    subdir: String,
    files: DumpFiles,
    sock: mio::net::UdpSocket,
    last_msg: Instant,
    any_data_rcvd: bool,
    coalescer: Coalescer,
    log: Logger,
}

impl Session {
    /// Builds the session around freshly allocated spool files and the
    /// dedicated donor socket, and opens the info file with the greeting
    /// line.
    pub fn new(
        ip: Ipv4Addr,
        hostname: String,
        subdir: String,
        files: DumpFiles,
        sock: mio::net::UdpSocket,
        now: Instant,
        log: &Logger,
    ) -> io::Result<Session> {
        let mut session = Session {
            log: log.new(logging::o!("host" => hostname.clone(), "ip" => ip.to_string())),
            ip,
            hostname,
            subdir,
            files,
            sock,
            last_msg: now,
            any_data_rcvd: false,
            coalescer: Coalescer::new(),
        };

        session
            .files
            .info
            .write_all(format!("Dump from {} [{}]\n", session.hostname, session.ip).as_bytes())?;

        Ok(session)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn info_name(&self) -> &str {
        &self.files.info_name
    }

    pub fn core_name(&self) -> &str {
        &self.files.core_name
    }

    pub fn last_msg(&self) -> Instant {
        self.last_msg
    }

    /// False until a post-herald packet has been accepted; while false a
    /// duplicate herald is a retransmit rather than an abandoned dump.
    pub fn any_data_rcvd(&self) -> bool {
        self.any_data_rcvd
    }

    pub fn socket_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.sock
    }

    /// Drains the dedicated socket, dispatching every datagram. Returns when
    /// the socket runs dry, the dump finishes, or the session dies.
    pub fn service(&mut self, now: Instant, spool: &Spool) -> Result<Outcome, SessionError> {
        loop {
            let mut buf = [0u8; wire::MAX_MSG_SIZE];

            let len = match self.sock.recv(&mut buf) {
                Ok(len) => len,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Outcome::Streaming)
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(SessionError::Socket(err)),
            };

            if let Outcome::Finished = self.dispatch(&buf[..len], now, spool)? {
                return Ok(Outcome::Finished);
            }
        }
    }

    fn dispatch(
        &mut self,
        datagram: &[u8],
        now: Instant,
        spool: &Spool,
    ) -> Result<Outcome, SessionError> {
        let pkt = match wire::decode(datagram) {
            Ok(pkt) => pkt,
            Err(err) => {
                logging::warn!(self.log, "dropping malformed packet"; "err" => %err);
                return Ok(Outcome::Streaming);
            }
        };

        self.last_msg = now;

        match pkt.hdr.mtype {
            MsgType::Kdh => {
                self.handle_kdh(&pkt);
                Ok(Outcome::Streaming)
            }
            MsgType::Vmcore => {
                self.handle_vmcore(&pkt)?;
                Ok(Outcome::Streaming)
            }
            MsgType::Finished => self.handle_finish(&pkt, spool),
            MsgType::Herald => {
                // A herald for an already-connected donor reaches this socket
                // when it was retransmitted from the same source port. Before
                // any data it is the herald that created us: same answer.
                if self.any_data_rcvd {
                    logging::warn!(self.log, "ignoring herald in mid-stream";
                                   "seqno" => pkt.hdr.seqno);
                } else {
                    self.ack(pkt.hdr.seqno);
                }
                Ok(Outcome::Streaming)
            }
            mtype => {
                logging::warn!(self.log, "ignoring unexpected message type";
                               "type" => ?mtype, "seqno" => pkt.hdr.seqno);
                Ok(Outcome::Streaming)
            }
        }
    }

    fn handle_kdh(&mut self, pkt: &Packet) {
        self.any_data_rcvd = true;

        let hdr = match DumpHeader::read(pkt.data) {
            Ok(hdr) => hdr,
            Err(err) => {
                logging::warn!(self.log, "bad dump header"; "err" => %err);
                self.pinfo("Bad KDH: packet too small\n".to_string());
                return;
            }
        };

        self.pinfo(format!("  Architecture: {}\n", hdr.architecture));
        self.pinfo(format!(
            "  Dump length: {}B ({} MB)\n",
            hdr.dump_length,
            hdr.dump_length >> 20
        ));
        self.pinfo(format!("  blocksize: {}\n", hdr.block_size));
        self.pinfo(format!("  Dumptime: {}\n", format_timestamp(hdr.dump_time)));
        self.pinfo(format!("  Hostname: {}\n", hdr.hostname));
        self.pinfo(format!("  Versionstring: {}\n", hdr.version));
        self.pinfo(format!("  Panicstring: {}\n", hdr.panic));

        logging::info!(self.log, "received dump header";
                       "architecture" => &hdr.architecture,
                       "length" => hdr.dump_length,
                       "panic" => &hdr.panic);

        self.ack(pkt.hdr.seqno);
    }

    fn handle_vmcore(&mut self, pkt: &Packet) -> Result<(), SessionError> {
        self.any_data_rcvd = true;

        if pkt.hdr.seqno % PROGRESS_INTERVAL == 0 {
            logging::debug!(self.log, "vmcore stream progress";
                            "seqno" => pkt.hdr.seqno, "offset" => pkt.hdr.offset);
        }

        if !self.coalescer.accepts(pkt.hdr.offset, pkt.data.len()) {
            self.flush_core()?;
        }
        self.coalescer.stage(pkt.hdr.offset, pkt.data);

        self.ack(pkt.hdr.seqno);
        Ok(())
    }

    fn handle_finish(&mut self, pkt: &Packet, spool: &Spool) -> Result<Outcome, SessionError> {
        self.any_data_rcvd = true;

        self.flush_core()?;
        if let Err(err) = self.files.core.sync_data() {
            logging::warn!(self.log, "fsync failed"; "err" => %err);
        }

        if let Err(err) = spool.publish_last(&self.subdir, &self.hostname, self.files.index) {
            // Leave the session alive; the donor retransmits FINISHED and
            // the replacement is retried.
            logging::error!(self.log, "cannot update .last symlinks"; "err" => %err);
            return Ok(Outcome::Streaming);
        }

        logging::info!(self.log, "completed dump"; "corefile" => &self.files.core_name);
        self.pinfo("Dump complete\n".to_string());
        self.ack(pkt.hdr.seqno);

        Ok(Outcome::Finished)
    }

    /// Writes the staged region as one positional write. A failure here is
    /// fatal to the session.
    fn flush_core(&mut self) -> Result<(), SessionError> {
        if let Some((base, data)) = self.coalescer.pending() {
            self.files
                .core
                .write_all_at(data, base)
                .map_err(|source| SessionError::Write { offset: base, source })?;
        }
        self.coalescer.clear();

        Ok(())
    }

    /// Acknowledges one sequence number on the dedicated socket.
    /// Acknowledgements are best-effort: a donor that misses one simply
    /// retransmits.
    pub fn ack(&mut self, seqno: u32) {
        if let Err(err) = self.sock.send(&wire::encode_ack(seqno)) {
            if err.kind() != io::ErrorKind::WouldBlock {
                logging::warn!(self.log, "ack send failed"; "seqno" => seqno, "err" => %err);
            }
        }
    }

    /// Records the final info line for a session torn down by the sweep or
    /// at shutdown.
    pub fn record_timeout(&mut self) {
        self.pinfo("Dump incomplete: client timed out\n".to_string());
    }

    /// Records the final info line for a session killed by a fatal error.
    pub fn record_error(&mut self, err: &SessionError) {
        self.pinfo(format!("Dump unsuccessful: {}\n", err));
    }

    fn pinfo(&mut self, line: String) {
        if let Err(err) = self.files.info.write_all(line.as_bytes()) {
            logging::warn!(self.log, "info file write failed"; "err" => %err);
        }
    }
}
