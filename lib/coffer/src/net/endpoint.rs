//! The event multiplexer: one readiness loop over the listening socket,
//! every per-session socket and the termination signals, with a periodic
//! sweep for stalled donors.

use crate::gate::Gate;
use crate::net::dispenser::Intro;
use crate::net::registry::Registry;
use crate::net::session::{Outcome, Session};
use crate::net::shared::{Reason, RecvError, SessionError, SetupError};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use std::io;
use std::time::{Duration, Instant};
use strata::logging::{self, Logger};

const LISTENER: Token = Token(0);
const SIGNALS: Token = Token(1);

pub struct Endpoint {
    poll: Poll,
    events: Events,
    signals: Signals,
    gate: Gate,
    registry: Registry,
    last_sweep: Instant,
    log: Logger,
}

impl Endpoint {
    /// A donor silent for longer than this is written off.
    const CLIENT_TIMEOUT: Duration = Duration::from_secs(600);
    /// Stalled donors are only looked for this often.
    const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
    /// Upper bound on readiness-wait latency, so the sweep always runs.
    const POLL_TIMEOUT: Duration = Duration::from_secs(10);
    const EVENT_CAPACITY: usize = 64;

    pub fn new(mut gate: Gate, log: &Logger) -> Result<Endpoint, SetupError> {
        let poll = Poll::new()?;
        let mut signals = Signals::new([SIGINT, SIGTERM])?;

        poll.registry()
            .register(gate.dispenser.listener_mut(), LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut signals, SIGNALS, Interest::READABLE)?;

        Ok(Endpoint {
            poll,
            events: Events::with_capacity(Self::EVENT_CAPACITY),
            signals,
            gate,
            registry: Registry::new(),
            last_sweep: Instant::now(),
            log: log.new(logging::o!("subsystem" => "endpoint")),
        })
    }

    /// Serves until SIGINT or SIGTERM arrives, then tears every live session
    /// down through the timeout path so the handler fires for each.
    pub fn run(&mut self) -> Result<(), SetupError> {
        logging::info!(self.log, "waiting for clients");

        while self.turn(Some(Self::POLL_TIMEOUT))? {}

        logging::info!(self.log, "shutting down"; "live_sessions" => self.registry.len());
        self.drain();

        Ok(())
    }

    /// One wake of the multiplexer: wait for readiness, dispatch every
    /// event against a single timestamp, then run the sweep. Returns false
    /// once termination has been requested.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<bool, SetupError> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(err.into());
        }

        let now = Instant::now();
        let mut keep_running = true;

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in tokens {
            match token {
                SIGNALS => {
                    for signal in self.signals.pending() {
                        logging::info!(self.log, "termination signal"; "signal" => signal);
                        keep_running = false;
                    }
                }
                LISTENER => self.server_event(now),
                token => self.client_event(token, now),
            }
        }

        self.sweep(now);
        Ok(keep_running)
    }

    /// Readiness on the listening socket: pull heralds through the
    /// dispenser until it runs dry.
    fn server_event(&mut self, now: Instant) {
        loop {
            match self.gate.dispenser.accept() {
                Ok(Some(intro)) => self.admit(intro, now),
                Ok(None) => continue,
                Err(RecvError::Retry) => break,
                Err(RecvError::Fatal(kind)) => {
                    logging::error!(self.log, "listening socket receive failed"; "err" => ?kind);
                    break;
                }
            }
        }
    }

    /// Creates the session for an accepted herald, or resolves the herald
    /// against an existing session for the same donor: a retransmit is
    /// re-acked, an abandoned dump is superseded.
    fn admit(&mut self, intro: Intro, now: Instant) {
        let ip = *intro.source.ip();

        if let Some(slot) = self.registry.lookup(ip) {
            let resend = match self.registry.get_mut(slot) {
                Some(session) => !session.any_data_rcvd(),
                None => false,
            };

            if resend {
                if let Some(session) = self.registry.get_mut(slot) {
                    session.ack(intro.seqno);
                }
                return;
            }

            // The donor started over; the dump in flight is dead.
            self.terminate(slot, Reason::Timeout);
        }

        let hostname = match self.gate.resolver.short_hostname(intro.source) {
            Ok(hostname) => hostname,
            Err(err) => {
                logging::error!(self.log, "cannot resolve donor"; "ip" => %ip, "err" => ?err);
                return;
            }
        };

        let files = match self.gate.spool.allocate(&intro.subdir, &hostname) {
            Ok(files) => files,
            Err(err) => {
                logging::error!(self.log, "cannot create output files for new client";
                                "host" => &hostname, "ip" => %ip, "err" => %err);
                return;
            }
        };

        let sock = mio::net::UdpSocket::from_std(intro.socket);
        let session = match Session::new(
            ip,
            hostname,
            intro.subdir,
            files,
            sock,
            now,
            &self.log,
        ) {
            Ok(session) => session,
            Err(err) => {
                logging::error!(self.log, "cannot start session"; "ip" => %ip, "err" => %err);
                return;
            }
        };

        let slot = self.registry.insert(session);
        let token = Registry::token(slot);

        if let Some(session) = self.registry.get_mut(slot) {
            if let Err(err) =
                self.poll.registry().register(session.socket_mut(), token, Interest::READABLE)
            {
                logging::error!(self.log, "cannot register donor socket"; "err" => %err);
                self.registry.remove(slot);
                return;
            }

            logging::info!(self.log, "new dump";
                           "host" => session.hostname(), "ip" => %session.ip(),
                           "corefile" => session.core_name());
            session.ack(intro.seqno);
        }
    }

    /// Readiness on a per-session socket.
    fn client_event(&mut self, token: Token, now: Instant) {
        let slot = Registry::slot(token);

        let result = match self.registry.get_mut(slot) {
            Some(session) => session.service(now, &self.gate.spool),
            // The session went away earlier in this wake.
            None => return,
        };

        match result {
            Ok(Outcome::Streaming) => (),
            Ok(Outcome::Finished) => self.retire(slot),
            Err(err) => self.fail(slot, err),
        }
    }

    /// Evicts donors that have gone silent. Runs at most once per interval
    /// regardless of how often the poll wakes.
    fn sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < Self::SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        for slot in self.registry.live_slots() {
            let stale = self
                .registry
                .get_mut(slot)
                .map(|session| now.duration_since(session.last_msg()) > Self::CLIENT_TIMEOUT)
                .unwrap_or(false);

            if stale {
                self.terminate(slot, Reason::Timeout);
            }
        }
    }

    /// Tears down every live session through the timeout path.
    fn drain(&mut self) {
        for slot in self.registry.live_slots() {
            self.terminate(slot, Reason::Timeout);
        }
    }

    fn retire(&mut self, slot: usize) {
        if let Some(mut session) = self.registry.remove(slot) {
            let _ = self.poll.registry().deregister(session.socket_mut());
            self.exec_handler(&session, Reason::Success);
        }
    }

    fn fail(&mut self, slot: usize, err: SessionError) {
        if let Some(mut session) = self.registry.remove(slot) {
            logging::error!(self.log, "session failed";
                            "host" => session.hostname(), "ip" => %session.ip(), "err" => %err);
            session.record_error(&err);
            let _ = self.poll.registry().deregister(session.socket_mut());
            self.exec_handler(&session, Reason::Error);
        }
    }

    fn terminate(&mut self, slot: usize, reason: Reason) {
        if let Some(mut session) = self.registry.remove(slot) {
            logging::info!(self.log, "client timed out";
                           "host" => session.hostname(), "ip" => %session.ip());
            session.record_timeout();
            let _ = self.poll.registry().deregister(session.socket_mut());
            self.exec_handler(&session, reason);
        }
    }

    fn exec_handler(&self, session: &Session, reason: Reason) {
        if let Some(handler) = &self.gate.handler {
            if let Err(err) = handler.exec_handler(
                reason,
                &session.ip().to_string(),
                session.hostname(),
                session.info_name(),
                session.core_name(),
            ) {
                logging::error!(self.log, "handler invocation failed";
                                "reason" => reason.as_str(), "err" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dispenser::Dispenser;
    use crate::net::wire::{self, encode_dump_header, encode_packet};
    use crate::resolve::Resolver;
    use crate::spool::Spool;
    use std::fs;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::path::Path;
    use strata::logging::{o, Discard, Logger};
    use tempfile::TempDir;

    const TEST_PORT_BASE: u16 = 34540;

    struct Rig {
        dir: TempDir,
        endpoint: Endpoint,
        donor: UdpSocket,
        port: u16,
        host: String,
    }

    fn rig(port: u16, handler_script: Option<&Path>) -> Rig {
        let dir = TempDir::new().unwrap();
        let log = Logger::root(Discard, o!());

        let spool = Spool::open(dir.path(), &log).unwrap();
        let resolver = Resolver::new(&log);
        let host = resolver
            .short_hostname(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .unwrap();
        let dispenser = Dispenser::bind(Ipv4Addr::LOCALHOST, port, &log).unwrap();
        let handler = handler_script.map(|script| crate::handler::spawn(script, &log).unwrap());

        let gate = Gate::seal(spool, resolver, dispenser, handler, &log).unwrap();
        let endpoint = Endpoint::new(gate, &log).unwrap();

        let donor = UdpSocket::bind("127.0.0.1:0").unwrap();
        donor
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        Rig { dir, endpoint, donor, port, host }
    }

    impl Rig {
        fn send(&self, datagram: &[u8]) {
            self.donor.send_to(datagram, ("127.0.0.1", self.port)).unwrap();
        }

        /// Drives the loop until the donor sees the expected ack.
        fn pump_until_ack(&mut self, seqno: u32) {
            pump_ack(&mut self.endpoint, &self.donor, seqno);
        }

        fn pump(&mut self, rounds: usize) {
            for _ in 0..rounds {
                assert!(self.endpoint.turn(Some(Duration::from_millis(20))).unwrap());
            }
        }

        fn info_path(&self, index: u32) -> std::path::PathBuf {
            self.dir.path().join(format!("info.{}.{}", self.host, index))
        }
    }

    fn pump_ack(endpoint: &mut Endpoint, donor: &UdpSocket, seqno: u32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ack = [0u8; wire::ACK_SIZE];
        loop {
            assert!(endpoint.turn(Some(Duration::from_millis(20))).unwrap());
            if donor.recv(&mut ack).is_ok() {
                assert_eq!(ack, wire::encode_ack(seqno));
                return;
            }
            assert!(Instant::now() < deadline, "ack {} never arrived", seqno);
        }
    }

    fn kdh() -> Vec<u8> {
        encode_dump_header("amd64", 4096, 1_500_000_000, 512, "donor", "v", "p")
    }

    #[test]
    fn test_full_dump_over_the_loop() {
        let mut rig = rig(TEST_PORT_BASE, None);

        rig.send(&encode_packet(0, 0, 0, b""));
        rig.pump_until_ack(0);

        rig.send(&encode_packet(1, 1, 0, &kdh()));
        rig.pump_until_ack(1);
        rig.send(&encode_packet(2, 3, 0, &[0xAA; 1456]));
        rig.pump_until_ack(2);
        rig.send(&encode_packet(3, 3, 1456, &[0xBB; 1456]));
        rig.pump_until_ack(3);
        rig.send(&encode_packet(4, 3, 2912, &[0xCC; 1184]));
        rig.pump_until_ack(4);
        rig.send(&encode_packet(5, 2, 0, &[]));
        rig.pump_until_ack(5);

        let core = fs::read(rig.dir.path().join(format!("vmcore.{}.0", rig.host))).unwrap();
        assert_eq!(core.len(), 4096);
        assert!(core[..1456].iter().all(|&b| b == 0xAA));
        assert!(core[2912..].iter().all(|&b| b == 0xCC));

        let info = fs::read_to_string(rig.info_path(0)).unwrap();
        assert!(info.ends_with("Dump complete\n"));
        assert!(rig.dir.path().join(format!("vmcore.{}.last", rig.host)).exists());
        assert!(rig.endpoint.registry.is_empty());
    }

    #[test]
    fn test_herald_retransmit_is_idempotent() {
        let mut rig = rig(TEST_PORT_BASE + 1, None);

        rig.send(&encode_packet(0, 0, 0, b""));
        rig.pump_until_ack(0);
        rig.send(&encode_packet(0, 0, 0, b""));
        rig.pump_until_ack(0);

        assert_eq!(rig.endpoint.registry.len(), 1);
        // No second file pair was allocated.
        assert!(rig.info_path(0).exists());
        assert!(!rig.info_path(1).exists());
    }

    #[test]
    fn test_herald_supersedes_abandoned_dump() {
        let mut rig = rig(TEST_PORT_BASE + 2, None);

        rig.send(&encode_packet(0, 0, 0, b""));
        rig.pump_until_ack(0);
        rig.send(&encode_packet(1, 1, 0, &kdh()));
        rig.pump_until_ack(1);

        // The donor rebooted and heralds again, from a fresh source port as
        // a restarted kernel does.
        let reborn = UdpSocket::bind("127.0.0.1:0").unwrap();
        reborn
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        reborn
            .send_to(&encode_packet(0, 0, 0, b""), ("127.0.0.1", rig.port))
            .unwrap();
        pump_ack(&mut rig.endpoint, &reborn, 0);

        assert_eq!(rig.endpoint.registry.len(), 1);
        let old_info = fs::read_to_string(rig.info_path(0)).unwrap();
        assert!(old_info.ends_with("Dump incomplete: client timed out\n"));
        // The replacement landed on the next free index.
        assert!(rig.info_path(1).exists());
    }

    #[test]
    fn test_sweep_evicts_stale_session_within_bounds() {
        let mut rig = rig(TEST_PORT_BASE + 3, None);

        rig.send(&encode_packet(0, 0, 0, b""));
        rig.pump_until_ack(0);

        let now = Instant::now();

        // Not yet stale: under the timeout.
        rig.endpoint.sweep(now + Duration::from_secs(599));
        assert_eq!(rig.endpoint.registry.len(), 1);

        // Past the timeout on the next sweep pass.
        rig.endpoint.sweep(now + Duration::from_secs(700));
        assert!(rig.endpoint.registry.is_empty());
        let info = fs::read_to_string(rig.info_path(0)).unwrap();
        assert!(info.ends_with("Dump incomplete: client timed out\n"));
    }

    #[test]
    fn test_drain_runs_timeout_path_and_handler() {
        let script_dir = TempDir::new().unwrap();
        let out = script_dir.path().join("out");
        let script = script_dir.path().join("handler.sh");
        fs::write(&script, format!("#!/bin/sh\necho \"$@\" >> {}\n", out.display())).unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut rig = rig(TEST_PORT_BASE + 4, Some(&script));

        rig.send(&encode_packet(0, 0, 0, b""));
        rig.pump_until_ack(0);
        rig.send(&encode_packet(1, 1, 0, &kdh()));
        rig.pump_until_ack(1);

        rig.endpoint.drain();

        assert!(rig.endpoint.registry.is_empty());
        let info = fs::read_to_string(rig.info_path(0)).unwrap();
        assert!(info.ends_with("Dump incomplete: client timed out\n"));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let fired = fs::read_to_string(&out)
                .map(|content| content.starts_with("timeout "))
                .unwrap_or(false);
            if fired {
                break;
            }
            assert!(Instant::now() < deadline, "handler never fired on drain");
            std::thread::sleep(Duration::from_millis(20));
        }

        rig.pump(1);
    }
}
