//! Herald intake. Consumes the first datagram of each dump from the
//! listening socket and materialises a UDP socket bound to the local address
//! the donor targeted and connected back to the donor, so every
//! acknowledgement originates from the address the donor expects.

use crate::net::shared::RecvError;
use crate::net::wire::{self, MsgType};
use crate::spool::{coalescer, Spool};
use nix::errno::Errno;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;
use strata::logging::{self, Logger};

/// Everything the listener learns from one accepted herald.
pub struct Intro {
    /// Bound, connected, nonblocking socket dedicated to the donor.
    pub socket: UdpSocket,
    pub source: SocketAddrV4,
    pub seqno: u32,
    pub subdir: String,
}

pub struct Dispenser {
    listener: mio::net::UdpSocket,
    bind_ip: Ipv4Addr,
    port: u16,
    log: Logger,
}

impl Dispenser {
    /// Binds the listening socket. Destination addresses are recorded per
    /// datagram so that per-donor sockets can be bound to the exact local
    /// address each donor targeted.
    pub fn bind(bind_ip: Ipv4Addr, port: u16, log: &Logger) -> io::Result<Dispenser> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        enable_pktinfo(&socket)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(bind_ip, port)).into())?;

        Ok(Dispenser {
            listener: mio::net::UdpSocket::from_std(socket.into()),
            bind_ip,
            port,
            log: log.new(logging::o!("subsystem" => "dispenser")),
        })
    }

    /// The listening socket, for readiness registration.
    pub fn listener_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.listener
    }

    /// Consumes one datagram from the listening socket. `Ok(None)` means the
    /// datagram was taken but rejected (not a herald, bad sub-path, or the
    /// per-donor socket could not be built); callers keep draining until
    /// `Err(RecvError::Retry)`.
    pub fn accept(&mut self) -> Result<Option<Intro>, RecvError> {
        let mut buf = [0u8; wire::MAX_MSG_SIZE];
        let (len, source, dst) = self.recv_with_dst(&mut buf)?;

        let pkt = match wire::decode(&buf[..len]) {
            Ok(pkt) => pkt,
            Err(err) => {
                logging::warn!(self.log, "dropping malformed herald";
                               "from" => %source, "err" => %err);
                return Ok(None);
            }
        };

        if pkt.hdr.mtype != MsgType::Herald {
            logging::warn!(self.log, "expected herald on listening socket";
                           "from" => %source, "type" => ?pkt.hdr.mtype);
            return Ok(None);
        }

        let subdir = match std::str::from_utf8(trim_nul(pkt.data)) {
            Ok(path) if Spool::valid_subpath(path) => path.to_string(),
            _ => {
                logging::warn!(self.log, "rejecting herald with invalid dump path";
                               "from" => %source);
                return Ok(None);
            }
        };

        let socket = match self.connected_socket(dst, source) {
            Ok(socket) => socket,
            Err(err) => {
                logging::error!(self.log, "cannot build donor socket";
                                "from" => %source, "err" => %err);
                return Ok(None);
            }
        };

        Ok(Some(Intro { socket, source, seqno: pkt.hdr.seqno, subdir }))
    }

    fn connected_socket(&self, local_ip: Ipv4Addr, remote: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(local_ip, self.port)).into())?;
        socket.connect(&SocketAddr::V4(remote).into())?;
        socket.set_nonblocking(true)?;

        // Room for roughly twice the coalescer's worth of datagrams.
        if let Err(err) = socket.set_recv_buffer_size(coalescer::BUF_SIZE) {
            logging::warn!(self.log, "may drop packets due to small receive buffer";
                           "from" => %remote, "err" => %err);
        }

        Ok(socket.into())
    }

    /// `recvmsg` with `IP_PKTINFO`, reporting the destination address the
    /// donor sent to. Falls back to the configured bind address when the
    /// kernel supplies no packet info.
    fn recv_with_dst(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4, Ipv4Addr), RecvError> {
        let mut src: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsgspace = [0u64; 8];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut src as *mut libc::sockaddr_in as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsgspace.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&cmsgspace);

        let len = unsafe { libc::recvmsg(self.listener.as_raw_fd(), &mut msg, 0) };
        if len < 0 {
            return Err(Errno::last().into());
        }

        let mut dst = self.bind_ip;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                    let info = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
                    dst = Ipv4Addr::from(u32::from_be((*info).ipi_addr.s_addr));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        let source = SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr)),
            u16::from_be(src.sin_port),
        );

        Ok((len as usize, source, dst))
    }
}

fn enable_pktinfo(socket: &Socket) -> io::Result<()> {
    let one: libc::c_int = 1;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn trim_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::encode_packet;
    use std::time::Duration;
    use strata::logging::{o, Discard, Logger};

    const TEST_PORT_BASE: u16 = 34520;

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn drive(dispenser: &mut Dispenser) -> Intro {
        // The listener is nonblocking; give the datagram a moment to land.
        for _ in 0..100 {
            match dispenser.accept() {
                Ok(Some(intro)) => return intro,
                Ok(None) => panic!("herald rejected"),
                Err(RecvError::Retry) => std::thread::sleep(Duration::from_millis(10)),
                Err(err) => panic!("listener error: {:?}", err),
            }
        }
        panic!("herald never arrived");
    }

    #[test]
    fn test_accept_builds_connected_socket() {
        let port = TEST_PORT_BASE;
        let mut dispenser =
            Dispenser::bind(Ipv4Addr::LOCALHOST, port, &test_logger()).unwrap();

        let donor = UdpSocket::bind("127.0.0.1:0").unwrap();
        donor
            .send_to(&encode_packet(9, 0, 0, b"rack7"), ("127.0.0.1", port))
            .unwrap();

        let intro = drive(&mut dispenser);

        assert_eq!(intro.seqno, 9);
        assert_eq!(intro.subdir, "rack7");
        assert_eq!(intro.source.port(), donor.local_addr().unwrap().port());

        // The dedicated socket reaches the donor directly.
        intro.socket.send(&wire::encode_ack(9)).unwrap();
        let mut ack = [0u8; wire::ACK_SIZE];
        donor.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (len, from) = donor.recv_from(&mut ack).unwrap();
        assert_eq!(len, wire::ACK_SIZE);
        assert_eq!(ack, wire::encode_ack(9));
        assert_eq!(from.port(), port);
    }

    #[test]
    fn test_accept_rejects_non_herald() {
        let port = TEST_PORT_BASE + 1;
        let mut dispenser =
            Dispenser::bind(Ipv4Addr::LOCALHOST, port, &test_logger()).unwrap();

        let donor = UdpSocket::bind("127.0.0.1:0").unwrap();
        donor
            .send_to(&encode_packet(0, 3, 0, &[0xAA; 16]), ("127.0.0.1", port))
            .unwrap();

        for _ in 0..100 {
            match dispenser.accept() {
                Ok(Some(_)) => panic!("vmcore packet accepted as herald"),
                Ok(None) => return,
                Err(RecvError::Retry) => std::thread::sleep(Duration::from_millis(10)),
                Err(err) => panic!("listener error: {:?}", err),
            }
        }
        panic!("datagram never arrived");
    }

    #[test]
    fn test_accept_rejects_traversal_path() {
        let port = TEST_PORT_BASE + 2;
        let mut dispenser =
            Dispenser::bind(Ipv4Addr::LOCALHOST, port, &test_logger()).unwrap();

        let donor = UdpSocket::bind("127.0.0.1:0").unwrap();
        donor
            .send_to(&encode_packet(0, 0, 0, b"../escape"), ("127.0.0.1", port))
            .unwrap();

        for _ in 0..100 {
            match dispenser.accept() {
                Ok(Some(_)) => panic!("traversal path accepted"),
                Ok(None) => return,
                Err(RecvError::Retry) => std::thread::sleep(Duration::from_millis(10)),
                Err(err) => panic!("listener error: {:?}", err),
            }
        }
        panic!("datagram never arrived");
    }
}
