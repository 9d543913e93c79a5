//! On-the-wire framing for the dump stream. Every datagram starts with a
//! fixed header; all integer fields are network byte order.

use crate::net::shared::FrameError;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Read;

/// The well-known port panicking kernels transmit to.
pub const PORT: u16 = 20023;

/// Maximum payload per datagram, sized to fit a 1500-byte MTU together with
/// the IP/UDP headers and our own.
pub const DATA_SIZE: usize = 1456;

pub const HEADER_SIZE: usize = 20;
pub const MAX_MSG_SIZE: usize = HEADER_SIZE + DATA_SIZE;
pub const ACK_SIZE: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MsgType {
    Herald,
    Kdh,
    Finished,
    Vmcore,
    Unknown(u32),
}

impl From<u32> for MsgType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => MsgType::Herald,
            1 => MsgType::Kdh,
            2 => MsgType::Finished,
            3 => MsgType::Vmcore,
            other => MsgType::Unknown(other),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Header {
    pub seqno: u32,
    pub mtype: MsgType,
    pub len: u32,
    pub offset: u64,
}

/// A decoded datagram. The payload borrows from the receive buffer.
#[derive(Debug)]
pub struct Packet<'a> {
    pub hdr: Header,
    pub data: &'a [u8],
}

/// Decodes one datagram. The declared payload length must account for every
/// byte after the header, otherwise the frame is rejected.
pub fn decode(datagram: &[u8]) -> Result<Packet<'_>, FrameError> {
    if datagram.len() < HEADER_SIZE {
        return Err(FrameError::Runt { got: datagram.len() });
    }

    let hdr = Header {
        seqno: BigEndian::read_u32(&datagram[0..4]),
        mtype: MsgType::from(BigEndian::read_u32(&datagram[4..8])),
        len: BigEndian::read_u32(&datagram[8..12]),
        offset: BigEndian::read_u64(&datagram[12..20]),
    };

    let actual = datagram.len() - HEADER_SIZE;
    if hdr.len as usize != actual {
        return Err(FrameError::Length { declared: hdr.len, actual });
    }

    Ok(Packet { hdr, data: &datagram[HEADER_SIZE..] })
}

/// Builds the acknowledgement frame for one sequence number.
pub fn encode_ack(seqno: u32) -> [u8; ACK_SIZE] {
    let mut frame = [0u8; ACK_SIZE];
    BigEndian::write_u32(&mut frame, seqno);
    frame
}

const ARCH_LEN: usize = 12;
const HOSTNAME_LEN: usize = 64;
const VERSION_LEN: usize = 192;
const PANIC_LEN: usize = 192;

/// The fixed-layout dump header a donor sends in its KDH packet, describing
/// the image that follows.
#[derive(Debug)]
pub struct DumpHeader {
    pub architecture: String,
    pub dump_length: u64,
    pub dump_time: u64,
    pub block_size: u32,
    pub hostname: String,
    pub version: String,
    pub panic: String,
}

impl DumpHeader {
    pub const SIZE: usize = ARCH_LEN + 8 + 8 + 4 + HOSTNAME_LEN + VERSION_LEN + PANIC_LEN;

    /// Parses the donor-supplied header. String fields are fixed-width and
    /// NUL-padded; the last byte of each is treated as a terminator no
    /// matter what the donor put there.
    pub fn read(payload: &[u8]) -> Result<DumpHeader, FrameError> {
        if payload.len() < Self::SIZE {
            return Err(FrameError::ShortKdh { got: payload.len() });
        }

        let mut stream = payload;

        let mut architecture = [0u8; ARCH_LEN];
        stream.read_exact(&mut architecture)?;
        let dump_length = stream.read_u64::<BigEndian>()?;
        let dump_time = stream.read_u64::<BigEndian>()?;
        let block_size = stream.read_u32::<BigEndian>()?;
        let mut hostname = [0u8; HOSTNAME_LEN];
        stream.read_exact(&mut hostname)?;
        let mut version = [0u8; VERSION_LEN];
        stream.read_exact(&mut version)?;
        let mut panic = [0u8; PANIC_LEN];
        stream.read_exact(&mut panic)?;

        Ok(DumpHeader {
            architecture: terminated(&architecture),
            dump_length,
            dump_time,
            block_size,
            hostname: terminated(&hostname),
            version: terminated(&version),
            panic: terminated(&panic),
        })
    }
}

fn terminated(field: &[u8]) -> String {
    let field = &field[..field.len() - 1];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
pub(crate) fn encode_packet(seqno: u32, mtype: u32, offset: u64, data: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; HEADER_SIZE + data.len()];
    BigEndian::write_u32(&mut datagram[0..4], seqno);
    BigEndian::write_u32(&mut datagram[4..8], mtype);
    BigEndian::write_u32(&mut datagram[8..12], data.len() as u32);
    BigEndian::write_u64(&mut datagram[12..20], offset);
    datagram[HEADER_SIZE..].copy_from_slice(data);
    datagram
}

#[cfg(test)]
pub(crate) fn encode_dump_header(
    architecture: &str,
    dump_length: u64,
    dump_time: u64,
    block_size: u32,
    hostname: &str,
    version: &str,
    panic: &str,
) -> Vec<u8> {
    fn field(out: &mut Vec<u8>, value: &str, width: usize) {
        let mut bytes = vec![0u8; width];
        bytes[..value.len()].copy_from_slice(value.as_bytes());
        out.extend_from_slice(&bytes);
    }

    let mut out = Vec::with_capacity(DumpHeader::SIZE);
    field(&mut out, architecture, ARCH_LEN);
    out.extend_from_slice(&dump_length.to_be_bytes());
    out.extend_from_slice(&dump_time.to_be_bytes());
    out.extend_from_slice(&block_size.to_be_bytes());
    field(&mut out, hostname, HOSTNAME_LEN);
    field(&mut out, version, VERSION_LEN);
    field(&mut out, panic, PANIC_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_roundtrip() {
        let datagram = encode_packet(7, 3, 4096, &[0xAA; 100]);

        let pkt = decode(&datagram).unwrap();

        assert_eq!(pkt.hdr.seqno, 7);
        assert_eq!(pkt.hdr.mtype, MsgType::Vmcore);
        assert_eq!(pkt.hdr.len, 100);
        assert_eq!(pkt.hdr.offset, 4096);
        assert_eq!(pkt.data, &[0xAA; 100][..]);
    }

    #[test]
    fn test_decode_empty_payload() {
        let datagram = encode_packet(5, 2, 0, &[]);

        let pkt = decode(&datagram).unwrap();

        assert_eq!(pkt.hdr.mtype, MsgType::Finished);
        assert!(pkt.data.is_empty());
    }

    #[test]
    fn test_decode_runt() {
        let datagram = encode_packet(0, 1, 0, &[]);

        let result = decode(&datagram[..HEADER_SIZE - 1]);

        assert_eq!(result.unwrap_err(), FrameError::Runt { got: HEADER_SIZE - 1 });
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut datagram = encode_packet(0, 3, 0, &[1, 2, 3, 4]);
        BigEndian::write_u32(&mut datagram[8..12], 3);

        let result = decode(&datagram);

        assert_eq!(result.unwrap_err(), FrameError::Length { declared: 3, actual: 4 });
    }

    #[test]
    fn test_decode_unknown_type() {
        let datagram = encode_packet(1, 99, 0, &[]);

        let pkt = decode(&datagram).unwrap();

        assert_eq!(pkt.hdr.mtype, MsgType::Unknown(99));
    }

    #[test]
    fn test_ack_layout() {
        assert_eq!(encode_ack(0x01020304), [1, 2, 3, 4]);
    }

    #[test]
    fn test_dump_header_roundtrip() {
        let payload = encode_dump_header("amd64", 4096, 1_500_000_000, 512, "donor", "v", "p");

        let hdr = DumpHeader::read(&payload).unwrap();

        assert_eq!(hdr.architecture, "amd64");
        assert_eq!(hdr.dump_length, 4096);
        assert_eq!(hdr.dump_time, 1_500_000_000);
        assert_eq!(hdr.block_size, 512);
        assert_eq!(hdr.hostname, "donor");
        assert_eq!(hdr.version, "v");
        assert_eq!(hdr.panic, "p");
    }

    #[test]
    fn test_dump_header_too_small() {
        let payload = vec![0u8; DumpHeader::SIZE - 1];

        let result = DumpHeader::read(&payload);

        assert_eq!(result.unwrap_err(), FrameError::ShortKdh { got: DumpHeader::SIZE - 1 });
    }

    #[test]
    fn test_dump_header_unterminated_field() {
        // A hostname filling its entire field still loses the final byte to
        // the forced terminator.
        let host: String = std::iter::repeat('h').take(64).collect();
        let payload = encode_dump_header("amd64", 0, 0, 512, &host, "v", "p");

        let hdr = DumpHeader::read(&payload).unwrap();

        assert_eq!(hdr.hostname.len(), 63);
    }
}
