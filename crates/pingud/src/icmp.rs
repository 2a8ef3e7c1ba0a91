//! ICMP echo framing
//!
//! Raw ICMP sockets see every ICMP datagram arriving on the device, so every
//! datagram goes through [`parse_echo_reply`] before any host logic looks at
//! it. Anything that is not a well-formed echo reply is rejected here.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, Ipv4Packet};
use std::net::Ipv4Addr;

/// Payload carried by every echo request
pub const ECHO_PAYLOAD: &[u8] = b"pingu link probe";

/// Correlation keys extracted from a valid echo reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    /// Echo identifier
    pub ident: u16,
    /// Echo sequence number
    pub seq: u16,
    /// Address the reply came from
    pub source: Ipv4Addr,
}

/// Build an ICMP echo request (ICMP header + payload, no IP header)
pub fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no: seq,
        data: ECHO_PAYLOAD,
    };

    let mut buf = vec![0u8; repr.buffer_len()];
    let mut packet = Icmpv4Packet::new_unchecked(&mut buf);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    buf
}

/// Parse a datagram read from a raw IPv4 ICMP socket
///
/// The kernel hands raw sockets the full IPv4 datagram, header included.
/// Returns `None` for truncated packets, non-ICMP payloads, bad ICMP
/// checksums and any ICMP message other than an echo reply with code 0.
pub fn parse_echo_reply(datagram: &[u8], source: Ipv4Addr) -> Option<EchoReply> {
    let ip = Ipv4Packet::new_checked(datagram).ok()?;
    if ip.next_header() != IpProtocol::Icmp {
        return None;
    }

    let icmp = Icmpv4Packet::new_checked(ip.payload()).ok()?;
    if !icmp.verify_checksum() {
        return None;
    }
    if icmp.msg_type() != Icmpv4Message::EchoReply || icmp.msg_code() != 0 {
        return None;
    }

    Some(EchoReply {
        ident: icmp.echo_ident(),
        seq: icmp.echo_seq_no(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wrap an ICMP message in a minimal IPv4 header
    fn ipv4_datagram(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let total_len = (20 + payload.len()) as u16;
        let mut buf = vec![0x45, 0x00];
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 64, protocol, 0, 0]);
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());
        buf.extend_from_slice(payload);
        buf
    }

    fn echo_reply(ident: u16, seq: u16) -> Vec<u8> {
        let repr = Icmpv4Repr::EchoReply {
            ident,
            seq_no: seq,
            data: ECHO_PAYLOAD,
        };
        let mut buf = vec![0u8; repr.buffer_len()];
        let mut packet = Icmpv4Packet::new_unchecked(&mut buf);
        repr.emit(&mut packet, &ChecksumCapabilities::default());
        buf
    }

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 100);

    #[test]
    fn test_build_echo_request() {
        let buf = build_echo_request(0x1234, 7);
        let packet = Icmpv4Packet::new_checked(&buf[..]).unwrap();
        assert_eq!(packet.msg_type(), Icmpv4Message::EchoRequest);
        assert_eq!(packet.echo_ident(), 0x1234);
        assert_eq!(packet.echo_seq_no(), 7);
        assert!(packet.verify_checksum());
    }

    #[test]
    fn test_parse_valid_reply() {
        let datagram = ipv4_datagram(SRC, DST, 1, &echo_reply(0x1234, 7));
        let reply = parse_echo_reply(&datagram, SRC).unwrap();
        assert_eq!(
            reply,
            EchoReply {
                ident: 0x1234,
                seq: 7,
                source: SRC
            }
        );
    }

    #[test]
    fn test_parse_rejects_echo_request() {
        // Our own outgoing requests are looped back to raw sockets on some setups
        let datagram = ipv4_datagram(SRC, DST, 1, &build_echo_request(0x1234, 7));
        assert!(parse_echo_reply(&datagram, SRC).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut icmp = echo_reply(0x1234, 7);
        icmp[2] ^= 0xff;
        let datagram = ipv4_datagram(SRC, DST, 1, &icmp);
        assert!(parse_echo_reply(&datagram, SRC).is_none());
    }

    #[test]
    fn test_parse_rejects_non_icmp() {
        let datagram = ipv4_datagram(SRC, DST, 17, &echo_reply(0x1234, 7));
        assert!(parse_echo_reply(&datagram, SRC).is_none());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let datagram = ipv4_datagram(SRC, DST, 1, &echo_reply(0x1234, 7));
        assert!(parse_echo_reply(&datagram[..24], SRC).is_none());
        assert!(parse_echo_reply(&[0x45, 0x00], SRC).is_none());
        assert!(parse_echo_reply(&[], SRC).is_none());
    }

    #[test]
    fn test_parse_rejects_nonzero_code() {
        let mut icmp = echo_reply(0x1234, 7);
        icmp[1] = 1;
        // Fix up the checksum so only the code is wrong
        let mut packet = Icmpv4Packet::new_unchecked(&mut icmp);
        packet.fill_checksum();
        let datagram = ipv4_datagram(SRC, DST, 1, &icmp);
        assert!(parse_echo_reply(&datagram, SRC).is_none());
    }
}
