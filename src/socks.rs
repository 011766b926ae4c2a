//! SOCKS5 wire constants and the address-header codec described in
//! spec.md §6. A real deployment treats the header parser as an
//! external collaborator (spec.md §1); this is a from-scratch
//! reimplementation of its documented contract, not a port of any
//! existing parser.

use byteorder::{BigEndian, ByteOrder};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NOAUTH: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Fixed SOCKS5 CONNECT success reply. BND.ADDR/BND.PORT are dummy
/// values (`10 10` = 4112); historical, must stay bit-exact.
pub const CONNECT_SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x10, 0x10];

/// A decoded address header: host (dotted-quad, bracketed IPv6 text,
/// or domain name), port, and the number of input bytes it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

/// Decodes `ATYP ADDR PORT` from the front of `data`.
///
/// Returns `None` if `data` does not contain a complete header yet, or
/// is malformed enough to be unrecoverable (unknown ATYP, truncated
/// domain length). Returns `(Address, consumed)` otherwise, where
/// `consumed` is the number of bytes the header occupied so that a
/// caller can split off any residual payload bytes.
pub fn parse_header(data: &[u8]) -> Option<(Address, usize)> {
    if data.is_empty() {
        return None;
    }
    let atyp = data[0];
    match atyp {
        ATYP_IPV4 => {
            if data.len() < 1 + 4 + 2 {
                return None;
            }
            let host = std::net::Ipv4Addr::new(data[1], data[2], data[3], data[4]).to_string();
            let port = BigEndian::read_u16(&data[5..7]);
            Some((Address { host, port }, 7))
        }
        ATYP_IPV6 => {
            if data.len() < 1 + 16 + 2 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            let host = std::net::Ipv6Addr::from(octets).to_string();
            let port = BigEndian::read_u16(&data[17..19]);
            Some((Address { host, port }, 19))
        }
        ATYP_DOMAIN => {
            if data.len() < 2 {
                return None;
            }
            let len = data[1] as usize;
            let total = 2 + len + 2;
            if data.len() < total {
                return None;
            }
            let host = std::str::from_utf8(&data[2..2 + len]).ok()?.to_owned();
            let port = BigEndian::read_u16(&data[2 + len..total]);
            Some((Address { host, port }, total))
        }
        _ => None,
    }
}

/// Encodes an address header the way the local role does when it
/// strips `VER CMD RSV` off a client CONNECT request and forwards the
/// remainder: used only by tests here to build fixtures, since in the
/// handler the original client bytes are forwarded verbatim.
#[cfg(test)]
pub fn encode_ipv4_header(addr: std::net::Ipv4Addr, port: u16) -> Vec<u8> {
    let mut buf = vec![ATYP_IPV4];
    buf.extend_from_slice(&addr.octets());
    let mut port_buf = [0u8; 2];
    BigEndian::write_u16(&mut port_buf, port);
    buf.extend_from_slice(&port_buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_ipv4_header() {
        let raw = [0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let (addr, consumed) = parse_header(&raw).unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 80);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn parses_domain_header_with_trailing_payload() {
        let mut raw = vec![0x03, 0x0b];
        raw.extend_from_slice(b"example.com");
        raw.extend_from_slice(&[0x01, 0xBB]);
        raw.extend_from_slice(b"payload");
        let (addr, consumed) = parse_header(&raw).unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 443);
        assert_eq!(&raw[consumed..], b"payload");
    }

    #[test]
    fn truncated_domain_header_is_incomplete() {
        let raw = [0x03, 0x0b, b'e', b'x'];
        assert!(parse_header(&raw).is_none());
    }

    #[test]
    fn unknown_atyp_is_rejected() {
        let raw = [0x7F, 0x00];
        assert!(parse_header(&raw).is_none());
    }

    #[test]
    fn round_trips_through_ipv4_encoder() {
        let raw = encode_ipv4_header(Ipv4Addr::new(10, 0, 0, 1), 9000);
        let (addr, consumed) = parse_header(&raw).unwrap();
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 9000);
        assert_eq!(consumed, raw.len());
    }
}
