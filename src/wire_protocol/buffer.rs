use std::net::{IpAddr, SocketAddr};

use crate::authority::{Authority, NetworkAddress};
use crate::error::{Error, NetResult};

pub struct ByteBufferParser<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> ByteBufferParser<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        let pos = 0;
        ByteBufferParser { buffer, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    pub fn skip_bytes(&mut self, count: usize) -> NetResult<()> {
        self.eof_check(count)?;
        self.pos += count;
        Ok(())
    }

    pub fn read(&mut self, size: usize) -> NetResult<&'a [u8]> {
        self.eof_check(size)?;
        let range = self.pos..self.pos + size;
        self.pos += size;
        Ok(&self.buffer[range])
    }

    pub fn read_u8(&mut self) -> NetResult<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> NetResult<u16> {
        Ok(u16::from_le_bytes(self.read(2)?.try_into().unwrap()))
    }

    pub fn read_u32_le(&mut self) -> NetResult<u32> {
        Ok(u32::from_le_bytes(self.read(4)?.try_into().unwrap()))
    }

    pub fn read_i32_le(&mut self) -> NetResult<i32> {
        Ok(i32::from_le_bytes(self.read(4)?.try_into().unwrap()))
    }

    pub fn read_u64_le(&mut self) -> NetResult<u64> {
        Ok(u64::from_le_bytes(self.read(8)?.try_into().unwrap()))
    }

    pub fn read_i64_le(&mut self) -> NetResult<i64> {
        Ok(i64::from_le_bytes(self.read(8)?.try_into().unwrap()))
    }

    fn read_u16_be(&mut self) -> NetResult<u16> {
        Ok(u16::from_be_bytes(self.read(2)?.try_into().unwrap()))
    }

    /// 32 raw bytes in natural (unreversed) order.
    pub fn read_hash(&mut self) -> NetResult<[u8; 32]> {
        Ok(self.read(32)?.try_into().unwrap())
    }

    /// Variable length integer
    /// (https://en.bitcoin.it/wiki/Protocol_documentation#Variable_length_integer).
    /// Over-long encodings are rejected; the composer always emits minimal
    /// form, so round-trips are byte-exact.
    pub fn read_varint(&mut self) -> NetResult<u64> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xFD => {
                let value = self.read_u16_le()? as u64;
                Self::minimal_check(value, 0xFD)?;
                value
            }
            0xFE => {
                let value = self.read_u32_le()? as u64;
                Self::minimal_check(value, 0x1_0000)?;
                value
            }
            0xFF => {
                let value = self.read_u64_le()?;
                Self::minimal_check(value, 0x1_0000_0000)?;
                value
            }
            small => small as u64,
        };
        Ok(value)
    }

    fn minimal_check(value: u64, floor: u64) -> NetResult<()> {
        if value < floor {
            Err(Error::BadStream(format!("over-long varint encoding of {value}")))
        } else {
            Ok(())
        }
    }

    /// varint length followed by that many bytes of UTF-8.
    pub fn read_var_string(&mut self) -> NetResult<String> {
        let length = self.read_varint()? as usize;
        let bytes = self.read(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::BadStream("var_string is not valid UTF-8".to_string()))
    }

    /// net address struct without the leading time field, as embedded in
    /// `version` messages. IPv4 travels in IPv6-mapped form and is unmapped
    /// here.
    pub fn parse_net_addr(&mut self) -> NetResult<(u64, SocketAddr)> {
        let services = self.read_u64_le()?;
        let octets: [u8; 16] = self.read(16)?.try_into().unwrap();
        let ip = match octets {
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, a, b, c, d] => {
                IpAddr::from([a, b, c, d])
            }
            other => IpAddr::from(other),
        };
        let port = self.read_u16_be()?;
        Ok((services, SocketAddr::new(ip, port)))
    }

    /// net address struct with the leading time field, as carried in `addr`
    /// payload entries.
    pub fn parse_net_addr_with_time(&mut self) -> NetResult<NetworkAddress> {
        let timestamp = self.read_u32_le()?;
        let (services, addr) = self.parse_net_addr()?;
        Ok(NetworkAddress::new(Authority::from(addr), services, timestamp))
    }

    fn eof_check(&self, want_bytes: usize) -> NetResult<()> {
        if self.remaining() < want_bytes {
            Err(Error::BadStream(format!(
                "can not read {} bytes from buffer of size {}",
                want_bytes,
                self.buffer.len()
            )))
        } else {
            Ok(())
        }
    }
}

pub struct ByteBufferComposer {
    buffer: Vec<u8>,
}

impl ByteBufferComposer {
    pub fn new() -> Self {
        ByteBufferComposer { buffer: vec![] }
    }

    pub fn result(self) -> Vec<u8> {
        self.buffer
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Minimal-form variable length integer.
    pub fn append_varint(&mut self, n: u64) {
        match n {
            0..=0xFC => self.append(&[n as u8]),
            0xFD..=0xFFFF => {
                self.append(&[0xFD]);
                self.append(&(n as u16).to_le_bytes());
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.append(&[0xFE]);
                self.append(&(n as u32).to_le_bytes());
            }
            _ => {
                self.append(&[0xFF]);
                self.append(&n.to_le_bytes());
            }
        }
    }

    pub fn append_var_string(&mut self, s: &str) {
        self.append_varint(s.len() as u64);
        self.append(s.as_bytes());
    }

    /// 32 raw bytes in natural (unreversed) order.
    pub fn append_hash(&mut self, hash: &[u8; 32]) {
        self.append(hash);
    }

    /// net address struct without time field
    pub fn append_net_addr(&mut self, services: u64, addr: &SocketAddr) {
        self.append(&services.to_le_bytes());
        let ipv6_octets = match &addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        };
        self.append(&ipv6_octets);
        self.append(&addr.port().to_be_bytes());
    }

    /// net address struct with time field
    pub fn append_net_addr_with_time(&mut self, address: &NetworkAddress) {
        self.append(&address.timestamp.to_le_bytes());
        self.append_net_addr(address.services, &address.authority.socket_addr());
    }
}

impl Default for ByteBufferComposer {
    fn default() -> Self {
        ByteBufferComposer::new()
    }
}

pub struct IOBuffer {
    buffer: [u8; Self::CAPACITY],
    /// length of valid content (starts at index 0)
    mark: usize,
}

impl IOBuffer {
    /// Large enough for a complete 1000-entry `addr` batch plus headroom.
    pub const CAPACITY: usize = 64 * 1024;

    pub fn content(&self) -> &[u8] {
        &self.buffer[..self.mark]
    }

    pub fn expose_writable_part(&mut self) -> &mut [u8] {
        &mut self.buffer[self.mark..]
    }

    /// Increase buffer mark by `size`.
    /// This method is used to make the buffer aware of new bytes written into
    /// the slice returned by [Self::expose_writable_part]
    pub fn register_added_content(&mut self, size: usize) {
        assert!(self.mark + size <= self.buffer.len());
        self.mark += size;
    }

    /// removes `size` bytes from beginning of buffer. reduces `mark` by `size`
    pub fn shift_left(&mut self, size: usize) {
        assert!(size <= self.mark);
        self.buffer.rotate_left(size);
        self.mark -= size;
    }
}

impl Default for IOBuffer {
    fn default() -> Self {
        IOBuffer {
            buffer: [0_u8; Self::CAPACITY],
            mark: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;
    use rstest::*;

    use super::*;

    #[rstest]
    #[case(0, & hex ! ("00"))]
    #[case(252, & hex ! ("FC"))]
    #[case(253, & hex ! ("FDFD00"))]
    #[case(65535, & hex ! ("FDFFFF"))]
    #[case(65536, & hex ! ("FE00000100"))]
    #[case(0xFFFF_FFFF, & hex ! ("FEFFFFFFFF"))]
    #[case(0x1_0000_0000, & hex ! ("FF0000000001000000"))]
    #[case(u64::MAX, & hex ! ("FFFFFFFFFFFFFFFFFF"))]
    fn varint_encoding_vectors(#[case] value: u64, #[case] expected: &[u8]) {
        let mut composer = ByteBufferComposer::new();
        composer.append_varint(value);
        let encoded = composer.result();
        assert_eq!(encoded, expected);

        let mut parser = ByteBufferParser::new(&encoded);
        assert_eq!(parser.read_varint().unwrap(), value);
        assert_eq!(parser.remaining(), 0);
    }

    #[rstest]
    #[case(& hex ! ("FD1000"))] // 0x10 belongs in a single byte
    #[case(& hex ! ("FDFC00"))]
    #[case(& hex ! ("FEFFFF0000"))]
    #[case(& hex ! ("FF0000000000000000"))]
    fn varint_rejects_over_long_encodings(#[case] encoded: &[u8]) {
        let mut parser = ByteBufferParser::new(encoded);
        assert!(parser.read_varint().is_err());
    }

    #[test]
    fn varint_reports_truncated_input() {
        let mut parser = ByteBufferParser::new(&hex!("FDFF"));
        assert!(parser.read_varint().is_err());
    }

    #[test]
    fn parser_skips_and_tracks_position() {
        let mut parser = ByteBufferParser::new(&[1, 2, 3, 4, 5]);
        parser.skip_bytes(2).unwrap();
        assert_eq!(parser.pos(), 2);
        assert_eq!(parser.read(2).unwrap(), &[3, 4]);
        assert_eq!(parser.remaining(), 1);
        assert!(parser.skip_bytes(2).is_err());
    }

    #[test]
    fn var_string_round_trip() {
        let mut composer = ByteBufferComposer::new();
        composer.append_var_string("/bitcoin-net:0.1.0/");
        let encoded = composer.result();
        assert_eq!(encoded[0], 19);

        let mut parser = ByteBufferParser::new(&encoded);
        assert_eq!(parser.read_var_string().unwrap(), "/bitcoin-net:0.1.0/");
    }

    #[test]
    fn hash_fields_keep_natural_byte_order() {
        let hash = hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        let mut composer = ByteBufferComposer::new();
        composer.append_hash(&hash);
        let encoded = composer.result();
        assert_eq!(encoded, hash);

        let mut parser = ByteBufferParser::new(&encoded);
        assert_eq!(parser.read_hash().unwrap(), hash);
    }

    #[rstest]
    #[case("203.0.113.7:8333")]
    #[case("[2001:db8::1]:18333")]
    fn net_addr_round_trip(#[case] input: &str) {
        let addr: SocketAddr = input.parse().unwrap();
        let mut composer = ByteBufferComposer::new();
        composer.append_net_addr(1, &addr);
        let encoded = composer.result();
        assert_eq!(encoded.len(), 26);

        let mut parser = ByteBufferParser::new(&encoded);
        let (services, parsed) = parser.parse_net_addr().unwrap();
        assert_eq!(services, 1);
        assert_eq!(parsed, addr);
    }

    #[test]
    fn net_addr_with_time_round_trip() {
        let address = NetworkAddress::new("[2001:db8::2]:8333".parse().unwrap(), 5, 1700000000);
        let mut composer = ByteBufferComposer::new();
        composer.append_net_addr_with_time(&address);
        let encoded = composer.result();
        assert_eq!(encoded.len(), 30);

        let mut parser = ByteBufferParser::new(&encoded);
        assert_eq!(parser.parse_net_addr_with_time().unwrap(), address);
    }

    #[test]
    fn io_buffer_shift_left_keeps_remainder() {
        let mut buffer = IOBuffer::default();
        buffer.expose_writable_part()[..4].copy_from_slice(b"abcd");
        buffer.register_added_content(4);
        buffer.shift_left(2);
        assert_eq!(buffer.content(), b"cd");
    }
}
