//! Fixed-size binary frame headers.
//!
//! Only the pieces the connection core needs: the 24-byte response header the
//! receive loop decodes, the matching request header encoder used by the
//! authentication handshake, and the status code catalogue. Command payload
//! encoding lives with the request types, outside this crate.

use crate::error::TransportError;

pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;
pub const RESPONSE_HEADER_LEN: usize = 24;

/// Protocol status code carried in every response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    AuthError,
    StepRequired,
    UnknownCommand,
    OutOfMemory,
    Unknown(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0020 => Status::AuthError,
            0x0021 => Status::StepRequired,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            other => Status::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::AuthError => 0x0020,
            Status::StepRequired => 0x0021,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Unknown(other) => *other,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Status::NoError)
    }
}

/// Decoded response header.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extra_len: u8,
    pub data_type: u8,
    pub status: Status,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, TransportError> {
        if buf[0] != RESPONSE_MAGIC {
            return Err(TransportError::Protocol(format!(
                "bad response magic {:#04x}",
                buf[0]
            )));
        }
        Ok(Self {
            opcode: buf[1],
            key_len: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            extra_len: buf[4],
            data_type: buf[5],
            status: Status::from_code(u16::from_be_bytes(buf[6..8].try_into().unwrap())),
            total_body_len: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0] = RESPONSE_MAGIC;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[4] = self.extra_len;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.status.code().to_be_bytes());
        buf[8..12].copy_from_slice(&self.total_body_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }

    /// Message segment length: total body minus the extra segment. A body
    /// shorter than its extra segment clamps to zero instead of underflowing.
    pub fn message_len(&self) -> usize {
        (self.total_body_len as usize).saturating_sub(self.extra_len as usize)
    }
}

/// Encodes a request header into `buf`. `total_body_len` covers extras, key
/// and value together.
pub fn write_request_header(
    buf: &mut Vec<u8>,
    opcode: u8,
    key_len: u16,
    extra_len: u8,
    total_body_len: u32,
    opaque: u32,
) {
    buf.push(REQUEST_MAGIC);
    buf.push(opcode);
    buf.extend_from_slice(&key_len.to_be_bytes());
    buf.push(extra_len);
    buf.push(0); // data type
    buf.extend_from_slice(&0u16.to_be_bytes()); // vbucket, unused
    buf.extend_from_slice(&total_body_len.to_be_bytes());
    buf.extend_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes()); // cas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_encoded_header() {
        let header = ResponseHeader {
            opcode: 0x01,
            key_len: 3,
            extra_len: 4,
            data_type: 0,
            status: Status::KeyNotFound,
            total_body_len: 12,
            opaque: 0xdead_beef,
            cas: 42,
        };
        let parsed = ResponseHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed.opcode, 0x01);
        assert_eq!(parsed.key_len, 3);
        assert_eq!(parsed.extra_len, 4);
        assert_eq!(parsed.status, Status::KeyNotFound);
        assert_eq!(parsed.total_body_len, 12);
        assert_eq!(parsed.opaque, 0xdead_beef);
        assert_eq!(parsed.cas, 42);
        assert_eq!(parsed.message_len(), 8);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0] = REQUEST_MAGIC;
        assert!(ResponseHeader::parse(&buf).is_err());
    }

    #[test]
    fn message_len_clamps_short_body() {
        let header = ResponseHeader {
            opcode: 0,
            key_len: 0,
            extra_len: 8,
            data_type: 0,
            status: Status::NoError,
            total_body_len: 4,
            opaque: 0,
            cas: 0,
        };
        assert_eq!(header.message_len(), 0);
    }

    #[test]
    fn status_codes_round_trip() {
        for code in [0x0000, 0x0001, 0x0005, 0x0020, 0x0021, 0x0081, 0x0082] {
            assert_eq!(Status::from_code(code).code(), code);
        }
        assert_eq!(Status::from_code(0x7777), Status::Unknown(0x7777));
        assert_eq!(Status::Unknown(0x7777).code(), 0x7777);
        assert!(Status::AuthError.is_error());
        assert!(!Status::NoError.is_error());
    }

    #[test]
    fn request_header_layout() {
        let mut buf = Vec::new();
        write_request_header(&mut buf, 0x21, 5, 0, 16, 7);
        assert_eq!(buf.len(), RESPONSE_HEADER_LEN);
        assert_eq!(buf[0], REQUEST_MAGIC);
        assert_eq!(buf[1], 0x21);
        assert_eq!(u16::from_be_bytes(buf[2..4].try_into().unwrap()), 5);
        assert_eq!(u32::from_be_bytes(buf[8..12].try_into().unwrap()), 16);
        assert_eq!(u32::from_be_bytes(buf[12..16].try_into().unwrap()), 7);
    }
}
