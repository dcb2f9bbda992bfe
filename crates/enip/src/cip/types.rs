//! CIP elementary data types and the tagged attribute value union.

use bytes::BufMut;
use std::net::Ipv4Addr;

use super::error::{Error, Result};

/// Well-known CIP class codes.
pub struct ClassCode;

impl ClassCode {
    pub const IDENTITY: u32 = 0x01;
    pub const MESSAGE_ROUTER: u32 = 0x02;
    pub const ASSEMBLY: u32 = 0x04;
    pub const CONNECTION_MANAGER: u32 = 0x06;
    pub const TCP_IP_INTERFACE: u32 = 0xF5;

    /// First class id of the vendor/reserved range.
    pub const RESERVED_RANGE_START: u32 = 0xC8;
}

/// Common CIP service codes.
pub struct ServiceCode;

impl ServiceCode {
    pub const GET_ATTRIBUTE_ALL: u8 = 0x01;
    pub const RESET: u8 = 0x05;
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const UNCONNECTED_SEND: u8 = 0x52;
    pub const FORWARD_OPEN: u8 = 0x54;
    pub const GET_CONNECTION_OWNER: u8 = 0x5A;
    pub const LARGE_FORWARD_OPEN: u8 = 0x5B;
}

/// Bit set on the service code of every reply.
pub const REPLY_SERVICE_FLAG: u8 = 0x80;

/// Device revision (identity attribute 4, electronic key comparison).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
}

/// TCP/IP interface object attribute 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfiguration {
    pub ip_address: Ipv4Addr,
    pub network_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub name_server: Ipv4Addr,
    pub name_server_2: Ipv4Addr,
    pub domain_name: String,
}

impl Default for InterfaceConfiguration {
    fn default() -> Self {
        Self {
            ip_address: Ipv4Addr::UNSPECIFIED,
            network_mask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            name_server: Ipv4Addr::UNSPECIFIED,
            name_server_2: Ipv4Addr::UNSPECIFIED,
            domain_name: String::new(),
        }
    }
}

/// A padded EPath pointing at class/instance(/attribute), as stored in
/// attributes such as the TCP/IP object's physical link (attribute 4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaddedPath {
    pub class_id: u32,
    pub instance_id: u32,
    pub attribute_id: Option<u32>,
}

impl PaddedPath {
    /// Encode as word count followed by padded logical segments.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut segments = Vec::new();
        encode_padded_logical(&mut segments, 0x20, self.class_id);
        encode_padded_logical(&mut segments, 0x24, self.instance_id);
        if let Some(attribute) = self.attribute_id {
            encode_padded_logical(&mut segments, 0x30, attribute);
        }
        buf.put_u16_le((segments.len() / 2) as u16);
        buf.put_slice(&segments);
    }
}

/// Encode one padded logical segment (8- or 16-bit value form).
fn encode_padded_logical(buf: &mut Vec<u8>, segment: u8, value: u32) {
    if value <= 0xFF {
        buf.put_u8(segment);
        buf.put_u8(value as u8);
    } else {
        buf.put_u8(segment | 0x01);
        buf.put_u8(0);
        buf.put_u16_le(value as u16);
    }
}

/// Attribute access flags.
pub struct AttributeFlags;

impl AttributeFlags {
    /// Readable through GetAttributeSingle.
    pub const GETABLE_SINGLE: u8 = 0x01;
    /// Included in GetAttributeAll output.
    pub const GETABLE_ALL: u8 = 0x02;
    /// Writable through SetAttributeSingle.
    pub const SETTABLE: u8 = 0x04;

    pub const GETABLE: u8 = Self::GETABLE_SINGLE | Self::GETABLE_ALL;
}

/// Tagged union over the CIP elementary types plus the composite
/// holders used by the identity and TCP/IP objects.
///
/// Encoders and decoders dispatch on the tag; attribute storage keeps
/// its tag for the lifetime of the class registry, so a set-service can
/// never change an attribute's type.
#[derive(Debug, Clone, PartialEq)]
pub enum CipValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    Ulint(u64),
    Real(f32),
    Byte(u8),
    Word(u16),
    Dword(u32),
    String(String),
    ShortString(String),
    Epath(PaddedPath),
    ByteArray(Vec<u8>),
    Revision(Revision),
    InterfaceConfiguration(InterfaceConfiguration),
}

impl CipValue {
    /// Append the wire representation (little-endian) to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Bool(v) => buf.put_u8(u8::from(*v)),
            Self::Sint(v) => buf.put_i8(*v),
            Self::Int(v) => buf.put_i16_le(*v),
            Self::Dint(v) => buf.put_i32_le(*v),
            Self::Lint(v) => buf.put_i64_le(*v),
            Self::Usint(v) | Self::Byte(v) => buf.put_u8(*v),
            Self::Uint(v) | Self::Word(v) => buf.put_u16_le(*v),
            Self::Udint(v) | Self::Dword(v) => buf.put_u32_le(*v),
            Self::Ulint(v) => buf.put_u64_le(*v),
            Self::Real(v) => buf.put_f32_le(*v),
            Self::String(s) => {
                buf.put_u16_le(s.len() as u16);
                buf.put_slice(s.as_bytes());
            }
            Self::ShortString(s) => {
                buf.put_u8(s.len() as u8);
                buf.put_slice(s.as_bytes());
            }
            Self::Epath(path) => path.encode(buf),
            Self::ByteArray(data) => buf.put_slice(data),
            Self::Revision(rev) => {
                buf.put_u8(rev.major);
                buf.put_u8(rev.minor);
            }
            Self::InterfaceConfiguration(cfg) => {
                buf.put_slice(&cfg.ip_address.octets());
                buf.put_slice(&cfg.network_mask.octets());
                buf.put_slice(&cfg.gateway.octets());
                buf.put_slice(&cfg.name_server.octets());
                buf.put_slice(&cfg.name_server_2.octets());
                buf.put_u16_le(cfg.domain_name.len() as u16);
                buf.put_slice(cfg.domain_name.as_bytes());
            }
        }
    }

    /// Wire length of the encoded value.
    pub fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    /// Decode `data` into this value, keeping the tag.
    ///
    /// Returns the number of bytes consumed. Fails on short input;
    /// callers reject trailing bytes.
    pub fn decode_into(&mut self, data: &[u8]) -> Result<usize> {
        fn need(data: &[u8], n: usize) -> Result<()> {
            if data.len() < n {
                return Err(Error::Truncated {
                    expected: n,
                    actual: data.len(),
                });
            }
            Ok(())
        }

        match self {
            Self::Bool(v) => {
                need(data, 1)?;
                *v = data[0] != 0;
                Ok(1)
            }
            Self::Sint(v) => {
                need(data, 1)?;
                *v = data[0] as i8;
                Ok(1)
            }
            Self::Int(v) => {
                need(data, 2)?;
                *v = i16::from_le_bytes([data[0], data[1]]);
                Ok(2)
            }
            Self::Dint(v) => {
                need(data, 4)?;
                *v = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                Ok(4)
            }
            Self::Lint(v) => {
                need(data, 8)?;
                *v = i64::from_le_bytes(data[..8].try_into().expect("length checked"));
                Ok(8)
            }
            Self::Usint(v) | Self::Byte(v) => {
                need(data, 1)?;
                *v = data[0];
                Ok(1)
            }
            Self::Uint(v) | Self::Word(v) => {
                need(data, 2)?;
                *v = u16::from_le_bytes([data[0], data[1]]);
                Ok(2)
            }
            Self::Udint(v) | Self::Dword(v) => {
                need(data, 4)?;
                *v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                Ok(4)
            }
            Self::Ulint(v) => {
                need(data, 8)?;
                *v = u64::from_le_bytes(data[..8].try_into().expect("length checked"));
                Ok(8)
            }
            Self::Real(v) => {
                need(data, 4)?;
                *v = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                Ok(4)
            }
            Self::ByteArray(stored) => {
                need(data, stored.len())?;
                let len = stored.len();
                stored.copy_from_slice(&data[..len]);
                Ok(len)
            }
            _ => Err(Error::InvalidFrame(
                "composite attribute is not settable from the wire".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut value = CipValue::Uint(0);
        let mut buf = Vec::new();
        CipValue::Uint(0xBEEF).encode(&mut buf);
        assert_eq!(buf, [0xEF, 0xBE]);
        assert_eq!(value.decode_into(&buf).unwrap(), 2);
        assert_eq!(value, CipValue::Uint(0xBEEF));
    }

    #[test]
    fn test_udint_encoding_is_little_endian() {
        let mut buf = Vec::new();
        CipValue::Udint(0x1234_5678).encode(&mut buf);
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_short_string_encoding() {
        let mut buf = Vec::new();
        CipValue::ShortString("enip".into()).encode(&mut buf);
        assert_eq!(buf, [4, b'e', b'n', b'i', b'p']);
    }

    #[test]
    fn test_byte_array_decode_requires_exact_backing_size() {
        let mut value = CipValue::ByteArray(vec![0; 4]);
        assert!(value.decode_into(&[1, 2]).is_err());
        assert_eq!(value.decode_into(&[1, 2, 3, 4]).unwrap(), 4);
        assert_eq!(value, CipValue::ByteArray(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_composite_not_settable() {
        let mut value = CipValue::Revision(Revision { major: 1, minor: 2 });
        assert!(value.decode_into(&[3, 4]).is_err());
    }

    #[test]
    fn test_padded_path_encoding() {
        let mut buf = Vec::new();
        PaddedPath {
            class_id: 0xF6,
            instance_id: 1,
            attribute_id: None,
        }
        .encode(&mut buf);
        // 2 words: 8-bit class segment + 8-bit instance segment.
        assert_eq!(buf, [0x02, 0x00, 0x20, 0xF6, 0x24, 0x01]);
    }

    #[test]
    fn test_interface_configuration_encoding() {
        let mut buf = Vec::new();
        CipValue::InterfaceConfiguration(InterfaceConfiguration {
            ip_address: Ipv4Addr::new(192, 168, 0, 2),
            network_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 0, 1),
            name_server: Ipv4Addr::UNSPECIFIED,
            name_server_2: Ipv4Addr::UNSPECIFIED,
            domain_name: "io".into(),
        })
        .encode(&mut buf);
        assert_eq!(&buf[..4], &[192, 168, 0, 2]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 0]);
        assert_eq!(&buf[24..26], &[2, 0]);
        assert_eq!(&buf[26..], b"io");
    }
}
