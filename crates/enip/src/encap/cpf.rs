//! Common Packet Format codec: the item-list framing between the
//! encapsulation header and individual CIP messages.

use bytes::BufMut;
use std::net::Ipv4Addr;

use crate::cip::error::{Error, Result};

/// CPF item type identifiers.
pub struct ItemId;

impl ItemId {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const LIST_IDENTITY_RESPONSE: u16 = 0x000C;
    pub const CONNECTION_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
    pub const LIST_SERVICES_RESPONSE: u16 = 0x0100;
    pub const SOCKADDR_INFO_O_TO_T: u16 = 0x8000;
    pub const SOCKADDR_INFO_T_TO_O: u16 = 0x8001;
    pub const SEQUENCED_ADDRESS: u16 = 0x8002;
}

/// The address item leading a CPF frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressItem {
    #[default]
    Null,
    Connection {
        connection_id: u32,
    },
    Sequenced {
        connection_id: u32,
        sequence: u32,
    },
}

impl AddressItem {
    /// The connection identifier, when the item carries one.
    pub fn connection_id(&self) -> Option<u32> {
        match self {
            Self::Null => None,
            Self::Connection { connection_id } | Self::Sequenced { connection_id, .. } => {
                Some(*connection_id)
            }
        }
    }

    /// The EIP-level sequence number of a sequenced address item.
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Self::Sequenced { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}

/// Direction tag of a sockaddr info item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockaddrDirection {
    OriginatorToTarget,
    TargetToOriginator,
}

impl SockaddrDirection {
    fn item_id(self) -> u16 {
        match self {
            Self::OriginatorToTarget => ItemId::SOCKADDR_INFO_O_TO_T,
            Self::TargetToOriginator => ItemId::SOCKADDR_INFO_T_TO_O,
        }
    }
}

/// A sockaddr info item: the 16-byte BSD `sockaddr_in` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockaddrInfo {
    pub direction: SockaddrDirection,
    pub port: u16,
    pub address: Ipv4Addr,
}

impl SockaddrInfo {
    const PAYLOAD_LEN: usize = 16;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.direction.item_id());
        buf.put_u16_le(Self::PAYLOAD_LEN as u16);
        buf.put_u16(2); // AF_INET, big-endian like the rest of the image
        buf.put_u16(self.port);
        buf.put_slice(&self.address.octets());
        buf.put_slice(&[0u8; 8]);
    }

    fn decode(direction: SockaddrDirection, payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::PAYLOAD_LEN {
            return Err(Error::Truncated {
                expected: Self::PAYLOAD_LEN,
                actual: payload.len(),
            });
        }
        Ok(Self {
            direction,
            port: u16::from_be_bytes([payload[2], payload[3]]),
            address: Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]),
        })
    }
}

/// A decoded CPF frame: address item, optional data item, up to two
/// sockaddr info items. The data payload borrows from the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpfPacket<'a> {
    pub address: AddressItem,
    /// (item type id, payload bytes)
    pub data: Option<(u16, &'a [u8])>,
    pub sockaddr_info: [Option<SockaddrInfo>; 2],
}

impl<'a> CpfPacket<'a> {
    /// Decode an item list. The summed item lengths must equal the
    /// input length.
    pub fn decode(data: &'a [u8]) -> Result<CpfPacket<'a>> {
        fn item_header(input: &mut &[u8]) -> Result<(u16, usize)> {
            if input.len() < 4 {
                return Err(Error::Truncated {
                    expected: 4,
                    actual: input.len(),
                });
            }
            let type_id = u16::from_le_bytes([input[0], input[1]]);
            let length = u16::from_le_bytes([input[2], input[3]]) as usize;
            *input = &input[4..];
            if input.len() < length {
                return Err(Error::Truncated {
                    expected: length,
                    actual: input.len(),
                });
            }
            Ok((type_id, length))
        }

        let mut input = data;
        if input.len() < 2 {
            return Err(Error::Truncated {
                expected: 2,
                actual: input.len(),
            });
        }
        let item_count = u16::from_le_bytes([input[0], input[1]]);
        input = &input[2..];

        let mut packet = CpfPacket::default();

        if item_count >= 1 {
            let (type_id, length) = item_header(&mut input)?;
            packet.address = if type_id == ItemId::NULL_ADDRESS && length == 0 {
                AddressItem::Null
            } else if type_id == ItemId::CONNECTION_ADDRESS && length == 4 {
                AddressItem::Connection {
                    connection_id: u32::from_le_bytes([input[0], input[1], input[2], input[3]]),
                }
            } else if type_id == ItemId::SEQUENCED_ADDRESS && length == 8 {
                AddressItem::Sequenced {
                    connection_id: u32::from_le_bytes([input[0], input[1], input[2], input[3]]),
                    sequence: u32::from_le_bytes([input[4], input[5], input[6], input[7]]),
                }
            } else {
                return Err(Error::InvalidItems(format!(
                    "unexpected address item {type_id:#06x} with length {length}"
                )));
            };
            input = &input[length..];
        }

        if item_count >= 2 {
            let (type_id, length) = item_header(&mut input)?;
            packet.data = Some((type_id, &input[..length]));
            input = &input[length..];
        }

        for slot in 0..(item_count.saturating_sub(2) as usize).min(2) {
            let (type_id, length) = item_header(&mut input)?;
            let direction = if type_id == ItemId::SOCKADDR_INFO_O_TO_T {
                SockaddrDirection::OriginatorToTarget
            } else if type_id == ItemId::SOCKADDR_INFO_T_TO_O {
                SockaddrDirection::TargetToOriginator
            } else {
                return Err(Error::InvalidItems(format!(
                    "unexpected trailing item {type_id:#06x}"
                )));
            };
            packet.sockaddr_info[slot] =
                Some(SockaddrInfo::decode(direction, &input[..length])?);
            input = &input[length..];
        }

        if !input.is_empty() {
            return Err(Error::InvalidItems(format!(
                "{} bytes left after {item_count} items",
                input.len()
            )));
        }

        Ok(packet)
    }

    /// Encode the frame.
    ///
    /// With `interface_prefix` the 6-byte interface-handle + timeout
    /// prefix of SendRRData/SendUnitData is emitted first. Sockaddr
    /// items always go out O->T first, then T->O: some peers assume
    /// that order even though the protocol does not require it.
    pub fn encode(&self, interface_prefix: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        if interface_prefix {
            buf.put_u32_le(0); // interface handle
            buf.put_u16_le(0); // timeout
        }

        let sockaddr_count = self.sockaddr_info.iter().flatten().count() as u16;
        let item_count = 1 + u16::from(self.data.is_some()) + sockaddr_count;
        buf.put_u16_le(item_count);

        match self.address {
            AddressItem::Null => {
                buf.put_u16_le(ItemId::NULL_ADDRESS);
                buf.put_u16_le(0);
            }
            AddressItem::Connection { connection_id } => {
                buf.put_u16_le(ItemId::CONNECTION_ADDRESS);
                buf.put_u16_le(4);
                buf.put_u32_le(connection_id);
            }
            AddressItem::Sequenced {
                connection_id,
                sequence,
            } => {
                buf.put_u16_le(ItemId::SEQUENCED_ADDRESS);
                buf.put_u16_le(8);
                buf.put_u32_le(connection_id);
                buf.put_u32_le(sequence);
            }
        }

        if let Some((type_id, payload)) = self.data {
            buf.put_u16_le(type_id);
            buf.put_u16_le(payload.len() as u16);
            buf.put_slice(payload);
        }

        for direction in [
            SockaddrDirection::OriginatorToTarget,
            SockaddrDirection::TargetToOriginator,
        ] {
            for info in self.sockaddr_info.iter().flatten() {
                if info.direction == direction {
                    info.encode(&mut buf);
                }
            }
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_null_unconnected() {
        let frame = [
            0x02, 0x00, // two items
            0x00, 0x00, 0x00, 0x00, // null address
            0xB2, 0x00, 0x03, 0x00, 0x0E, 0x01, 0x02, // unconnected data
        ];
        let packet = CpfPacket::decode(&frame).unwrap();
        assert_eq!(packet.address, AddressItem::Null);
        let (type_id, payload) = packet.data.unwrap();
        assert_eq!(type_id, ItemId::UNCONNECTED_DATA);
        assert_eq!(payload, &[0x0E, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_sequenced_address() {
        let frame = [
            0x02, 0x00, //
            0x02, 0x80, 0x08, 0x00, 0x44, 0x33, 0x22, 0x11, 0x01, 0x00, 0x00, 0x00, //
            0xB1, 0x00, 0x02, 0x00, 0xAB, 0xCD,
        ];
        let packet = CpfPacket::decode(&frame).unwrap();
        assert_eq!(
            packet.address,
            AddressItem::Sequenced {
                connection_id: 0x1122_3344,
                sequence: 1
            }
        );
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let frame = [
            0x02, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0xB2, 0x00, 0x05, 0x00, 0x01, 0x02, // claims 5 bytes, has 2
        ];
        assert!(CpfPacket::decode(&frame).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = [
            0x01, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0xFF,
        ];
        assert!(CpfPacket::decode(&frame).is_err());
    }

    #[test]
    fn test_round_trip_with_sockaddr_items() {
        let payload = [0x01u8, 0x02, 0x03, 0x04];
        let packet = CpfPacket {
            address: AddressItem::Connection {
                connection_id: 0xCAFE_F00D,
            },
            data: Some((ItemId::CONNECTED_DATA, &payload)),
            sockaddr_info: [
                Some(SockaddrInfo {
                    direction: SockaddrDirection::TargetToOriginator,
                    port: 0x08AE,
                    address: Ipv4Addr::new(239, 192, 1, 32),
                }),
                None,
            ],
        };
        let encoded = packet.encode(false);
        let decoded = CpfPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_sockaddr_order_on_wire() {
        let packet = CpfPacket {
            address: AddressItem::Null,
            data: None,
            sockaddr_info: [
                // stored T->O first on purpose
                Some(SockaddrInfo {
                    direction: SockaddrDirection::TargetToOriginator,
                    port: 1,
                    address: Ipv4Addr::LOCALHOST,
                }),
                Some(SockaddrInfo {
                    direction: SockaddrDirection::OriginatorToTarget,
                    port: 2,
                    address: Ipv4Addr::LOCALHOST,
                }),
            ],
        };
        let encoded = packet.encode(false);
        // item count 3, null address, then O->T (0x8000) before T->O (0x8001)
        let first_trailing = u16::from_le_bytes([encoded[6], encoded[7]]);
        let second_trailing = u16::from_le_bytes([encoded[26], encoded[27]]);
        assert_eq!(first_trailing, ItemId::SOCKADDR_INFO_O_TO_T);
        assert_eq!(second_trailing, ItemId::SOCKADDR_INFO_T_TO_O);
    }

    #[test]
    fn test_interface_prefix() {
        let packet = CpfPacket::default();
        let encoded = packet.encode(true);
        assert_eq!(&encoded[..6], &[0, 0, 0, 0, 0, 0]);
        assert_eq!(u16::from_le_bytes([encoded[6], encoded[7]]), 1);
    }
}
