//! EPath segment parsing: request paths and forward-open connection paths.

use winnow::Parser;
use winnow::binary::{le_u16, le_u32};
use winnow::error::{ContextError, ErrMode};
use winnow::token::{any, take};

use crate::config::IdentityValues;

use super::connection::{ConnectionType, TransportClassTrigger};
use super::ekey::{ELECTRONIC_KEY_SEGMENT, ElectronicKey, KEY_FORMAT_TABLE};
use super::error::{ConnectionError, Error, ExtendedStatus, GeneralStatus, Result};
use super::registry::ClassRegistry;
use super::types::ClassCode;

type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// Segment category in bits 5-7 of the first segment byte.
pub struct SegmentType;

impl SegmentType {
    pub const PORT: u8 = 0x00;
    pub const LOGICAL: u8 = 0x20;
    pub const NETWORK: u8 = 0x40;
    pub const SYMBOLIC: u8 = 0x60;
    pub const DATA: u8 = 0x80;
    pub const DATA_TYPE_CONSTRUCTED: u8 = 0xA0;
    pub const DATA_TYPE_ELEMENTARY: u8 = 0xC0;
    pub const RESERVED: u8 = 0xE0;

    pub const MASK: u8 = 0xE0;
}

/// Logical segment bytes with format bits zeroed.
pub struct LogicalSegment;

impl LogicalSegment {
    pub const CLASS_ID: u8 = 0x20;
    pub const INSTANCE_ID: u8 = 0x24;
    pub const MEMBER_ID: u8 = 0x28;
    pub const CONNECTION_POINT: u8 = 0x2C;
    pub const ATTRIBUTE_ID: u8 = 0x30;
    pub const SPECIAL: u8 = 0x34;
    pub const SERVICE_ID: u8 = 0x38;
    pub const EXTENDED: u8 = 0x3C;

    /// Mask selecting category + logical type, ignoring the format.
    pub const VALUE_MASK: u8 = 0xFC;
}

/// Network segment: production inhibit time in milliseconds.
pub const PRODUCTION_INHIBIT_TIME_SEGMENT: u8 = 0x43;

/// Data segment: simple data, length in 16-bit words.
pub const SIMPLE_DATA_SEGMENT: u8 = 0x80;

/// True when `segment` is the given logical segment in any format.
#[inline]
pub fn is_logical(segment: u8, kind: u8) -> bool {
    segment & LogicalSegment::VALUE_MASK == kind
}

fn cut() -> ErrMode<ContextError> {
    ErrMode::Cut(ContextError::new())
}

/// Parse one padded logical segment including its segment byte.
///
/// Returns the value and the number of 16-bit words consumed.
fn padded_logical_value(input: &mut &[u8]) -> PResult<(u32, u8)> {
    let segment = any.parse_next(input)?;
    match segment & 0x03 {
        0 => {
            let value = any.parse_next(input)?;
            Ok((value as u32, 1))
        }
        1 => {
            let _pad: &[u8] = take(1usize).parse_next(input)?;
            let value = le_u16.parse_next(input)?;
            Ok((value as u32, 2))
        }
        2 => {
            let _pad: &[u8] = take(1usize).parse_next(input)?;
            let value = le_u32.parse_next(input)?;
            Ok((value, 3))
        }
        _ => Err(cut()),
    }
}

/// A decoded message-router request path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestPath {
    pub class_id: u32,
    pub instance_id: u32,
    pub attribute_id: Option<u32>,
    pub member_id: Option<u32>,
}

/// Parse the padded request path of a message router request.
///
/// Consumes exactly `path_words * 2` bytes from `input`.
pub fn parse_request_path(path_words: u8, input: &mut &[u8]) -> Result<RequestPath> {
    let total = path_words as usize * 2;
    if input.len() < total {
        return Err(Error::Truncated {
            expected: total,
            actual: input.len(),
        });
    }

    let mut path = RequestPath::default();
    let mut segments = &input[..total];
    while !segments.is_empty() {
        let segment = segments[0];
        let (value, _words) = padded_logical_value(&mut segments)
            .map_err(|_| Error::InvalidSegment("truncated logical segment".into()))?;
        if is_logical(segment, LogicalSegment::CLASS_ID) {
            path.class_id = value;
        } else if is_logical(segment, LogicalSegment::INSTANCE_ID)
            || is_logical(segment, LogicalSegment::CONNECTION_POINT)
        {
            path.instance_id = value;
        } else if is_logical(segment, LogicalSegment::ATTRIBUTE_ID) {
            path.attribute_id = Some(value);
        } else if is_logical(segment, LogicalSegment::MEMBER_ID) {
            path.member_id = Some(value);
        } else {
            return Err(Error::InvalidSegment(format!(
                "unsupported segment {segment:#04x} in request path"
            )));
        }
    }

    *input = &input[total..];
    Ok(path)
}

/// The parsed forward-open connection path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionPath {
    pub class_id: u32,
    /// [O->T point, T->O point, configuration point]; zero = absent.
    /// With a single data path its point lands in slot 0.
    pub connection_points: [u32; 3],
    pub electronic_key: Option<ElectronicKey>,
    pub production_inhibit_ms: Option<u16>,
    pub config_data: Option<Vec<u8>>,
}

/// Everything the connection-path parser consults besides the bytes.
pub(crate) struct ConnectionPathContext<'a> {
    pub registry: &'a ClassRegistry,
    pub identity: &'a IdentityValues,
    pub trigger: TransportClassTrigger,
    pub o_to_t_type: ConnectionType,
    pub t_to_o_type: ConnectionType,
}

/// Parse and semantically validate a forward-open connection path.
///
/// Segment order follows the common pattern [ElectronicKey] [PIT]
/// ClassId ConfigInstance [O->T point] [T->O point] [DataSegment],
/// requiring exactly the data paths the connection-type bits demand.
pub(crate) fn parse_connection_path(
    path_words: u8,
    data: &[u8],
    cx: &ConnectionPathContext<'_>,
) -> std::result::Result<ConnectionPath, ConnectionError> {
    let mut input = data;
    let mut remaining = path_words as i32;
    let mut path = ConnectionPath::default();

    let truncated = ConnectionError::general(GeneralStatus::NOT_ENOUGH_DATA);

    if remaining == 0 {
        return Ok(path);
    }

    // Electronic key segment first, when present.
    if input.first() == Some(&ELECTRONIC_KEY_SEGMENT) {
        if remaining < 5 || input.len() < 10 {
            return Err(truncated);
        }
        let mut key_bytes = &input[1..10];
        let format = any.parse_next(&mut key_bytes).map_err(|_: ErrMode<ContextError>| truncated)?;
        if format != KEY_FORMAT_TABLE {
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH,
            ));
        }
        let key = ElectronicKey {
            vendor_id: le_u16.parse_next(&mut key_bytes).map_err(|_: ErrMode<ContextError>| truncated)?,
            device_type: le_u16.parse_next(&mut key_bytes).map_err(|_: ErrMode<ContextError>| truncated)?,
            product_code: le_u16.parse_next(&mut key_bytes).map_err(|_: ErrMode<ContextError>| truncated)?,
            major_revision: any.parse_next(&mut key_bytes).map_err(|_: ErrMode<ContextError>| truncated)?,
            minor_revision: any.parse_next(&mut key_bytes).map_err(|_: ErrMode<ContextError>| truncated)?,
        };
        input = &input[10..];
        remaining -= 5;
        tracing::debug!(
            vendor = key.vendor_id,
            device_type = key.device_type,
            product_code = key.product_code,
            major = key.major(),
            minor = key.minor_revision,
            "electronic key in connection path"
        );
        key.check(cx.identity).map_err(ConnectionError::failure)?;
        path.electronic_key = Some(key);
    }

    // Non-cyclic connections may carry a leading production inhibit.
    if !cx.trigger.is_cyclic() && input.first() == Some(&PRODUCTION_INHIBIT_TIME_SEGMENT) {
        if input.len() < 2 {
            return Err(truncated);
        }
        path.production_inhibit_ms = Some(input[1] as u16);
        input = &input[2..];
        remaining -= 1;
    }

    // Target class.
    if input.first().is_some_and(|&b| is_logical(b, LogicalSegment::CLASS_ID)) {
        let (class_id, words) = padded_logical_value(&mut input).map_err(|_| truncated)?;
        remaining -= words as i32;
        path.class_id = class_id;
        if cx.registry.class(class_id).is_none() {
            tracing::warn!(class_id, "connection path names an unknown class");
            let extended = if class_id >= ClassCode::RESERVED_RANGE_START {
                ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH
            } else {
                ExtendedStatus::INVALID_CONNECTION_POINT
            };
            return Err(ConnectionError::failure(extended));
        }
    } else {
        return Err(ConnectionError::failure(
            ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH,
        ));
    }

    // Configuration instance.
    if input.first().is_some_and(|&b| is_logical(b, LogicalSegment::INSTANCE_ID)) {
        let (instance, words) = padded_logical_value(&mut input).map_err(|_| truncated)?;
        remaining -= words as i32;
        if cx.registry.instance(path.class_id, instance).is_none() {
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH,
            ));
        }
        path.connection_points[2] = instance;
    }

    if cx.trigger.is_class_3() {
        if remaining > 0 {
            tracing::warn!("extra path segments on a class-3 connection");
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH,
            ));
        }
        // The endpoint has to be message router instance 1.
        if path.class_id != ClassCode::MESSAGE_ROUTER || path.connection_points[2] != 1 {
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_POINT,
            ));
        }
        path.connection_points[0] = path.connection_points[2];
        return Ok(path);
    }

    // I/O connection: exactly the paths the connection types demand.
    let expected_points = match (
        cx.o_to_t_type == ConnectionType::Null,
        cx.t_to_o_type == ConnectionType::Null,
    ) {
        (true, true) => 0,
        (true, false) | (false, true) => 1,
        (false, false) => 2,
    };

    for slot in 0..expected_points {
        let segment = input.first().copied().unwrap_or(0);
        if !(is_logical(segment, LogicalSegment::INSTANCE_ID)
            || is_logical(segment, LogicalSegment::CONNECTION_POINT))
        {
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH,
            ));
        }
        let (point, words) = padded_logical_value(&mut input).map_err(|_| truncated)?;
        remaining -= words as i32;
        if cx.registry.instance(path.class_id, point).is_none() {
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_POINT,
            ));
        }
        path.connection_points[slot] = point;
    }

    // Anything left is configuration data or a trailing PIT segment.
    while remaining > 0 {
        let error_offset = (path_words as i32 - remaining) as u16;
        match input.first().copied() {
            Some(SIMPLE_DATA_SEGMENT) => {
                if input.len() < 2 {
                    return Err(truncated);
                }
                let data_words = input[1] as usize;
                let data_len = data_words * 2;
                if input.len() < 2 + data_len {
                    return Err(truncated);
                }
                path.config_data = Some(input[2..2 + data_len].to_vec());
                input = &input[2 + data_len..];
                remaining -= 1 + data_words as i32;
            }
            Some(PRODUCTION_INHIBIT_TIME_SEGMENT) => {
                if cx.trigger.is_cyclic() {
                    // cyclic connections may not carry an inhibit time
                    return Err(ConnectionError {
                        general: GeneralStatus::PATH_SEGMENT_ERROR,
                        extended: error_offset,
                    });
                }
                if input.len() < 2 {
                    return Err(truncated);
                }
                path.production_inhibit_ms = Some(input[1] as u16);
                input = &input[2..];
                remaining -= 1;
            }
            _ => {
                tracing::warn!("no data segment identifier in trailing connection path");
                return Err(ConnectionError {
                    general: GeneralStatus::PATH_SEGMENT_ERROR,
                    extended: error_offset,
                });
            }
        }
    }

    if remaining < 0 {
        return Err(ConnectionError::general(GeneralStatus::PATH_SIZE_INVALID));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cip::registry::{CipClass, ClassInstance};
    use crate::cip::types::Revision;

    fn registry() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        let mut router = CipClass::new(ClassCode::MESSAGE_ROUTER, "message router", 1, 0);
        router.insert_instance(ClassInstance::new(1));
        registry.register(router);

        let mut assembly = CipClass::new(ClassCode::ASSEMBLY, "assembly", 2, 0);
        for id in [100, 150, 151] {
            assembly.insert_instance(ClassInstance::new(id));
        }
        registry.register(assembly);
        registry
    }

    fn identity() -> IdentityValues {
        IdentityValues {
            vendor_id: 0x42,
            device_type: 0x0C,
            product_code: 7,
            revision: Revision { major: 1, minor: 1 },
            ..Default::default()
        }
    }

    fn io_context<'a>(
        registry: &'a ClassRegistry,
        identity: &'a IdentityValues,
    ) -> ConnectionPathContext<'a> {
        ConnectionPathContext {
            registry,
            identity,
            trigger: TransportClassTrigger(0x01),
            o_to_t_type: ConnectionType::PointToPoint,
            t_to_o_type: ConnectionType::Multicast,
        }
    }

    #[test]
    fn test_request_path_8bit() {
        let mut input: &[u8] = &[0x20, 0x04, 0x24, 0x96, 0x30, 0x03, 0xAA];
        let path = parse_request_path(3, &mut input).unwrap();
        assert_eq!(path.class_id, 4);
        assert_eq!(path.instance_id, 0x96);
        assert_eq!(path.attribute_id, Some(3));
        assert_eq!(input, &[0xAA]); // request data left untouched
    }

    #[test]
    fn test_request_path_16bit() {
        let mut input: &[u8] = &[0x21, 0x00, 0xF5, 0x00, 0x25, 0x00, 0x01, 0x01];
        let path = parse_request_path(4, &mut input).unwrap();
        assert_eq!(path.class_id, 0xF5);
        assert_eq!(path.instance_id, 0x101);
    }

    #[test]
    fn test_request_path_truncated() {
        let mut input: &[u8] = &[0x20, 0x04];
        assert!(parse_request_path(2, &mut input).is_err());
    }

    #[test]
    fn test_io_connection_path() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        // class 4, config 151, O->T 150, T->O 100
        let data = [0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 100];
        let path = parse_connection_path(4, &data, &cx).unwrap();
        assert_eq!(path.class_id, 4);
        assert_eq!(path.connection_points, [150, 100, 151]);
        assert!(path.electronic_key.is_none());
        assert!(path.config_data.is_none());
    }

    #[test]
    fn test_io_connection_path_with_key() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        let data = [
            0x34, 0x04, 0x42, 0x00, 0x0C, 0x00, 0x07, 0x00, 0x01, 0x01, // key
            0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 100,
        ];
        let path = parse_connection_path(9, &data, &cx).unwrap();
        let key = path.electronic_key.unwrap();
        assert_eq!(key.vendor_id, 0x42);
        assert_eq!(key.product_code, 7);
    }

    #[test]
    fn test_key_mismatch_maps_to_extended_status() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        let data = [
            0x34, 0x04, 0x99, 0x00, 0x0C, 0x00, 0x07, 0x00, 0x01, 0x01,
            0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 100,
        ];
        let err = parse_connection_path(9, &data, &cx).unwrap_err();
        assert_eq!(err.general, GeneralStatus::CONNECTION_FAILURE);
        assert_eq!(err.extended, ExtendedStatus::VENDOR_OR_PRODUCT_CODE_MISMATCH);
    }

    #[test]
    fn test_unknown_connection_point() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        let data = [0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 99];
        let err = parse_connection_path(4, &data, &cx).unwrap_err();
        assert_eq!(err.extended, ExtendedStatus::INVALID_CONNECTION_POINT);
    }

    #[test]
    fn test_unknown_class_in_reserved_range() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        let data = [0x21, 0x00, 0xC8, 0x00];
        let err = parse_connection_path(2, &data, &cx).unwrap_err();
        assert_eq!(err.extended, ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH);
    }

    #[test]
    fn test_class3_path() {
        let registry = registry();
        let identity = identity();
        let cx = ConnectionPathContext {
            registry: &registry,
            identity: &identity,
            trigger: TransportClassTrigger(0xA3),
            o_to_t_type: ConnectionType::PointToPoint,
            t_to_o_type: ConnectionType::PointToPoint,
        };
        let data = [0x20, 0x02, 0x24, 0x01];
        let path = parse_connection_path(2, &data, &cx).unwrap();
        assert_eq!(path.class_id, ClassCode::MESSAGE_ROUTER);
        assert_eq!(path.connection_points[0], 1);
    }

    #[test]
    fn test_class3_path_must_target_message_router() {
        let registry = registry();
        let identity = identity();
        let cx = ConnectionPathContext {
            registry: &registry,
            identity: &identity,
            trigger: TransportClassTrigger(0xA3),
            o_to_t_type: ConnectionType::PointToPoint,
            t_to_o_type: ConnectionType::PointToPoint,
        };
        let data = [0x20, 0x04, 0x24, 151];
        let err = parse_connection_path(2, &data, &cx).unwrap_err();
        assert_eq!(err.extended, ExtendedStatus::INVALID_CONNECTION_POINT);
    }

    #[test]
    fn test_config_data_segment() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        let data = [
            0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 100, // paths
            0x80, 0x02, 0xDE, 0xAD, 0xBE, 0xEF, // 2 words of config data
        ];
        let path = parse_connection_path(7, &data, &cx).unwrap();
        assert_eq!(path.config_data, Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn test_trailing_garbage_reports_word_offset() {
        let registry = registry();
        let identity = identity();
        let cx = io_context(&registry, &identity);
        let data = [0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 100, 0x91, 0x00];
        let err = parse_connection_path(5, &data, &cx).unwrap_err();
        assert_eq!(err.general, GeneralStatus::PATH_SEGMENT_ERROR);
        assert_eq!(err.extended, 4);
    }
}
