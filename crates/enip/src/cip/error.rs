//! Error types and on-the-wire status vocabularies.

/// Result type for stack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or processing wire input.
///
/// These are internal to the stack; the fixed on-the-wire mappings
/// (encapsulation status, CIP general/extended status) live in the
/// constant tables below and are applied at the protocol boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from a socket collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame or item was shorter than its declared layout.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected number of bytes.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Malformed encapsulation frame.
    #[error("invalid encapsulation frame: {0}")]
    InvalidFrame(String),

    /// Malformed Common Packet Format item list.
    #[error("invalid CPF item list: {0}")]
    InvalidItems(String),

    /// Malformed EPath segment stream.
    #[error("invalid path segment: {0}")]
    InvalidSegment(String),

    /// A table (sessions, delayed replies, connections) is full.
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
}

impl Error {
    /// Check whether this error came from truncated wire input.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }

    /// Check whether this error came from a socket operation.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Encapsulation-layer status codes (24-byte header `status` field).
pub struct EncapStatus;

impl EncapStatus {
    pub const SUCCESS: u32 = 0x0000;
    pub const INVALID_COMMAND: u32 = 0x0001;
    pub const INSUFFICIENT_MEMORY: u32 = 0x0002;
    pub const INCORRECT_DATA: u32 = 0x0003;
    pub const INVALID_SESSION_HANDLE: u32 = 0x0064;
    pub const INVALID_LENGTH: u32 = 0x0065;
    pub const UNSUPPORTED_PROTOCOL: u32 = 0x0069;
}

/// CIP general status codes carried in message router responses.
pub struct GeneralStatus;

impl GeneralStatus {
    pub const SUCCESS: u8 = 0x00;
    pub const CONNECTION_FAILURE: u8 = 0x01;
    pub const PATH_SEGMENT_ERROR: u8 = 0x04;
    pub const PATH_DESTINATION_UNKNOWN: u8 = 0x05;
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x08;
    pub const INVALID_ATTRIBUTE_VALUE: u8 = 0x09;
    pub const ATTRIBUTE_NOT_SETTABLE: u8 = 0x0E;
    pub const NOT_ENOUGH_DATA: u8 = 0x13;
    pub const ATTRIBUTE_NOT_SUPPORTED: u8 = 0x14;
    pub const TOO_MUCH_DATA: u8 = 0x15;
    pub const PATH_SIZE_INVALID: u8 = 0x26;
}

/// Connection manager extended status codes (16-bit words following a
/// `CONNECTION_FAILURE` general status).
pub struct ExtendedStatus;

impl ExtendedStatus {
    pub const CONNECTION_IN_USE: u16 = 0x0100;
    pub const TRANSPORT_TRIGGER_NOT_SUPPORTED: u16 = 0x0103;
    pub const OWNERSHIP_CONFLICT: u16 = 0x0106;
    pub const CONNECTION_NOT_FOUND: u16 = 0x0107;
    pub const INVALID_CONNECTION_TYPE: u16 = 0x0108;
    pub const INVALID_CONNECTION_SIZE: u16 = 0x0109;
    pub const PIT_GREATER_THAN_RPI: u16 = 0x0111;
    pub const NO_MORE_CONNECTIONS: u16 = 0x0113;
    pub const VENDOR_OR_PRODUCT_CODE_MISMATCH: u16 = 0x0114;
    pub const DEVICE_TYPE_MISMATCH: u16 = 0x0115;
    pub const REVISION_MISMATCH: u16 = 0x0116;
    pub const INVALID_CONNECTION_POINT: u16 = 0x0117;
    pub const INVALID_CONFIGURATION_FORMAT: u16 = 0x0118;
    pub const NON_LISTEN_ONLY_NOT_OPENED: u16 = 0x0119;
    pub const TARGET_OUT_OF_CONNECTIONS: u16 = 0x011A;
    pub const INVALID_SEGMENT_TYPE_IN_PATH: u16 = 0x0315;
}

/// A connection-establishment failure as it appears on the wire:
/// general status plus one extended status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionError {
    /// CIP general status (usually `CONNECTION_FAILURE`).
    pub general: u8,
    /// Extended status word (0 when the general status stands alone).
    pub extended: u16,
}

impl ConnectionError {
    /// Connection failure (0x01) with the given extended status.
    pub fn failure(extended: u16) -> Self {
        Self {
            general: GeneralStatus::CONNECTION_FAILURE,
            extended,
        }
    }

    /// A bare general status with extended word zero.
    pub fn general(general: u8) -> Self {
        Self {
            general,
            extended: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let err = Error::Truncated {
            expected: 24,
            actual: 3,
        };
        assert!(err.is_truncated());
        assert!(!err.is_io());

        let err = Error::Io(std::io::Error::other("socket gone"));
        assert!(err.is_io());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::Truncated {
            expected: 24,
            actual: 10,
        };
        assert_eq!(
            err.to_string(),
            "message truncated: expected 24 bytes, got 10"
        );

        let err = Error::InvalidSegment("bad logical format".into());
        assert_eq!(err.to_string(), "invalid path segment: bad logical format");
    }

    #[test]
    fn test_connection_error_helpers() {
        let err = ConnectionError::failure(ExtendedStatus::CONNECTION_IN_USE);
        assert_eq!(err.general, GeneralStatus::CONNECTION_FAILURE);
        assert_eq!(err.extended, 0x0100);

        let err = ConnectionError::general(GeneralStatus::TOO_MUCH_DATA);
        assert_eq!(err.general, 0x15);
        assert_eq!(err.extended, 0);
    }
}
