//! Electronic key segment validation.

use crate::config::IdentityValues;

use super::error::ExtendedStatus;

/// Electronic key segment identifier (logical segment, special type).
pub const ELECTRONIC_KEY_SEGMENT: u8 = 0x34;

/// The only key format defined by the protocol.
pub const KEY_FORMAT_TABLE: u8 = 0x04;

/// Electronic key data carried in a forward-open connection path.
///
/// `major_revision` keeps the raw byte; bit 7 is the compatibility
/// flag, the lower bits the revision proper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElectronicKey {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub major_revision: u8,
    pub minor_revision: u8,
}

impl ElectronicKey {
    /// The compatibility flag (bit 7 of the major revision byte).
    pub fn compatibility(&self) -> bool {
        self.major_revision & 0x80 != 0
    }

    /// Major revision with the compatibility flag masked off.
    pub fn major(&self) -> u8 {
        self.major_revision & 0x7F
    }

    /// Validate the key against the device identity.
    ///
    /// A zero field is a wildcard. Without the compatibility flag the
    /// revision must match exactly; with it, the major must match and
    /// the requested minor must not exceed the device minor. A zero
    /// minor with a non-zero major inherits the device minor.
    pub fn check(&self, identity: &IdentityValues) -> Result<(), u16> {
        if (self.vendor_id != 0 && self.vendor_id != identity.vendor_id)
            || (self.product_code != 0 && self.product_code != identity.product_code)
        {
            return Err(ExtendedStatus::VENDOR_OR_PRODUCT_CODE_MISMATCH);
        }

        if self.device_type != 0 && self.device_type != identity.device_type {
            return Err(ExtendedStatus::DEVICE_TYPE_MISMATCH);
        }

        let major = self.major();
        if major == 0 {
            // any revision accepted
            return Ok(());
        }

        let minor = if self.minor_revision == 0 {
            identity.revision.minor
        } else {
            self.minor_revision
        };

        let exact = major == identity.revision.major && minor == identity.revision.minor;
        if exact {
            return Ok(());
        }

        if self.compatibility()
            && major == identity.revision.major
            && minor <= identity.revision.minor
        {
            return Ok(());
        }

        Err(ExtendedStatus::REVISION_MISMATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cip::types::Revision;

    fn identity() -> IdentityValues {
        IdentityValues {
            vendor_id: 0x0042,
            device_type: 0x0C,
            product_code: 0x0007,
            revision: Revision { major: 2, minor: 3 },
            ..Default::default()
        }
    }

    #[test]
    fn test_wildcards_accept_anything() {
        let key = ElectronicKey::default();
        assert!(key.check(&identity()).is_ok());
    }

    #[test]
    fn test_vendor_mismatch() {
        let key = ElectronicKey {
            vendor_id: 0x99,
            ..Default::default()
        };
        assert_eq!(
            key.check(&identity()),
            Err(ExtendedStatus::VENDOR_OR_PRODUCT_CODE_MISMATCH)
        );
    }

    #[test]
    fn test_device_type_mismatch() {
        let key = ElectronicKey {
            device_type: 0x2B,
            ..Default::default()
        };
        assert_eq!(
            key.check(&identity()),
            Err(ExtendedStatus::DEVICE_TYPE_MISMATCH)
        );
    }

    #[test]
    fn test_exact_revision_required_without_compatibility() {
        let mut key = ElectronicKey {
            major_revision: 2,
            minor_revision: 3,
            ..Default::default()
        };
        assert!(key.check(&identity()).is_ok());

        key.minor_revision = 2;
        assert_eq!(key.check(&identity()), Err(ExtendedStatus::REVISION_MISMATCH));
    }

    #[test]
    fn test_compatibility_accepts_lower_minor() {
        let key = ElectronicKey {
            major_revision: 0x80 | 2,
            minor_revision: 2,
            ..Default::default()
        };
        assert!(key.check(&identity()).is_ok());

        let key = ElectronicKey {
            major_revision: 0x80 | 2,
            minor_revision: 4,
            ..Default::default()
        };
        assert_eq!(key.check(&identity()), Err(ExtendedStatus::REVISION_MISMATCH));
    }

    #[test]
    fn test_zero_minor_inherits_device_minor() {
        let key = ElectronicKey {
            major_revision: 2,
            minor_revision: 0,
            ..Default::default()
        };
        assert!(key.check(&identity()).is_ok());
    }
}
