//! Class, instance, attribute and service registry.
//!
//! Classes are registered once during engine construction and live for
//! the lifetime of the engine. Every class owns a shadow meta-class:
//! class-level attributes and services addressed through instance 0.

use tracing::debug;

use super::error::GeneralStatus;
use super::types::{AttributeFlags, CipValue};

/// One attribute slot: number, typed storage, access flags.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    pub number: u16,
    pub value: CipValue,
    pub flags: u8,
}

/// One service a class supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub code: u8,
    pub name: &'static str,
}

/// An instance of a class with its attribute table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassInstance {
    pub instance_id: u32,
    pub attributes: Vec<AttributeDescriptor>,
}

impl ClassInstance {
    pub fn new(instance_id: u32) -> Self {
        Self {
            instance_id,
            attributes: Vec::new(),
        }
    }

    /// Insert an attribute; replaces an existing slot with the same number.
    pub fn insert_attribute(&mut self, number: u16, value: CipValue, flags: u8) {
        if let Some(slot) = self.attributes.iter_mut().find(|a| a.number == number) {
            slot.value = value;
            slot.flags = flags;
            return;
        }
        self.attributes.push(AttributeDescriptor {
            number,
            value,
            flags,
        });
    }

    pub fn attribute(&self, number: u16) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.number == number)
    }

    pub fn attribute_mut(&mut self, number: u16) -> Option<&mut AttributeDescriptor> {
        self.attributes.iter_mut().find(|a| a.number == number)
    }
}

/// A class descriptor together with its meta-class shadow.
#[derive(Debug, Clone, PartialEq)]
pub struct CipClass {
    pub class_id: u32,
    pub name: &'static str,
    pub revision: u16,
    /// Bitmask gating instance GetAttributeAll: attribute `n`
    /// participates when bit `n` is set.
    pub get_attribute_all_mask: u32,
    /// Class-level (meta) attributes, addressed via instance 0.
    pub class_attributes: Vec<AttributeDescriptor>,
    /// Services accepted on instance 0.
    pub class_services: Vec<ServiceDescriptor>,
    /// Services accepted on instances.
    pub instance_services: Vec<ServiceDescriptor>,
    pub instances: Vec<ClassInstance>,
}

impl CipClass {
    /// Create a class with the standard meta attributes (revision,
    /// max instance, instance count) pre-populated.
    pub fn new(class_id: u32, name: &'static str, revision: u16, get_all_mask: u32) -> Self {
        let mut class = Self {
            class_id,
            name,
            revision,
            get_attribute_all_mask: get_all_mask,
            class_attributes: Vec::new(),
            class_services: Vec::new(),
            instance_services: Vec::new(),
            instances: Vec::new(),
        };
        class.class_attributes.push(AttributeDescriptor {
            number: 1,
            value: CipValue::Uint(revision),
            flags: AttributeFlags::GETABLE,
        });
        class.class_attributes.push(AttributeDescriptor {
            number: 2,
            value: CipValue::Uint(0), // max instance, kept in sync below
            flags: AttributeFlags::GETABLE,
        });
        class.class_attributes.push(AttributeDescriptor {
            number: 3,
            value: CipValue::Uint(0), // number of instances
            flags: AttributeFlags::GETABLE,
        });
        class
            .class_services
            .push(ServiceDescriptor {
                code: super::types::ServiceCode::GET_ATTRIBUTE_SINGLE,
                name: "GetAttributeSingle",
            });
        class
            .instance_services
            .push(ServiceDescriptor {
                code: super::types::ServiceCode::GET_ATTRIBUTE_SINGLE,
                name: "GetAttributeSingle",
            });
        class
    }

    /// Add an instance, keeping the meta counters current.
    pub fn insert_instance(&mut self, instance: ClassInstance) {
        let max = self
            .instances
            .iter()
            .map(|i| i.instance_id)
            .max()
            .unwrap_or(0)
            .max(instance.instance_id);
        self.instances.push(instance);
        let count = self.instances.len() as u16;
        if let Some(slot) = self.class_attributes.iter_mut().find(|a| a.number == 2) {
            slot.value = CipValue::Uint(max as u16);
        }
        if let Some(slot) = self.class_attributes.iter_mut().find(|a| a.number == 3) {
            slot.value = CipValue::Uint(count);
        }
    }

    /// Register a service on all instances of the class.
    pub fn insert_instance_service(&mut self, code: u8, name: &'static str) {
        if self.instance_services.iter().any(|s| s.code == code) {
            return;
        }
        self.instance_services.push(ServiceDescriptor { code, name });
    }

    /// Register a service on the class (instance 0) level.
    pub fn insert_class_service(&mut self, code: u8, name: &'static str) {
        if self.class_services.iter().any(|s| s.code == code) {
            return;
        }
        self.class_services.push(ServiceDescriptor { code, name });
    }

    pub fn instance(&self, instance_id: u32) -> Option<&ClassInstance> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: u32) -> Option<&mut ClassInstance> {
        self.instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
    }

    /// Whether the given service is accepted on the addressed level.
    pub fn supports_service(&self, instance_id: u32, code: u8) -> bool {
        let table = if instance_id == 0 {
            &self.class_services
        } else {
            &self.instance_services
        };
        table.iter().any(|s| s.code == code)
    }
}

/// The process-lifetime class registry.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<CipClass>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class. Replaces a previous registration of the same id.
    pub fn register(&mut self, class: CipClass) {
        debug!(class_id = class.class_id, name = class.name, "registering class");
        self.classes.retain(|c| c.class_id != class.class_id);
        self.classes.push(class);
    }

    pub fn class(&self, class_id: u32) -> Option<&CipClass> {
        self.classes.iter().find(|c| c.class_id == class_id)
    }

    pub fn class_mut(&mut self, class_id: u32) -> Option<&mut CipClass> {
        self.classes.iter_mut().find(|c| c.class_id == class_id)
    }

    pub fn instance(&self, class_id: u32, instance_id: u32) -> Option<&ClassInstance> {
        self.class(class_id)?.instance(instance_id)
    }

    /// Attribute lookup honoring the instance-0 = meta-class rule.
    fn attribute(&self, class_id: u32, instance_id: u32, number: u16) -> Option<&AttributeDescriptor> {
        let class = self.class(class_id)?;
        if instance_id == 0 {
            class.class_attributes.iter().find(|a| a.number == number)
        } else {
            class.instance(instance_id)?.attribute(number)
        }
    }

    /// GetAttributeSingle: encode the stored value.
    pub fn get_attribute_single(
        &self,
        class_id: u32,
        instance_id: u32,
        attribute_id: u16,
    ) -> Result<Vec<u8>, u8> {
        let attribute = self
            .attribute(class_id, instance_id, attribute_id)
            .ok_or(GeneralStatus::ATTRIBUTE_NOT_SUPPORTED)?;
        if attribute.flags & AttributeFlags::GETABLE_SINGLE == 0 {
            return Err(GeneralStatus::ATTRIBUTE_NOT_SUPPORTED);
        }
        let mut data = Vec::new();
        attribute.value.encode(&mut data);
        Ok(data)
    }

    /// SetAttributeSingle: decode into the stored value under the
    /// access-flag mask.
    pub fn set_attribute_single(
        &mut self,
        class_id: u32,
        instance_id: u32,
        attribute_id: u16,
        data: &[u8],
    ) -> Result<(), u8> {
        let class = self
            .class_mut(class_id)
            .ok_or(GeneralStatus::PATH_DESTINATION_UNKNOWN)?;
        let attribute = if instance_id == 0 {
            class
                .class_attributes
                .iter_mut()
                .find(|a| a.number == attribute_id)
        } else {
            class
                .instance_mut(instance_id)
                .ok_or(GeneralStatus::PATH_DESTINATION_UNKNOWN)?
                .attribute_mut(attribute_id)
        }
        .ok_or(GeneralStatus::ATTRIBUTE_NOT_SUPPORTED)?;

        if attribute.flags & AttributeFlags::SETTABLE == 0 {
            return Err(GeneralStatus::ATTRIBUTE_NOT_SETTABLE);
        }
        let consumed = attribute.value.decode_into(data).map_err(|e| {
            if e.is_truncated() {
                GeneralStatus::NOT_ENOUGH_DATA
            } else {
                GeneralStatus::INVALID_ATTRIBUTE_VALUE
            }
        })?;
        if consumed < data.len() {
            return Err(GeneralStatus::TOO_MUCH_DATA);
        }
        Ok(())
    }

    /// GetAttributeAll: present attributes in attribute-number order,
    /// gated by the class participation mask.
    pub fn get_attribute_all(&self, class_id: u32, instance_id: u32) -> Result<Vec<u8>, u8> {
        let class = self
            .class(class_id)
            .ok_or(GeneralStatus::PATH_DESTINATION_UNKNOWN)?;
        let attributes = if instance_id == 0 {
            &class.class_attributes
        } else {
            &class
                .instance(instance_id)
                .ok_or(GeneralStatus::PATH_DESTINATION_UNKNOWN)?
                .attributes
        };

        let mut numbers: Vec<u16> = attributes
            .iter()
            .filter(|a| {
                a.flags & AttributeFlags::GETABLE_ALL != 0
                    && a.number < 32
                    && class.get_attribute_all_mask & (1 << a.number) != 0
            })
            .map(|a| a.number)
            .collect();
        numbers.sort_unstable();

        let mut data = Vec::new();
        for number in numbers {
            if let Some(attribute) = attributes.iter().find(|a| a.number == number) {
                attribute.value.encode(&mut data);
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cip::types::{Revision, ServiceCode};

    fn sample_registry() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        let mut class = CipClass::new(0x01, "identity", 1, 0xFE);
        class.insert_instance_service(ServiceCode::GET_ATTRIBUTE_ALL, "GetAttributeAll");
        let mut instance = ClassInstance::new(1);
        instance.insert_attribute(1, CipValue::Uint(0x0042), AttributeFlags::GETABLE);
        instance.insert_attribute(2, CipValue::Uint(0x000C), AttributeFlags::GETABLE);
        instance.insert_attribute(
            4,
            CipValue::Revision(Revision { major: 2, minor: 1 }),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(
            7,
            CipValue::ShortString("device".into()),
            AttributeFlags::GETABLE,
        );
        class.insert_instance(instance);
        registry.register(class);
        registry
    }

    #[test]
    fn test_get_attribute_single() {
        let registry = sample_registry();
        assert_eq!(
            registry.get_attribute_single(0x01, 1, 1).unwrap(),
            vec![0x42, 0x00]
        );
        assert_eq!(
            registry.get_attribute_single(0x01, 1, 9),
            Err(GeneralStatus::ATTRIBUTE_NOT_SUPPORTED)
        );
    }

    #[test]
    fn test_meta_class_attributes() {
        let registry = sample_registry();
        // class revision through instance 0
        assert_eq!(
            registry.get_attribute_single(0x01, 0, 1).unwrap(),
            vec![1, 0]
        );
        // instance count
        assert_eq!(
            registry.get_attribute_single(0x01, 0, 3).unwrap(),
            vec![1, 0]
        );
    }

    #[test]
    fn test_get_attribute_all_in_number_order_with_mask() {
        let registry = sample_registry();
        let data = registry.get_attribute_all(0x01, 1).unwrap();
        let mut expected = vec![0x42, 0x00, 0x0C, 0x00, 2, 1];
        expected.extend_from_slice(&[6]);
        expected.extend_from_slice(b"device");
        assert_eq!(data, expected);
    }

    #[test]
    fn test_mask_excludes_attributes() {
        let mut registry = sample_registry();
        registry.class_mut(0x01).unwrap().get_attribute_all_mask = 0x02; // only attr 1
        let data = registry.get_attribute_all(0x01, 1).unwrap();
        assert_eq!(data, vec![0x42, 0x00]);
    }

    #[test]
    fn test_set_attribute_respects_flags() {
        let mut registry = sample_registry();
        assert_eq!(
            registry.set_attribute_single(0x01, 1, 1, &[1, 2]),
            Err(GeneralStatus::ATTRIBUTE_NOT_SETTABLE)
        );

        let class = registry.class_mut(0x01).unwrap();
        class
            .instance_mut(1)
            .unwrap()
            .insert_attribute(10, CipValue::Uint(0), AttributeFlags::SETTABLE);
        assert_eq!(registry.set_attribute_single(0x01, 1, 10, &[5, 0]), Ok(()));
        assert_eq!(
            registry.get_attribute_single(0x01, 1, 10),
            Err(GeneralStatus::ATTRIBUTE_NOT_SUPPORTED)
        ); // not getable
        assert_eq!(
            registry.set_attribute_single(0x01, 1, 10, &[5, 0, 9]),
            Err(GeneralStatus::TOO_MUCH_DATA)
        );
        assert_eq!(
            registry.set_attribute_single(0x01, 1, 10, &[5]),
            Err(GeneralStatus::NOT_ENOUGH_DATA)
        );
    }

    #[test]
    fn test_service_support() {
        let registry = sample_registry();
        let class = registry.class(0x01).unwrap();
        assert!(class.supports_service(1, ServiceCode::GET_ATTRIBUTE_SINGLE));
        assert!(class.supports_service(1, ServiceCode::GET_ATTRIBUTE_ALL));
        assert!(!class.supports_service(1, ServiceCode::RESET));
        // meta-class table is separate
        assert!(class.supports_service(0, ServiceCode::GET_ATTRIBUTE_SINGLE));
        assert!(!class.supports_service(0, ServiceCode::GET_ATTRIBUTE_ALL));
    }
}
