//! Attribute registry.
//!
//! Maps the service and characteristic UUIDs this crate understands to
//! symbolic names and roles, and classifies discovered characteristics.

use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

use crate::ble::transport::CharacteristicHandle;
use crate::ble::uuids::*;

/// A UUID with a symbolic name.
///
/// Equality and hashing use the UUID only.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttributeId {
    /// Symbolic name.
    pub name: Cow<'static, str>,
    /// The 128-bit UUID.
    pub uuid: Uuid,
}

impl AttributeId {
    /// Create an attribute id with a static name.
    pub const fn from_static(name: &'static str, uuid: Uuid) -> Self {
        Self {
            name: Cow::Borrowed(name),
            uuid,
        }
    }

    /// Create an attribute id with an owned name.
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            uuid,
        }
    }
}

impl PartialEq for AttributeId {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for AttributeId {}

impl std::hash::Hash for AttributeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// The Helena observation service.
pub const HELENA_SERVICE: AttributeId = AttributeId::from_static("helena", HELENA_SERVICE_UUID);
/// The data-available notify pipe.
pub const DATA_AVAILABLE: AttributeId =
    AttributeId::from_static("data-available", DATA_AVAILABLE_UUID);
/// The observation-set read pipe.
pub const OBSERVATION_SET: AttributeId =
    AttributeId::from_static("observation-set", OBSERVATION_SET_UUID);

/// GATT characteristic property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// No properties.
    pub const NONE: Self = Self(0x00);
    /// Value may be broadcast.
    pub const BROADCAST: Self = Self(0x01);
    /// Value may be read.
    pub const READ: Self = Self(0x02);
    /// Value may be written without response.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Value may be written with response.
    pub const WRITE: Self = Self(0x08);
    /// Value changes may be notified.
    pub const NOTIFY: Self = Self(0x10);
    /// Value changes may be indicated.
    pub const INDICATE: Self = Self(0x20);
    /// Authenticated signed writes allowed.
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    /// Extended properties descriptor present.
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    /// Build from the raw property byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw property byte.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether every flag in `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CharacteristicProperties, &str); 8] = [
            (CharacteristicProperties::BROADCAST, "broadcast"),
            (CharacteristicProperties::READ, "read"),
            (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (CharacteristicProperties::WRITE, "write"),
            (CharacteristicProperties::NOTIFY, "notify"),
            (CharacteristicProperties::INDICATE, "indicate"),
            (CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, "signed-write"),
            (CharacteristicProperties::EXTENDED_PROPERTIES, "extended"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Roles a characteristic can play for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CharacteristicRole {
    /// Periodic asynchronous data, delivered by notification.
    NotifySource,
    /// On-demand bulk data, fetched by read.
    ReadableSet,
}

impl CharacteristicRole {
    /// The property a characteristic must declare to fill this role.
    pub fn required_property(&self) -> CharacteristicProperties {
        match self {
            Self::NotifySource => CharacteristicProperties::NOTIFY,
            Self::ReadableSet => CharacteristicProperties::READ,
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotifySource => write!(f, "notify source"),
            Self::ReadableSet => write!(f, "readable set"),
        }
    }
}

/// Outcome of classifying a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The characteristic fills a role.
    Recognized(CharacteristicRole),
    /// The UUID is registered but the required property flag is absent.
    MissingProperty {
        /// The role the UUID is registered for.
        role: CharacteristicRole,
        /// The properties the characteristic actually declares.
        properties: CharacteristicProperties,
    },
    /// The UUID is not registered.
    Unrecognized,
}

/// Service and characteristic lookup tables.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttributeRegistry {
    services: Vec<AttributeId>,
    characteristics: Vec<(AttributeId, CharacteristicRole)>,
}

impl AttributeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    /// The registry for Helena firmware.
    pub fn helena() -> Self {
        Self::new()
            .with_service(HELENA_SERVICE)
            .with_characteristic(DATA_AVAILABLE, CharacteristicRole::NotifySource)
            .with_characteristic(OBSERVATION_SET, CharacteristicRole::ReadableSet)
    }

    /// Register a service.
    pub fn with_service(mut self, service: AttributeId) -> Self {
        if !self.services.contains(&service) {
            self.services.push(service);
        }
        self
    }

    /// Register a characteristic for a role.
    ///
    /// Registering the same UUID again replaces its role.
    pub fn with_characteristic(mut self, id: AttributeId, role: CharacteristicRole) -> Self {
        self.characteristics.retain(|(existing, _)| *existing != id);
        self.characteristics.push((id, role));
        self
    }

    /// Look up a service.
    pub fn service(&self, uuid: &Uuid) -> Option<&AttributeId> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    /// Look up a characteristic and its role.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<(&AttributeId, CharacteristicRole)> {
        self.characteristics
            .iter()
            .find(|(id, _)| id.uuid == *uuid)
            .map(|(id, role)| (id, *role))
    }

    /// Classify a discovered characteristic.
    ///
    /// The property test is a subset test: a characteristic that declares
    /// both notify and read qualifies for either role.
    pub fn classify(&self, characteristic: &CharacteristicHandle) -> Classification {
        match self.characteristic(&characteristic.uuid) {
            None => Classification::Unrecognized,
            Some((_, role)) => {
                if characteristic.properties.contains(role.required_property()) {
                    Classification::Recognized(role)
                } else {
                    Classification::MissingProperty {
                        role,
                        properties: characteristic.properties,
                    }
                }
            }
        }
    }
}

impl Default for AttributeRegistry {
    fn default() -> Self {
        Self::helena()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn handle(uuid: Uuid, properties: CharacteristicProperties) -> CharacteristicHandle {
        CharacteristicHandle::new(HELENA_SERVICE_UUID, uuid, properties)
    }

    #[test]
    fn test_attribute_equality_ignores_name() {
        let a = AttributeId::new("first", DATA_AVAILABLE_UUID);
        let b = AttributeId::new("second", DATA_AVAILABLE_UUID);
        assert_eq!(a, b);
        assert_ne!(a, OBSERVATION_SET);
    }

    #[test]
    fn test_helena_registry_lookup() {
        let registry = AttributeRegistry::helena();
        assert_eq!(
            registry.service(&HELENA_SERVICE_UUID).map(|s| s.name.as_ref()),
            Some("helena")
        );
        assert!(registry.service(&DATA_AVAILABLE_UUID).is_none());
        assert_eq!(
            registry.characteristic(&DATA_AVAILABLE_UUID).map(|(_, r)| r),
            Some(CharacteristicRole::NotifySource)
        );
        assert_eq!(
            registry.characteristic(&OBSERVATION_SET_UUID).map(|(_, r)| r),
            Some(CharacteristicRole::ReadableSet)
        );
    }

    #[test]
    fn test_classify_requires_property() {
        let registry = AttributeRegistry::helena();

        assert_eq!(
            registry.classify(&handle(DATA_AVAILABLE_UUID, CharacteristicProperties::NOTIFY)),
            Classification::Recognized(CharacteristicRole::NotifySource)
        );
        assert_eq!(
            registry.classify(&handle(OBSERVATION_SET_UUID, CharacteristicProperties::WRITE)),
            Classification::MissingProperty {
                role: CharacteristicRole::ReadableSet,
                properties: CharacteristicProperties::WRITE,
            }
        );
    }

    #[test]
    fn test_classify_uses_subset_test() {
        let registry = AttributeRegistry::helena();
        let both = CharacteristicProperties::NOTIFY | CharacteristicProperties::READ;

        assert_eq!(
            registry.classify(&handle(DATA_AVAILABLE_UUID, both)),
            Classification::Recognized(CharacteristicRole::NotifySource)
        );
        assert_eq!(
            registry.classify(&handle(OBSERVATION_SET_UUID, both)),
            Classification::Recognized(CharacteristicRole::ReadableSet)
        );
    }

    #[test]
    fn test_with_characteristic_replaces_role() {
        let registry = AttributeRegistry::helena()
            .with_characteristic(DATA_AVAILABLE, CharacteristicRole::ReadableSet);
        assert_eq!(
            registry.characteristic(&DATA_AVAILABLE_UUID).map(|(_, r)| r),
            Some(CharacteristicRole::ReadableSet)
        );
    }

    #[test]
    fn test_properties_display() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert_eq!(props.to_string(), "read|notify");
        assert_eq!(CharacteristicProperties::NONE.to_string(), "none");
    }

    proptest! {
        #[test]
        fn unknown_uuids_are_unrecognized(raw in any::<u128>(), bits in any::<u8>()) {
            let uuid = Uuid::from_u128(raw);
            prop_assume!(uuid != DATA_AVAILABLE_UUID && uuid != OBSERVATION_SET_UUID);

            let registry = AttributeRegistry::helena();
            let props = CharacteristicProperties::from_bits(bits);
            prop_assert_eq!(registry.classify(&handle(uuid, props)), Classification::Unrecognized);
        }
    }
}
