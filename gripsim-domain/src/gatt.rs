//! GATT tree model: services, characteristics, descriptors and the registry that indexes them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::iter;
use std::ops::BitOr;

use thiserror::Error;
use uuid::Uuid;

/// Characteristic User Description descriptor (0x2901)
pub const USER_DESCRIPTION_UUID: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Properties(u8);

impl Properties {
    pub const NONE: Properties = Properties(0);
    pub const READ: Properties = Properties(0b001);
    pub const WRITE: Properties = Properties(0b010);
    pub const NOTIFY: Properties = Properties(0b100);

    pub const fn contains(self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn allows(self, operation: Operation) -> bool {
        self.contains(operation.required())
    }
}

impl BitOr for Properties {
    type Output = Properties;

    fn bitor(self, rhs: Properties) -> Properties {
        Properties(self.0 | rhs.0)
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Properties::READ, "Read"),
            (Properties::WRITE, "Write"),
            (Properties::NOTIFY, "Notify"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            write!(f, "None")
        } else {
            write!(f, "{}", names.join(" | "))
        }
    }
}

/// An operation a client may attempt against a characteristic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Operation {
    Read,
    Write,
    Subscribe,
}

impl Operation {
    fn required(self) -> Properties {
        match self {
            Operation::Read => Properties::READ,
            Operation::Write => Properties::WRITE,
            Operation::Subscribe => Properties::NOTIFY,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
            Operation::Subscribe => write!(f, "subscribe"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("uuid {0} is already registered")]
    DuplicateUuid(Uuid),
    #[error("no characteristic with uuid {0}")]
    UnknownCharacteristic(Uuid),
    #[error("{operation} is not permitted on characteristic {uuid}")]
    CapabilityDenied { uuid: Uuid, operation: Operation },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattCharacteristic {
    uuid: Uuid,
    name: String,
    properties: Properties,
    service: Uuid,
    descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> Properties {
        self.properties
    }

    /// Key of the owning service; resolve it through [`GattRegistry::service`].
    pub fn service_uuid(&self) -> Uuid {
        self.service
    }

    pub fn descriptors(&self) -> &[GattDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattService {
    uuid: Uuid,
    name: String,
    characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            characteristics: Vec::new(),
        }
    }

    /// Appends a characteristic, described by a user-description descriptor carrying `name`.
    #[must_use]
    pub fn with_characteristic(
        mut self,
        uuid: Uuid,
        name: impl Into<String>,
        properties: Properties,
    ) -> Self {
        let name = name.into();
        let description = GattDescriptor {
            uuid: USER_DESCRIPTION_UUID,
            value: name.as_bytes().to_vec(),
        };
        self.characteristics.push(GattCharacteristic {
            uuid,
            name,
            properties,
            service: self.uuid,
            descriptors: vec![description],
        });
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn characteristics(&self) -> &[GattCharacteristic] {
        &self.characteristics
    }
}

/// Index over registered services. Built once, then shared read-only.
#[derive(Default, Debug)]
pub struct GattRegistry {
    services: Vec<GattService>,
    characteristics: HashMap<Uuid, (usize, usize)>,
}

impl GattRegistry {
    pub fn register(&mut self, service: GattService) -> Result<(), GattError> {
        let mut seen = HashSet::new();
        let uuids = iter::once(service.uuid).chain(service.characteristics.iter().map(|c| c.uuid));
        for uuid in uuids {
            if self.contains(uuid) || !seen.insert(uuid) {
                return Err(GattError::DuplicateUuid(uuid));
            }
        }

        let service_index = self.services.len();
        for (index, characteristic) in service.characteristics.iter().enumerate() {
            self.characteristics
                .insert(characteristic.uuid, (service_index, index));
        }
        self.services.push(service);
        Ok(())
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.characteristics.contains_key(&uuid) || self.services.iter().any(|s| s.uuid == uuid)
    }

    pub fn resolve(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics
            .get(&uuid)
            .map(|&(service, index)| &self.services[service].characteristics[index])
    }

    /// Property set of a characteristic; empty for unknown uuids.
    pub fn capabilities(&self, uuid: Uuid) -> Properties {
        self.resolve(uuid)
            .map(GattCharacteristic::properties)
            .unwrap_or(Properties::NONE)
    }

    /// Resolves `uuid` and checks that `operation` is permitted by its properties.
    pub fn authorize(
        &self,
        uuid: Uuid,
        operation: Operation,
    ) -> Result<&GattCharacteristic, GattError> {
        let characteristic = self
            .resolve(uuid)
            .ok_or(GattError::UnknownCharacteristic(uuid))?;
        if characteristic.properties.allows(operation) {
            Ok(characteristic)
        } else {
            Err(GattError::CapabilityDenied { uuid, operation })
        }
    }

    pub fn service(&self, uuid: Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub fn parent(&self, characteristic: &GattCharacteristic) -> Option<&GattService> {
        self.service(characteristic.service)
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    pub fn notifiable(&self) -> impl Iterator<Item = &GattCharacteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| c.properties.contains(Properties::NOTIFY))
    }
}
