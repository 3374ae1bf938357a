use std::{fmt, num::NonZeroU16, str::FromStr};

use serde::{Deserialize, Serialize};

use super::TunnelId;

/// Identifies a mapping in the registry and in the store.
///
/// A `Port` key is a direct mapping: the key is the local port that gets bound.
/// An `Id` key is a multiplex mapping selected through the identifier handshake
/// on the shared port.
///
/// Serialized untagged, so a record reads `{"key": 8001, ...}` or `{"key": "abc", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingKey {
    Port(NonZeroU16),
    Id(TunnelId),
}

impl MappingKey {
    pub fn port(&self) -> Option<u16> {
        match self {
            MappingKey::Port(port) => Some(port.get()),
            MappingKey::Id(_) => None,
        }
    }

    pub fn tunnel_id(&self) -> Option<&TunnelId> {
        match self {
            MappingKey::Port(_) => None,
            MappingKey::Id(id) => Some(id),
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingKey::Port(port) => write!(f, ":{}", port),
            MappingKey::Id(id) => write!(f, "#{}", id),
        }
    }
}

impl From<NonZeroU16> for MappingKey {
    fn from(value: NonZeroU16) -> Self {
        MappingKey::Port(value)
    }
}

impl From<TunnelId> for MappingKey {
    fn from(value: TunnelId) -> Self {
        MappingKey::Id(value)
    }
}

/// Anything that parses as a non-zero port becomes a `Port` key, everything else an `Id`.
impl FromStr for MappingKey {
    type Err = <TunnelId as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(port) = s.parse::<NonZeroU16>() {
            return Ok(MappingKey::Port(port));
        }
        Ok(MappingKey::Id(s.parse()?))
    }
}

impl TryFrom<u16> for MappingKey {
    type Error = std::num::TryFromIntError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(MappingKey::Port(NonZeroU16::try_from(value)?))
    }
}
