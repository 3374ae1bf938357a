use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identifier that fits the one-byte length prefix of the handshake.
pub const MAX_TUNNEL_ID_LEN: usize = 127;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelIdError {
    #[error("tunnel identifier cannot be empty")]
    Empty,
    #[error("tunnel identifier is {0} bytes long, at most {MAX_TUNNEL_ID_LEN} are allowed")]
    TooLong(usize),
}

/// The identifier a client presents on the shared multiplex port to select its target.
///
/// Always between 1 and [`MAX_TUNNEL_ID_LEN`] bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelId(String);

impl TunnelId {
    pub fn new(id: impl Into<String>) -> Result<Self, TunnelIdError> {
        let id = id.into();
        match id.len() {
            0 => Err(TunnelIdError::Empty),
            len if len > MAX_TUNNEL_ID_LEN => Err(TunnelIdError::TooLong(len)),
            _ => Ok(TunnelId(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Length in bytes, which is what goes into the header's length prefix.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TunnelId {
    type Err = TunnelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TunnelId::new(s)
    }
}

impl TryFrom<String> for TunnelId {
    type Error = TunnelIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TunnelId::new(value)
    }
}

impl From<TunnelId> for String {
    fn from(value: TunnelId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_ids() {
        assert_eq!(TunnelId::new(""), Err(TunnelIdError::Empty));
        assert_eq!(
            TunnelId::new("x".repeat(128)),
            Err(TunnelIdError::TooLong(128))
        );
        assert!(TunnelId::new("x".repeat(127)).is_ok());
    }

    #[test]
    fn length_counts_bytes_not_chars() {
        let id = TunnelId::new("é").unwrap();
        assert_eq!(id.len(), 2);
        assert!(TunnelId::new("é".repeat(64)).is_err());
    }
}
