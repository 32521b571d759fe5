//! InstanceId: Unique identity of one running editor instance.
//!
//! Generated once at process start and never changed afterwards. Every
//! outbound event is stamped with it so that receivers can tell their own
//! broadcasts apart from a peer's.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Number of characters in a generated identity.
pub const INSTANCE_ID_LEN: usize = 30;

/// Longest identity accepted from the wire.
const MAX_INSTANCE_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Instance ID is empty")]
    Empty,
    #[error("Instance ID too long: {0} chars")]
    TooLong(usize),
    #[error("Invalid character in instance ID: {0:?}")]
    InvalidChar(char),
}

/// A unique identifier for one editor instance.
///
/// Displays as 30 lowercase hex characters (a v4 UUID with the dashes
/// removed, truncated). The value is also embedded in bus names, so only
/// ASCII alphanumerics are accepted when parsing.
///
/// # Examples
/// ```
/// use sharedpad_core::InstanceId;
///
/// let id = InstanceId::generate();
/// assert_eq!(id.as_str().len(), 30);
///
/// let parsed: InstanceId = id.to_string().parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a new random instance ID.
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(INSTANCE_ID_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_INSTANCE_ID_LEN {
            return Err(IdentityError::TooLong(s.len()));
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(IdentityError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

// Serialize as a plain string so the envelope carries it as one field
impl serde::Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
