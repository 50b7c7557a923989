use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Key shared by a stored advert and its image object.
///
/// A random v4 UUID rendered in hyphenated lowercase form, so it is safe as
/// a document key and as an object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordIdentity(Uuid);

#[derive(Debug, Error)]
#[error("`{value}` is not a record identity")]
pub struct IdentityError {
    value: String,
}

impl RecordIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Only the canonical hyphenated form is accepted, since that is the
    /// only form this service ever writes.
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        let invalid = || IdentityError {
            value: value.to_string(),
        };
        let uuid = Uuid::try_parse(value).map_err(|_| invalid())?;
        if uuid.hyphenated().to_string() != value {
            return Err(invalid());
        }
        Ok(Self(uuid))
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RecordIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
