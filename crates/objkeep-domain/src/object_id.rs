use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SHA1_BYTES: usize = 20;
const SHA256_BYTES: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ObjectIdError {
    #[error("object id '{0}' is not hexadecimal")]
    NotHex(String),
    #[error("object id '{id}' has {len} hex digits (expected 40 or 64)")]
    BadLength { id: String, len: usize },
}

/// Hex object name, normalized to the lowercase spelling git uses on disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    pub fn parse(raw: &str) -> Result<Self, ObjectIdError> {
        let trimmed = raw.trim();
        let bytes = hex::decode(trimmed).map_err(|_| ObjectIdError::NotHex(trimmed.to_string()))?;
        if bytes.len() != SHA1_BYTES && bytes.len() != SHA256_BYTES {
            return Err(ObjectIdError::BadLength {
                id: trimmed.to_string(),
                len: trimmed.len(),
            });
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// The all-zero id git uses as "no object".
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fan-out directory and file name of the loose object.
    #[must_use]
    pub fn loose_object_parts(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = ObjectIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(value: ObjectId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sha1_and_sha256_ids() {
        let sha1 = ObjectId::parse("5d7b5e6b1f0c1a7e9b3bf2d36c4c1ad1e2f3a4b5").unwrap();
        assert_eq!(sha1.loose_object_parts(), ("5d", "7b5e6b1f0c1a7e9b3bf2d36c4c1ad1e2f3a4b5"));
        let sha256 = "a".repeat(64);
        assert!(ObjectId::parse(&sha256).is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(matches!(
            ObjectId::parse("not-an-id"),
            Err(ObjectIdError::NotHex(_))
        ));
        assert!(matches!(
            ObjectId::parse("abcd"),
            Err(ObjectIdError::BadLength { len: 4, .. })
        ));
    }

    #[test]
    fn uppercase_ids_are_lowercased() {
        let upper = ObjectId::parse("5D7B5E6B1F0C1A7E9B3BF2D36C4C1AD1E2F3A4B5").unwrap();
        let lower = ObjectId::parse("5d7b5e6b1f0c1a7e9b3bf2d36c4c1ad1e2f3a4b5").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.loose_object_parts().0, "5d");
        assert_eq!(upper.to_string(), "5d7b5e6b1f0c1a7e9b3bf2d36c4c1ad1e2f3a4b5");
    }

    #[test]
    fn detects_null_id() {
        let null = ObjectId::parse(&"0".repeat(40)).unwrap();
        assert!(null.is_null());
        let real = ObjectId::parse(&format!("{}1", "0".repeat(39))).unwrap();
        assert!(!real.is_null());
    }
}
