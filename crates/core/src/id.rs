//! Strongly-typed identifiers used across the coordinator.
//!
//! Identifiers are opaque strings assigned by the outside world (the upload
//! flow, the identity provider, the cold-storage vault). They are never empty:
//! an empty identifier is how the upstream data model spells "absent", and
//! letting one through would make a cleared `archive_id` indistinguishable
//! from a real one.
//!
//! A [`JobId`] additionally names local files (`{job_id}~{input_file_name}`),
//! so it may not contain path separators or `~`, nor start with `.`.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an annotation job (immutable, assigned at submission).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Identifier of the user owning a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

/// Cold-storage handle for an archived result object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveId(String);

/// Handle of a tiered retrieval request issued against cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RetrievalJobId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal, $check:path) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                if let Err(reason) = $check(&value) {
                    return Err(DomainError::invalid_id(format!("{} {value:?}: {reason}", $name)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

fn opaque(_value: &str) -> Result<(), &'static str> {
    Ok(())
}

fn file_name_safe(value: &str) -> Result<(), &'static str> {
    if value.contains(['/', '\\']) {
        return Err("contains a path separator");
    }
    if value.contains('~') {
        return Err("contains '~'");
    }
    if value.starts_with('.') {
        return Err("starts with '.'");
    }
    Ok(())
}

impl_string_newtype!(JobId, "JobId", file_name_safe);
impl_string_newtype!(UserId, "UserId", opaque);
impl_string_newtype!(ArchiveId, "ArchiveId", opaque);
impl_string_newtype!(RetrievalJobId, "RetrievalJobId", opaque);

impl JobId {
    /// Mint a fresh job identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(JobId::new("").is_err());
        assert!(UserId::new("   ").is_err());
        assert!(ArchiveId::new("A1").is_ok());
    }

    #[test]
    fn serde_rejects_empty_strings() {
        let parsed: Result<ArchiveId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());

        let parsed: JobId = serde_json::from_str("\"J1\"").unwrap();
        assert_eq!(parsed.as_str(), "J1");
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"J1\"");
    }

    #[test]
    fn job_ids_must_be_usable_in_file_names() {
        for bad in ["J~1", "../escaped", "a/b", "a\\b", ".hidden"] {
            assert!(JobId::new(bad).is_err(), "{bad:?} accepted");
        }
        assert!(JobId::new("0190c3a1-7b2e-7cc0-9e5a-2f4f1d1c9a10").is_ok());
        assert!(UserId::new("auth0|user/1").is_ok());

        let parsed: Result<JobId, _> = serde_json::from_str("\"../escaped\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }
}
