//! Identifier types used across the deposit workspace

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CommonError;

/// Identifier of a repository object.
///
/// Staged resources are keyed by the id of the object they become, so the
/// same value names the node before and after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Mint a fresh identifier for an object that has no staged counterpart
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl TryFrom<String> for ObjectId {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_identifier(&value, "object id")?;
        Ok(Self(value))
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

/// Identifier of a deposit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DepositId(String);

impl DepositId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the deposit record object materialized for this deposit
    pub fn record_id(&self) -> ObjectId {
        ObjectId(self.0.clone())
    }
}

impl Default for DepositId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DepositId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl TryFrom<String> for DepositId {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_identifier(&value, "deposit id")?;
        validate_path_segment(&value, "deposit id")?;
        Ok(Self(value))
    }
}

impl From<DepositId> for String {
    fn from(id: DepositId) -> Self {
        id.0
    }
}

/// Identifier of a single job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

fn validate_identifier(value: &str, kind: &str) -> Result<(), CommonError> {
    if value.trim().is_empty() {
        return Err(CommonError::InvalidIdentifier(format!("{} cannot be empty", kind)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(CommonError::InvalidIdentifier(format!(
            "{} '{}' contains whitespace",
            kind, value
        )));
    }
    Ok(())
}

/// Deposit ids name a directory, so they must be a single path segment
fn validate_path_segment(value: &str, kind: &str) -> Result<(), CommonError> {
    if value.contains(['/', '\\']) {
        return Err(CommonError::InvalidIdentifier(format!(
            "{} '{}' contains a path separator",
            kind, value
        )));
    }
    if value == "." || value == ".." {
        return Err(CommonError::InvalidIdentifier(format!(
            "{} '{}' is not a valid directory name",
            kind, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_rejects_blank() {
        assert!("".parse::<ObjectId>().is_err());
        assert!("  ".parse::<ObjectId>().is_err());
        assert!("a b".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_minted_ids_are_unique() {
        assert_ne!(ObjectId::mint(), ObjectId::mint());
    }

    #[test]
    fn test_deposit_record_id_matches_deposit() {
        let deposit: DepositId = "deposit-1".parse().unwrap();
        assert_eq!(deposit.record_id().as_str(), "deposit-1");
    }

    #[test]
    fn test_deposit_id_is_a_single_path_segment() {
        assert!("../other".parse::<DepositId>().is_err());
        assert!("a/b".parse::<DepositId>().is_err());
        assert!("a\\b".parse::<DepositId>().is_err());
        assert!("..".parse::<DepositId>().is_err());
        assert!(".".parse::<DepositId>().is_err());
        assert!(serde_json::from_str::<DepositId>("\"x/../y\"").is_err());

        let deposit: DepositId = "uuid:7f3c..1a".parse().unwrap();
        assert_eq!(deposit.as_str(), "uuid:7f3c..1a");
    }

    #[test]
    fn test_object_ids_keep_path_characters() {
        let id: ObjectId = "info:fedora/uuid:1234".parse().unwrap();
        assert_eq!(id.as_str(), "info:fedora/uuid:1234");
    }

    #[test]
    fn test_object_id_serde_validates() {
        let id: ObjectId = serde_json::from_str("\"file-1\"").unwrap();
        assert_eq!(id.as_str(), "file-1");
        assert!(serde_json::from_str::<ObjectId>("\"\"").is_err());
    }
}
