use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::EnumString;

/// Scope of a resource lock.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LockCategory {
    /// Box-level lock taken by WebDAV writes.
    Dav,
    /// Node-level lock taken by OData writes.
    Odata,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseLockKeyError {
    #[error("lock key `{0}` has no `{{category}}-{{id}}` form")]
    Malformed(String),

    #[error("lock key `{0}` uses an unknown category")]
    UnknownCategory(String),
}

/// Lock name in its `{category}-{id}` wire form, e.g. `odata-<node id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    category: LockCategory,
    id: String,
}

impl LockKey {
    pub fn new(category: LockCategory, id: impl Into<String>) -> Self {
        Self {
            category,
            id: id.into(),
        }
    }

    pub fn dav(box_id: impl Into<String>) -> Self {
        Self::new(LockCategory::Dav, box_id)
    }

    pub fn odata(node_id: impl Into<String>) -> Self {
        Self::new(LockCategory::Odata, node_id)
    }

    pub fn category(&self) -> LockCategory {
        self.category
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parse(s: &str) -> Result<Self, ParseLockKeyError> {
        let Some((category, id)) = s.split_once('-') else {
            return Err(ParseLockKeyError::Malformed(s.to_string()));
        };
        if id.is_empty() {
            return Err(ParseLockKeyError::Malformed(s.to_string()));
        }
        let category = LockCategory::from_str(category)
            .map_err(|_| ParseLockKeyError::UnknownCategory(s.to_string()))?;
        Ok(Self::new(category, id))
    }
}

impl Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.category, self.id)
    }
}

impl FromStr for LockKey {
    type Err = ParseLockKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for LockKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LockKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
