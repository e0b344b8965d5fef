use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

/// Version placeholder for records that do not carry a primary store version.
pub const NO_VERSION: i64 = -1;

const FIELD_COUNT: usize = 8;
const SEPARATOR: char = '\t';

/// Durable-store operation that failed to mirror.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Bookkeeping write for a recursive cell deletion. Repair never replays it.
    CascadeDeleteMark,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseRecordError {
    #[error("expected {FIELD_COUNT} tab-separated fields, found {0}")]
    FieldCount(usize),

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("unknown operation kind `{0}`")]
    UnknownOperation(String),

    #[error("field `{field}` is not an integer: `{value}`")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field `{0}` contains a tab or line break")]
    Unencodable(&'static str),
}

/// One mirror write that did not reach the durable store.
///
/// Encoded as a single log line of eight tab-separated fields:
/// `index_name, doc_type, lock_key, cell_id, uuid, operation, es_version, updated`.
/// `lock_key` and `cell_id` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub index_name: String,
    pub doc_type: String,
    pub lock_key: String,
    pub cell_id: String,
    pub uuid: String,
    pub operation: OperationKind,
    pub es_version: i64,
    pub updated: i64,
}

impl FailureRecord {
    pub fn parse(line: &str) -> Result<Self, ParseRecordError> {
        let fields: Vec<&str> = line.split(SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(ParseRecordError::FieldCount(fields.len()));
        }
        let required = |value: &str, name: &'static str| {
            if value.is_empty() {
                Err(ParseRecordError::EmptyField(name))
            } else {
                Ok(value.to_string())
            }
        };
        // Only the form `to_line` writes is accepted: no sign prefix or
        // leading zeros.
        let number = |value: &str, field: &'static str| match value.parse::<i64>() {
            Ok(number) if number.to_string() == value => Ok(number),
            _ => Err(ParseRecordError::InvalidNumber {
                field,
                value: value.to_string(),
            }),
        };
        let operation = OperationKind::from_str(fields[5])
            .map_err(|_| ParseRecordError::UnknownOperation(fields[5].to_string()))?;

        Ok(Self {
            index_name: required(fields[0], "index_name")?,
            doc_type: required(fields[1], "doc_type")?,
            lock_key: fields[2].to_string(),
            cell_id: fields[3].to_string(),
            uuid: required(fields[4], "uuid")?,
            operation,
            es_version: number(fields[6], "es_version")?,
            updated: number(fields[7], "updated")?,
        })
    }

    /// Encodes the record as a log line without the trailing newline.
    pub fn to_line(&self) -> Result<String, ParseRecordError> {
        for (name, value) in [
            ("index_name", &self.index_name),
            ("doc_type", &self.doc_type),
            ("lock_key", &self.lock_key),
            ("cell_id", &self.cell_id),
            ("uuid", &self.uuid),
        ] {
            if value.contains([SEPARATOR, '\n', '\r']) {
                return Err(ParseRecordError::Unencodable(name));
            }
        }
        Ok(self.to_string())
    }

    /// Key used to collapse repeated failures of the same document.
    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.index_name, &self.uuid)
    }

    /// Key used to group records that share a lock.
    pub fn group_key(&self) -> String {
        format!("{}_{}", self.index_name, self.lock_key)
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.index_name,
            self.doc_type,
            self.lock_key,
            self.cell_id,
            self.uuid,
            self.operation,
            self.es_version,
            self.updated
        )
    }
}

impl FromStr for FailureRecord {
    type Err = ParseRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
