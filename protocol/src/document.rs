use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use strum_macros::Display;

use crate::LockKey;

/// Type name reserved for user-defined data spaces.
pub const USER_DATA_TYPE: &str = "UserData";

/// Durable-store table family a document is mirrored into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MirrorKind {
    Entity,
    Cell,
    Link,
    DavNode,
}

impl MirrorKind {
    pub fn from_doc_type(doc_type: &str) -> Self {
        match doc_type {
            "Cell" => Self::Cell,
            "Link" => Self::Link,
            "Dav" => Self::DavNode,
            _ => Self::Entity,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Cell => "cell",
            Self::Link => "link",
            Self::DavNode => "dav_node",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "entity" => Some(Self::Entity),
            "cell" => Some(Self::Cell),
            "link" => Some(Self::Link),
            "dav_node" => Some(Self::DavNode),
            _ => None,
        }
    }

    /// Source fields that hold nested objects and must never be stored as null.
    pub fn multi_value_fields(self) -> &'static [&'static str] {
        match self {
            Self::Entity => &["static", "dynamic", "hidden", "links"],
            Self::Cell => &["static", "dynamic", "hidden", "links", "acl"],
            Self::Link => &[],
            Self::DavNode => &["children", "acl", "properties"],
        }
    }
}

/// A resource as exchanged with both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub doc_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub published: i64,
    pub updated: i64,
    #[serde(default)]
    pub source: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            cell_id: None,
            box_id: None,
            node_id: None,
            published: 0,
            updated: 0,
            source: Map::new(),
        }
    }

    pub fn kind(&self) -> MirrorKind {
        MirrorKind::from_doc_type(&self.doc_type)
    }

    /// Lock that serializes repairs of this document: the owning box for
    /// WebDAV nodes, the owning node for everything else.
    pub fn lock_key(&self) -> Option<LockKey> {
        match self.kind() {
            MirrorKind::DavNode => self.box_id.as_deref().map(LockKey::dav),
            _ => self.node_id.as_deref().map(LockKey::odata),
        }
    }

    /// Returns a copy whose multi-valued fields are objects rather than
    /// missing or null.
    pub fn normalized(&self) -> Self {
        let mut doc = self.clone();
        doc.normalize();
        doc
    }

    pub fn normalize(&mut self) {
        for field in self.kind().multi_value_fields() {
            match self.source.get(*field) {
                Some(Value::Null) | None => {
                    self.source
                        .insert((*field).to_string(), Value::Object(Map::new()));
                }
                Some(_) => {}
            }
        }
    }
}
