use dsync_protocol::Document;
use dsync_protocol::MirrorKind;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::MirrorError;

pub(crate) const MIRROR_RECORD_COLUMNS: &str =
    "index_name, kind, id, doc_type, cell_id, box_id, node_id, source, published, updated";

/// One row of `mirror_records`.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRecord {
    pub index_name: String,
    pub kind: MirrorKind,
    pub document: Document,
}

impl MirrorRecord {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self, MirrorError> {
        let id: String = row.try_get("id")?;
        let kind: String = row.try_get("kind")?;
        let kind = MirrorKind::parse(&kind)
            .ok_or_else(|| MirrorError::invalid(&id, format!("unknown kind `{kind}`")))?;
        let source: String = row.try_get("source")?;
        let source = match serde_json::from_str::<Value>(&source) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(MirrorError::invalid(&id, "source is not a JSON object")),
            Err(err) => return Err(MirrorError::invalid(&id, err.to_string())),
        };
        Ok(Self {
            index_name: row.try_get("index_name")?,
            kind,
            document: Document {
                id,
                doc_type: row.try_get("doc_type")?,
                cell_id: row.try_get("cell_id")?,
                box_id: row.try_get("box_id")?,
                node_id: row.try_get("node_id")?,
                published: row.try_get("published")?,
                updated: row.try_get("updated")?,
                source,
            },
        })
    }
}
