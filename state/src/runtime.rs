use crate::MirrorError;
use crate::MirrorRecord;
use crate::Result;
use crate::migrations::MIGRATOR;
use crate::model::MIRROR_RECORD_COLUMNS;
use chrono::Utc;
use dsync_protocol::Document;
use dsync_protocol::MirrorKind;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqliteConnection;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

mod locks;
#[cfg(test)]
mod test_support;

pub const MIRROR_DB_FILENAME: &str = "authentic";
pub const MIRROR_DB_VERSION: u32 = 1;

/// SQLite-backed durable mirror of the primary store.
#[derive(Clone)]
pub struct MirrorRuntime {
    db_path: PathBuf,
    pool: Arc<sqlx::SqlitePool>,
}

impl MirrorRuntime {
    /// Opens (and migrates) the SQLite database at `db_path`, creating the
    /// parent directory when needed.
    pub async fn init(db_path: PathBuf) -> anyhow::Result<Arc<Self>> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = match open_sqlite(&db_path).await {
            Ok(db) => Arc::new(db),
            Err(err) => {
                warn!("failed to open durable store at {}: {err}", db_path.display());
                return Err(err);
            }
        };
        Ok(Arc::new(Self { db_path, pool }))
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Round-trips a trivial query to prove the store is reachable.
    pub async fn check_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|err| match MirrorError::from(err) {
                MirrorError::Database(err) => MirrorError::Connection(err),
                other => other,
            })?;
        Ok(())
    }

    /// Creates the container for `index_name`. Returns `false` when it
    /// already existed.
    pub async fn create_container(&self, index_name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
INSERT INTO containers (index_name, created_at)
VALUES (?, ?)
ON CONFLICT(index_name) DO NOTHING
            "#,
        )
        .bind(index_name)
        .bind(Utc::now().timestamp_millis())
        .execute(self.pool.as_ref())
        .await?;
        let created = result.rows_affected() == 1;
        if created {
            debug!("created durable container {index_name}");
        }
        Ok(created)
    }

    pub async fn container_exists(&self, index_name: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        container_exists(&mut conn, index_name).await
    }

    /// Inserts `doc` into the table family of its type.
    pub async fn insert_record(&self, index_name: &str, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_container(&mut tx, index_name).await?;
        insert_record(&mut tx, index_name, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replaces the stored copy of `doc`. Fails with
    /// [`MirrorError::NotFound`] when there is nothing to replace.
    pub async fn update_record(&self, index_name: &str, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_container(&mut tx, index_name).await?;
        update_record(&mut tx, index_name, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes a stored record. Returns `false` when it did not exist.
    pub async fn delete_record(&self, index_name: &str, kind: MirrorKind, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        ensure_container(&mut tx, index_name).await?;
        let result = sqlx::query(
            r#"
DELETE FROM mirror_records
WHERE index_name = ? AND kind = ? AND id = ?
            "#,
        )
        .bind(index_name)
        .bind(kind.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Looks up records of one kind by id. A missing container holds nothing.
    pub async fn find_records(
        &self,
        index_name: &str,
        kind: MirrorKind,
        ids: &[String],
    ) -> Result<Vec<MirrorRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MIRROR_RECORD_COLUMNS} FROM mirror_records WHERE index_name = "
        ));
        builder.push_bind(index_name);
        builder.push(" AND kind = ").push_bind(kind.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");
        builder.push(" ORDER BY id");

        let rows = builder.build().fetch_all(self.pool.as_ref()).await?;
        rows.iter().map(MirrorRecord::try_from_row).collect()
    }

    /// Inserts every document in one transaction; nothing is stored when any
    /// insert fails.
    pub async fn insert_records(&self, index_name: &str, docs: &[Document]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_container(&mut tx, index_name).await?;
        for doc in docs {
            insert_record(&mut tx, index_name, doc).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Updates `entities` and inserts `links` in one transaction.
    pub async fn update_records_with_links(
        &self,
        index_name: &str,
        entities: &[Document],
        links: &[Document],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_container(&mut tx, index_name).await?;
        for doc in entities {
            update_record(&mut tx, index_name, doc).await?;
        }
        for link in links {
            insert_record(&mut tx, index_name, link).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Records that every resource of `cell_id` under `unit_index` is being
    /// deleted recursively.
    pub async fn insert_cell_delete_mark(&self, cell_id: &str, unit_index: &str) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO cell_delete_marks (cell_id, unit_index, marked_at)
VALUES (?, ?, ?)
ON CONFLICT(cell_id, unit_index) DO UPDATE SET marked_at = excluded.marked_at
            "#,
        )
        .bind(cell_id)
        .bind(unit_index)
        .bind(Utc::now().timestamp_millis())
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| MirrorError::from_write(cell_id, err))?;
        Ok(())
    }

    pub async fn cell_delete_marks(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
SELECT cell_id, unit_index
FROM cell_delete_marks
ORDER BY marked_at, cell_id
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("cell_id")?, row.try_get("unit_index")?))
            })
            .collect()
    }

    pub async fn count_records(&self, index_name: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM mirror_records WHERE index_name = ?")
            .bind(index_name)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(row.try_get("total")?)
    }
}

async fn container_exists(conn: &mut SqliteConnection, index_name: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM containers WHERE index_name = ?")
        .bind(index_name)
        .fetch_optional(conn)
        .await?;
    Ok(row.is_some())
}

async fn ensure_container(conn: &mut SqliteConnection, index_name: &str) -> Result<()> {
    if container_exists(conn, index_name).await? {
        Ok(())
    } else {
        Err(MirrorError::ContainerMissing(index_name.to_string()))
    }
}

struct EncodedDocument {
    kind: MirrorKind,
    source: String,
}

fn encode(doc: &Document) -> Result<EncodedDocument> {
    if doc.id.is_empty() {
        return Err(MirrorError::invalid(&doc.id, "id must not be empty"));
    }
    if doc.doc_type.is_empty() {
        return Err(MirrorError::invalid(&doc.id, "type must not be empty"));
    }
    let normalized = doc.normalized();
    let source = serde_json::to_string(&normalized.source)
        .map_err(|err| MirrorError::invalid(&doc.id, err.to_string()))?;
    Ok(EncodedDocument {
        kind: doc.kind(),
        source,
    })
}

async fn insert_record(conn: &mut SqliteConnection, index_name: &str, doc: &Document) -> Result<()> {
    let encoded = encode(doc)?;
    sqlx::query(
        r#"
INSERT INTO mirror_records (
    index_name,
    kind,
    id,
    doc_type,
    cell_id,
    box_id,
    node_id,
    source,
    published,
    updated
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(index_name)
    .bind(encoded.kind.as_str())
    .bind(&doc.id)
    .bind(&doc.doc_type)
    .bind(doc.cell_id.as_deref())
    .bind(doc.box_id.as_deref())
    .bind(doc.node_id.as_deref())
    .bind(encoded.source)
    .bind(doc.published)
    .bind(doc.updated)
    .execute(conn)
    .await
    .map_err(|err| MirrorError::from_write(&doc.id, err))?;
    Ok(())
}

async fn update_record(conn: &mut SqliteConnection, index_name: &str, doc: &Document) -> Result<()> {
    let encoded = encode(doc)?;
    let result = sqlx::query(
        r#"
UPDATE mirror_records
SET
    doc_type = ?,
    cell_id = ?,
    box_id = ?,
    node_id = ?,
    source = ?,
    published = ?,
    updated = ?
WHERE index_name = ? AND kind = ? AND id = ?
        "#,
    )
    .bind(&doc.doc_type)
    .bind(doc.cell_id.as_deref())
    .bind(doc.box_id.as_deref())
    .bind(doc.node_id.as_deref())
    .bind(encoded.source)
    .bind(doc.published)
    .bind(doc.updated)
    .bind(index_name)
    .bind(encoded.kind.as_str())
    .bind(&doc.id)
    .execute(conn)
    .await
    .map_err(|err| MirrorError::from_write(&doc.id, err))?;
    if result.rows_affected() == 0 {
        return Err(MirrorError::NotFound(doc.id.clone()));
    }
    Ok(())
}

async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

pub fn mirror_db_filename() -> String {
    format!("{MIRROR_DB_FILENAME}_{MIRROR_DB_VERSION}.sqlite")
}

pub fn mirror_db_path(home: &Path) -> PathBuf {
    home.join(mirror_db_filename())
}
