//! SQLite-backed employee registry and punch log.
//!
//! All statements run on the `tokio-rusqlite` background connection thread;
//! callers only see async methods.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use timeclock_core::{Embedding, Identity, IdentityId, Registry, RegistryError};
use tokio_rusqlite::Connection;

use crate::punch::{Punch, PunchKind};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS employees (
    id            TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    metadata      TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS punches (
    id          TEXT PRIMARY KEY,
    employee_id TEXT NOT NULL,
    kind        TEXT NOT NULL CHECK (kind IN ('in', 'out')),
    at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS punches_by_employee ON punches (employee_id, at);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("cannot create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("embedding has {actual} dimensions, enrolled employees have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("display name must not be empty")]
    EmptyName,
    #[error("unknown employee: {0}")]
    UnknownEmployee(IdentityId),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// An enrolled employee with its bookkeeping fields.
#[derive(Debug, Clone)]
pub struct Employee {
    pub identity: Identity,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row as read from `employees`, before decoding.
struct EmployeeRow {
    id: String,
    display_name: String,
    embedding: Vec<u8>,
    dim: i64,
    model_version: Option<String>,
    metadata: String,
    created_at: String,
}

impl EmployeeRow {
    fn decode(self) -> Result<Employee, StoreError> {
        let values = decode_embedding(&self.embedding).ok_or_else(|| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("embedding blob of {} bytes", self.embedding.len()),
        })?;
        if values.len() as i64 != self.dim {
            return Err(StoreError::Corrupt {
                id: self.id,
                reason: format!("dim column {} but blob has {} values", self.dim, values.len()),
            });
        }
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let metadata = serde_json::from_str(&self.metadata)?;

        Ok(Employee {
            identity: Identity {
                id: IdentityId::from(self.id),
                display_name: self.display_name,
                embedding: Embedding {
                    values,
                    model_version: self.model_version,
                },
            },
            metadata,
            created_at,
        })
    }
}

struct PunchRow {
    id: String,
    employee_id: String,
    kind: String,
    at: String,
}

impl PunchRow {
    fn decode(self) -> Result<Punch, StoreError> {
        let kind: PunchKind = self.kind.parse().map_err(|e| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("{e}"),
        })?;
        let at = parse_timestamp(&self.id, &self.at)?;
        Ok(Punch {
            id: self.id,
            employee_id: IdentityId::from(self.employee_id),
            kind,
            at,
        })
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            employee_id: row.get(1)?,
            kind: row.get(2)?,
            at: row.get(3)?,
        })
    }
}

/// Embeddings are stored as little-endian `f32` blobs.
fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(id: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("timestamp {text:?}: {e}"),
        })
}

/// Handle to the time clock database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.migrate(true).await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate(false).await?;
        Ok(store)
    }

    async fn migrate(&self, wal: bool) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                if wal {
                    let mode: String = conn
                        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                    tracing::debug!(journal_mode = %mode, "sqlite journal mode");
                }
                conn.execute_batch(SCHEMA)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_employees(&self) -> Result<Vec<Employee>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, display_name, embedding, dim, model_version, metadata, created_at
                     FROM employees ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(EmployeeRow {
                            id: row.get(0)?,
                            display_name: row.get(1)?,
                            embedding: row.get(2)?,
                            dim: row.get(3)?,
                            model_version: row.get(4)?,
                            metadata: row.get(5)?,
                            created_at: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(EmployeeRow::decode).collect()
    }

    /// Every enrolled identity, in enrollment order.
    pub async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self
            .list_employees()
            .await?
            .into_iter()
            .map(|e| e.identity)
            .collect())
    }

    /// Immutable snapshot for the detection loop.
    pub async fn registry(&self) -> Result<Registry, StoreError> {
        Ok(Registry::new(self.list_identities().await?)?)
    }

    /// Enroll a new employee. The embedding must match the dimension of
    /// everyone already enrolled.
    pub async fn add_identity(
        &self,
        display_name: &str,
        embedding: Embedding,
        metadata: serde_json::Value,
    ) -> Result<Identity, StoreError> {
        let display_name = display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if embedding.values.is_empty() {
            return Err(StoreError::EmptyEmbedding);
        }

        let identity = Identity {
            id: IdentityId::generate(),
            display_name,
            embedding,
        };
        let metadata = serde_json::to_string(&metadata)?;
        let created_at = format_timestamp(Utc::now());

        let row = identity.clone();
        let dim = row.embedding.dim();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let enrolled_dim: Option<i64> = tx
                    .query_row("SELECT dim FROM employees LIMIT 1", [], |r| r.get(0))
                    .optional()?;
                if let Some(expected) = enrolled_dim.filter(|&d| d != dim as i64) {
                    return Ok(Err(StoreError::DimensionMismatch {
                        expected: expected as usize,
                        actual: dim,
                    }));
                }
                tx.execute(
                    "INSERT INTO employees
                         (id, display_name, embedding, dim, model_version, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id.as_str(),
                        row.display_name,
                        encode_embedding(&row.embedding.values),
                        dim as i64,
                        row.embedding.model_version,
                        metadata,
                        created_at,
                    ],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;
        outcome?;

        tracing::info!(id = %identity.id, name = %identity.display_name, dim, "employee enrolled");
        Ok(identity)
    }

    /// Remove an employee. Their punches are kept. Returns false if the id
    /// was not enrolled.
    pub async fn remove_identity(&self, id: &IdentityId) -> Result<bool, StoreError> {
        let key = id.as_str().to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM employees WHERE id = ?1", [key])?))
            .await?;
        if removed > 0 {
            tracing::info!(%id, "employee removed");
        }
        Ok(removed > 0)
    }

    pub async fn record_punch(
        &self,
        employee_id: &IdentityId,
        kind: PunchKind,
        at: DateTime<Utc>,
    ) -> Result<Punch, StoreError> {
        let punch = Punch {
            id: uuid::Uuid::new_v4().to_string(),
            employee_id: employee_id.clone(),
            kind,
            at,
        };

        let row = punch.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let known: bool = conn.query_row(
                    "SELECT EXISTS (SELECT 1 FROM employees WHERE id = ?1)",
                    [row.employee_id.as_str()],
                    |r| r.get(0),
                )?;
                if !known {
                    return Ok(false);
                }
                conn.execute(
                    "INSERT INTO punches (id, employee_id, kind, at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        row.id,
                        row.employee_id.as_str(),
                        row.kind.as_str(),
                        format_timestamp(row.at)
                    ],
                )?;
                Ok(true)
            })
            .await?;

        if !inserted {
            return Err(StoreError::UnknownEmployee(employee_id.clone()));
        }
        Ok(punch)
    }

    /// The employee's most recent punch.
    pub async fn last_punch(&self, employee_id: &IdentityId) -> Result<Option<Punch>, StoreError> {
        let key = employee_id.as_str().to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, employee_id, kind, at FROM punches
                         WHERE employee_id = ?1 ORDER BY at DESC, rowid DESC LIMIT 1",
                        [key],
                        PunchRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(PunchRow::decode).transpose()
    }

    /// Most recent punches first, optionally for one employee.
    pub async fn list_punches(
        &self,
        employee_id: Option<&IdentityId>,
        limit: usize,
    ) -> Result<Vec<Punch>, StoreError> {
        let key = employee_id.map(|id| id.as_str().to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, employee_id, kind, at FROM punches
                     WHERE ?1 IS NULL OR employee_id = ?1
                     ORDER BY at DESC, rowid DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![key, limit], PunchRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(PunchRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let values = vec![0.25, -1.5, f32::MIN_POSITIVE, 3.0e7];
        let blob = encode_embedding(&values);
        assert_eq!(blob.len(), 16);
        assert_eq!(decode_embedding(&blob).unwrap(), values);
        assert!(decode_embedding(&blob[..15]).is_none());
    }

    #[tokio::test]
    async fn test_enroll_and_list() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = store
            .add_identity(
                "  Alice  ",
                embedding(&[0.1, 0.2, 0.3]).with_model_version("w600k_r50"),
                json!({"badge": 17}),
            )
            .await
            .unwrap();
        assert_eq!(alice.display_name, "Alice");

        let employees = store.list_employees().await.unwrap();
        assert_eq!(employees.len(), 1);
        let stored = &employees[0];
        assert_eq!(stored.identity, alice);
        assert_eq!(stored.identity.embedding.model_version.as_deref(), Some("w600k_r50"));
        assert_eq!(stored.metadata, json!({"badge": 17}));

        let registry = store.registry().await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&alice.id).unwrap().display_name, "Alice");
    }

    #[tokio::test]
    async fn test_enroll_rejects_other_dimension() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_identity("Alice", embedding(&[0.0, 0.0]), json!({}))
            .await
            .unwrap();

        let err = store
            .add_identity("Bob", embedding(&[0.0, 0.0, 0.0]), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(store.list_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_rejects_empty_input() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(matches!(
            store.add_identity(" ", embedding(&[1.0]), json!({})).await,
            Err(StoreError::EmptyName)
        ));
        assert!(matches!(
            store.add_identity("Alice", embedding(&[]), json!({})).await,
            Err(StoreError::EmptyEmbedding)
        ));
    }

    #[tokio::test]
    async fn test_empty_store_gives_empty_registry() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.registry().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_keeps_punch_history() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = store
            .add_identity("Alice", embedding(&[1.0]), json!({}))
            .await
            .unwrap();
        store
            .record_punch(&alice.id, PunchKind::In, Utc::now())
            .await
            .unwrap();

        assert!(store.remove_identity(&alice.id).await.unwrap());
        assert!(!store.remove_identity(&alice.id).await.unwrap());
        assert!(store.list_identities().await.unwrap().is_empty());
        assert_eq!(store.list_punches(Some(&alice.id), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_punch_for_unknown_employee_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let ghost = IdentityId::from("ghost");
        let err = store
            .record_punch(&ghost, PunchKind::In, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownEmployee(id) if id == ghost));
    }

    #[tokio::test]
    async fn test_punch_queries_are_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = store
            .add_identity("Alice", embedding(&[1.0]), json!({}))
            .await
            .unwrap();
        let bob = store
            .add_identity("Bob", embedding(&[2.0]), json!({}))
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        store.record_punch(&alice.id, PunchKind::In, start).await.unwrap();
        store
            .record_punch(&bob.id, PunchKind::In, start + Duration::minutes(5))
            .await
            .unwrap();
        let out = store
            .record_punch(&alice.id, PunchKind::Out, start + Duration::hours(8))
            .await
            .unwrap();

        assert_eq!(store.last_punch(&alice.id).await.unwrap(), Some(out.clone()));
        assert!(store.last_punch(&IdentityId::from("nobody")).await.unwrap().is_none());

        let all = store.list_punches(None, 10).await.unwrap();
        let kinds: Vec<(String, PunchKind)> = all
            .iter()
            .map(|p| (p.employee_id.to_string(), p.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (alice.id.to_string(), PunchKind::Out),
                (bob.id.to_string(), PunchKind::In),
                (alice.id.to_string(), PunchKind::In),
            ]
        );

        let latest = store.list_punches(Some(&alice.id), 1).await.unwrap();
        assert_eq!(latest, vec![out]);
    }
}
