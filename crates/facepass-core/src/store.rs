//! Durable identity storage.
//!
//! [`IdentityStore`] is the contract the gallery and ledger need from
//! persistence; [`SqliteStore`] implements it on a single SQLite file.

use crate::ledger::VisitState;
use crate::types::{Embedding, GalleryEntry, Identity, IdentityDraft, IdentityId, IdentitySummary};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Persistence contract for identity records.
pub trait IdentityStore: Send + Sync {
    /// Create a record with zeroed visit state, returning its new id.
    fn insert(&self, draft: &IdentityDraft) -> Result<IdentityId, StoreError>;

    /// Minimal rows needed for matching, ordered by id.
    fn embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    /// Listing rows without embeddings, ordered by id.
    fn summaries(&self) -> Result<Vec<IdentitySummary>, StoreError>;

    /// Full record, or `None` when the id does not exist.
    fn fetch(&self, id: IdentityId) -> Result<Option<Identity>, StoreError>;

    /// Overwrite the visit state. Returns `false` when the id does not exist.
    fn save_visit_state(&self, id: IdentityId, state: &VisitState) -> Result<bool, StoreError>;

    /// Delete every record with this display name, returning the removed ids.
    fn delete_by_name(&self, name: &str) -> Result<Vec<IdentityId>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    email           TEXT NOT NULL,
    embedding       BLOB NOT NULL,
    visits          INTEGER NOT NULL DEFAULT 0,
    rewards         INTEGER NOT NULL DEFAULT 0,
    last_visit_date TEXT
);
CREATE INDEX IF NOT EXISTS identities_name ON identities(name);
";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed [`IdentityStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened identity database");
        Self::from_connection(conn)
    }

    /// Private in-memory database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        migrate_last_visit_column(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Databases created before visit dates were tracked lack the column.
fn migrate_last_visit_column(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("PRAGMA table_info(identities)")?;
    let has_column = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .any(|name| name == "last_visit_date");

    if !has_column {
        tracing::info!("adding last_visit_date column to identities");
        conn.execute("ALTER TABLE identities ADD COLUMN last_visit_date TEXT", [])?;
    }
    Ok(())
}

fn decode_embedding(id: i64, blob: &[u8]) -> Result<Embedding, StoreError> {
    Embedding::from_le_bytes(blob).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("embedding blob of {} bytes is not a float array", blob.len()),
    })
}

fn decode_date(id: i64, text: Option<String>) -> Result<Option<NaiveDate>, StoreError> {
    text.map(|t| {
        NaiveDate::parse_from_str(&t, DATE_FORMAT).map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("bad last_visit_date {t:?}: {e}"),
        })
    })
    .transpose()
}

/// Raw row for the visit-state columns, decoded outside the rusqlite closure
/// so corruption surfaces as [`StoreError::Corrupt`].
struct RawVisit {
    visits: i64,
    rewards: i64,
    last_visit: Option<String>,
}

impl RawVisit {
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            visits: row.get(offset)?,
            rewards: row.get(offset + 1)?,
            last_visit: row.get(offset + 2)?,
        })
    }

    fn decode(self, id: i64) -> Result<VisitState, StoreError> {
        let visits = u32::try_from(self.visits).map_err(|_| StoreError::Corrupt {
            id,
            reason: format!("visits out of range: {}", self.visits),
        })?;
        let rewards = u64::try_from(self.rewards).map_err(|_| StoreError::Corrupt {
            id,
            reason: format!("rewards out of range: {}", self.rewards),
        })?;
        Ok(VisitState {
            visits,
            rewards,
            last_visit: decode_date(id, self.last_visit)?,
        })
    }
}

impl IdentityStore for SqliteStore {
    fn insert(&self, draft: &IdentityDraft) -> Result<IdentityId, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities (name, email, embedding) VALUES (?1, ?2, ?3)",
            params![draft.name, draft.email, draft.embedding.to_le_bytes()],
        )?;
        Ok(IdentityId(conn.last_insert_rowid()))
    }

    fn embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, embedding FROM identities ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, blob)| {
                Ok(GalleryEntry {
                    id: IdentityId(id),
                    name,
                    embedding: decode_embedding(id, &blob)?,
                })
            })
            .collect()
    }

    fn summaries(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, email, visits, rewards, last_visit_date FROM identities ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    RawVisit::from_row(row, 3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, email, raw)| {
                let visit = raw.decode(id)?;
                Ok(IdentitySummary {
                    id: IdentityId(id),
                    name,
                    email,
                    visits: visit.visits,
                    rewards: visit.rewards,
                    last_visit: visit.last_visit,
                })
            })
            .collect()
    }

    fn fetch(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT name, email, embedding, visits, rewards, last_visit_date
                 FROM identities WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        RawVisit::from_row(row, 3)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, email, blob, raw)) = row else {
            return Ok(None);
        };
        let visit = raw.decode(id.0)?;
        Ok(Some(Identity {
            id,
            name,
            email,
            embedding: decode_embedding(id.0, &blob)?,
            visits: visit.visits,
            rewards: visit.rewards,
            last_visit: visit.last_visit,
        }))
    }

    fn save_visit_state(&self, id: IdentityId, state: &VisitState) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let rewards = i64::try_from(state.rewards).map_err(|_| StoreError::Corrupt {
            id: id.0,
            reason: format!("rewards out of range: {}", state.rewards),
        })?;
        let changed = conn.execute(
            "UPDATE identities SET visits = ?1, rewards = ?2, last_visit_date = ?3 WHERE id = ?4",
            params![
                i64::from(state.visits),
                rewards,
                state.last_visit.map(|d| d.format(DATE_FORMAT).to_string()),
                id.0
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_by_name(&self, name: &str) -> Result<Vec<IdentityId>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stmt = tx.prepare("SELECT id FROM identities WHERE name = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![name], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        tx.execute("DELETE FROM identities WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(ids.into_iter().map(IdentityId).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str, values: &[f32]) -> IdentityDraft {
        IdentityDraft {
            name: name.into(),
            email: format!("{name}@example.com"),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    #[test]
    fn test_insert_and_fetch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(&draft("ada", &[0.5, -0.25])).unwrap();

        let identity = store.fetch(id).unwrap().unwrap();
        assert_eq!(identity.name, "ada");
        assert_eq!(identity.email, "ada@example.com");
        assert_eq!(identity.embedding.values(), &[0.5, -0.25]);
        assert_eq!(identity.visits, 0);
        assert_eq!(identity.rewards, 0);
        assert!(identity.last_visit.is_none());
    }

    #[test]
    fn test_fetch_missing_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.fetch(IdentityId(42)).unwrap().is_none());
    }

    #[test]
    fn test_visit_state_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(&draft("bo", &[1.0])).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();

        let saved = store
            .save_visit_state(
                id,
                &VisitState {
                    visits: 2,
                    rewards: 30,
                    last_visit: Some(date),
                },
            )
            .unwrap();
        assert!(saved);

        let summary = &store.summaries().unwrap()[0];
        assert_eq!(summary.visits, 2);
        assert_eq!(summary.rewards, 30);
        assert_eq!(summary.last_visit, Some(date));
    }

    #[test]
    fn test_save_visit_state_for_missing_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.save_visit_state(IdentityId(3), &VisitState::default()).unwrap());
    }

    #[test]
    fn test_delete_by_name_removes_all_namesakes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert(&draft("sam", &[1.0])).unwrap();
        let keep = store.insert(&draft("kim", &[2.0])).unwrap();
        let b = store.insert(&draft("sam", &[3.0])).unwrap();

        assert_eq!(store.delete_by_name("sam").unwrap(), vec![a, b]);
        assert!(store.delete_by_name("sam").unwrap().is_empty());

        let remaining: Vec<_> = store.embeddings().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![keep]);
    }

    #[test]
    fn test_migrates_database_without_last_visit_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE identities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    visits INTEGER NOT NULL DEFAULT 0,
                    rewards INTEGER NOT NULL DEFAULT 0
                );",
            )
            .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let id = store.insert(&draft("lee", &[1.0])).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        store
            .save_visit_state(
                id,
                &VisitState {
                    visits: 1,
                    rewards: 20,
                    last_visit: Some(today),
                },
            )
            .unwrap();
        assert_eq!(store.fetch(id).unwrap().unwrap().last_visit, Some(today));
    }

    #[test]
    fn test_corrupt_embedding_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO identities (name, email, embedding) VALUES ('x', 'x', X'010203')",
                [],
            )
            .unwrap();
        assert!(matches!(store.embeddings(), Err(StoreError::Corrupt { .. })));
    }
}
