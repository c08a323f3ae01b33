//! SQLite persistence for secret records and the wrapped key ring.
//!
//! [`SqliteBackend`] implements the core storage ports over an r2d2
//! connection pool. Every operation runs on the blocking thread pool via
//! `tokio::task::spawn_blocking`, keeping rusqlite's synchronous API out
//! of the async executor.
//!
//! Two tables:
//!
//! - `secrets` — one row per [`SecretRecord`]: the envelope JSON verbatim,
//!   tags JSON, TTL and RFC 3339 timestamps. Values are only ever stored
//!   encrypted; this crate never sees plaintext.
//! - `data_keys` — the wrapped key ring. Each row's material is encrypted
//!   under the master key before it reaches this crate.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::info;
use vaultic_common::KmsResult;
use vaultic_core::{Envelope, KeyRingBackend, SecretBackend, SecretRecord, WrappedDataKey};

use crate::errors::{map_join_error, StorageError};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS secrets (
    name        TEXT PRIMARY KEY,
    envelope    TEXT NOT NULL,
    tags        TEXT NOT NULL,
    ttl_days    INTEGER,
    created_at  TEXT NOT NULL,
    expires_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_secrets_expires_at ON secrets(expires_at);

CREATE TABLE IF NOT EXISTS data_keys (
    id          TEXT PRIMARY KEY,
    active      INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    wrapped     TEXT NOT NULL
);
";

type SqlitePool = Pool<SqliteConnectionManager>;
type SqliteConn = PooledConnection<SqliteConnectionManager>;

/// SQLite-backed implementation of the core storage ports.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and ensure the schema
    /// exists.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> KmsResult<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            // journal_mode returns a row, so execute_batch cannot set it.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| StorageError::from(e).into_kms("open"))?;

        let backend = Self { pool };
        backend.run_migrations()?;

        info!(
            db_path = %path.display(),
            max_connections = pool_size.max(1),
            "sqlite secret backend initialised"
        );
        Ok(backend)
    }

    fn run_migrations(&self) -> KmsResult<()> {
        let conn = self.connection().map_err(|e| e.into_kms("migrate"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StorageError::from(e).into_kms("migrate"))
    }

    fn connection(&self) -> Result<SqliteConn, StorageError> {
        Ok(self.pool.get()?)
    }
}

#[async_trait]
impl SecretBackend for SqliteBackend {
    async fn put(&self, record: SecretRecord) -> KmsResult<()> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || -> KmsResult<()> {
            let run = || -> Result<(), StorageError> {
                let conn = pool.get()?;
                let (envelope, tags, created_at, expires_at) = encode_record(&record)?;
                conn.execute(
                    "INSERT OR REPLACE INTO secrets (name, envelope, tags, ttl_days, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![record.name, envelope, tags, record.ttl_days, created_at, expires_at],
                )?;
                Ok(())
            };
            run().map_err(|e| e.into_kms("put"))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn replace(&self, record: SecretRecord) -> KmsResult<bool> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || -> KmsResult<bool> {
            let run = || -> Result<bool, StorageError> {
                let conn = pool.get()?;
                let (envelope, tags, created_at, expires_at) = encode_record(&record)?;
                let changed = conn.execute(
                    "UPDATE secrets
                     SET envelope = ?2, tags = ?3, ttl_days = ?4, created_at = ?5, expires_at = ?6
                     WHERE name = ?1",
                    params![record.name, envelope, tags, record.ttl_days, created_at, expires_at],
                )?;
                Ok(changed > 0)
            };
            run().map_err(|e| e.into_kms("replace"))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn fetch(&self, name: &str) -> KmsResult<Option<SecretRecord>> {
        let pool = self.pool.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || -> KmsResult<Option<SecretRecord>> {
            let run = || -> Result<Option<SecretRecord>, StorageError> {
                let conn = pool.get()?;
                let row = conn
                    .query_row(
                        "SELECT name, envelope, tags, ttl_days, created_at, expires_at
                         FROM secrets WHERE name = ?1",
                        params![name],
                        map_secret_row,
                    )
                    .optional()?;
                row.map(decode_record).transpose()
            };
            run().map_err(|e| e.into_kms("fetch"))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn remove(&self, name: &str) -> KmsResult<bool> {
        let pool = self.pool.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || -> KmsResult<bool> {
            let run = || -> Result<bool, StorageError> {
                let conn = pool.get()?;
                let changed = conn.execute("DELETE FROM secrets WHERE name = ?1", params![name])?;
                Ok(changed > 0)
            };
            run().map_err(|e| e.into_kms("remove"))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list(&self) -> KmsResult<Vec<SecretRecord>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || -> KmsResult<Vec<SecretRecord>> {
            let run = || -> Result<Vec<SecretRecord>, StorageError> {
                let conn = pool.get()?;
                let mut stmt = conn.prepare(
                    "SELECT name, envelope, tags, ttl_days, created_at, expires_at FROM secrets",
                )?;
                let rows = stmt.query_map([], map_secret_row)?;

                let mut records = Vec::new();
                for row in rows {
                    records.push(decode_record(row?)?);
                }
                Ok(records)
            };
            run().map_err(|e| e.into_kms("list"))
        })
        .await
        .map_err(map_join_error)?
    }
}

#[async_trait]
impl KeyRingBackend for SqliteBackend {
    async fn load_keyring(&self) -> KmsResult<Vec<WrappedDataKey>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || -> KmsResult<Vec<WrappedDataKey>> {
            let run = || -> Result<Vec<WrappedDataKey>, StorageError> {
                let conn = pool.get()?;
                let mut stmt =
                    conn.prepare("SELECT wrapped FROM data_keys ORDER BY created_at")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

                let mut keys = Vec::new();
                for row in rows {
                    keys.push(serde_json::from_str(&row?)?);
                }
                Ok(keys)
            };
            run().map_err(|e| e.into_kms("load_keyring"))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn store_keyring(&self, keys: &[WrappedDataKey]) -> KmsResult<()> {
        let pool = self.pool.clone();
        let keys = keys.to_vec();

        tokio::task::spawn_blocking(move || -> KmsResult<()> {
            let run = || -> Result<(), StorageError> {
                let mut conn = pool.get()?;
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM data_keys", [])?;
                for key in &keys {
                    tx.execute(
                        "INSERT INTO data_keys (id, active, created_at, wrapped)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            key.id,
                            key.active,
                            key.created_at.to_rfc3339(),
                            serde_json::to_string(key)?
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            };
            run().map_err(|e| e.into_kms("store_keyring"))
        })
        .await
        .map_err(map_join_error)?
    }
}

type RawSecretRow = (String, String, String, Option<i64>, String, Option<String>);

fn map_secret_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSecretRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn encode_record(
    record: &SecretRecord,
) -> Result<(String, String, String, Option<String>), StorageError> {
    Ok((
        serde_json::to_string(&record.envelope)?,
        serde_json::to_string(&record.tags)?,
        record.created_at.to_rfc3339(),
        record.expires_at.map(|ts| ts.to_rfc3339()),
    ))
}

fn decode_record(raw: RawSecretRow) -> Result<SecretRecord, StorageError> {
    let (name, envelope, tags, ttl_days, created_at, expires_at) = raw;
    Ok(SecretRecord {
        name,
        envelope: serde_json::from_str::<Envelope>(&envelope)?,
        tags: serde_json::from_str(&tags)?,
        ttl_days,
        created_at: parse_timestamp(&created_at)?,
        expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StorageError::Timestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    //! Unit tests for the sqlite backend.
    use std::collections::HashMap;

    use vaultic_core::{EnvelopeCipher, KeyManager, MasterKey};

    use super::*;

    fn open_backend(dir: &tempfile::TempDir) -> SqliteBackend {
        SqliteBackend::open(dir.path().join("vaultic.db"), 4).unwrap()
    }

    fn make_raw(name: &str) -> SecretRecord {
        let keys = KeyManager::new(MasterKey::generate());
        let envelope =
            EnvelopeCipher::encrypt(b"payload", &keys.active_key(), Some(name.as_bytes())).unwrap();
        SecretRecord {
            name: name.to_string(),
            envelope,
            tags: HashMap::from([("env".to_string(), "test".to_string())]),
            ttl_days: Some(30),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::days(30)),
        }
    }

    /// Validates put/fetch round-trip fidelity through SQL storage.
    ///
    /// Assertions:
    /// - Confirms the fetched record equals the stored one field by
    ///   field, envelope included.
    #[tokio::test]
    async fn put_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(&dir);

        let record = make_raw("DB_PASSWORD");
        backend.put(record.clone()).await.unwrap();

        let fetched = backend.fetch("DB_PASSWORD").await.unwrap().unwrap();
        assert_eq!(fetched.name, record.name);
        assert_eq!(fetched.envelope, record.envelope);
        assert_eq!(fetched.tags, record.tags);
        assert_eq!(fetched.ttl_days, record.ttl_days);
        assert_eq!(fetched.created_at.timestamp_millis(), record.created_at.timestamp_millis());
    }

    /// Validates `fetch` behavior for the missing row scenario.
    ///
    /// Assertions:
    /// - Ensures `None` is returned, not an error.
    #[tokio::test]
    async fn fetch_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(&dir);
        assert!(backend.fetch("NOPE").await.unwrap().is_none());
    }

    /// Validates `replace` only touches existing rows.
    ///
    /// Assertions:
    /// - Ensures replacing a missing name reports `false`.
    /// - Confirms replacing an existing name reports `true` and persists.
    #[tokio::test]
    async fn replace_requires_existing_row() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(&dir);

        let record = make_raw("ROTATE_ME");
        assert!(!backend.replace(record.clone()).await.unwrap());

        backend.put(record).await.unwrap();
        let updated = make_raw("ROTATE_ME");
        assert!(backend.replace(updated.clone()).await.unwrap());

        let fetched = backend.fetch("ROTATE_ME").await.unwrap().unwrap();
        assert_eq!(fetched.envelope, updated.envelope);
    }

    /// Validates `remove` and `list` behavior.
    ///
    /// Assertions:
    /// - Confirms listed rows reflect puts and removals.
    #[tokio::test]
    async fn remove_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(&dir);

        backend.put(make_raw("A")).await.unwrap();
        backend.put(make_raw("B")).await.unwrap();
        assert_eq!(backend.list().await.unwrap().len(), 2);

        assert!(backend.remove("A").await.unwrap());
        assert!(!backend.remove("A").await.unwrap());
        assert_eq!(backend.list().await.unwrap().len(), 1);
    }

    /// Validates wrapped key-ring persistence round-trip.
    ///
    /// Assertions:
    /// - Confirms the stored ring loads back identically ordered with the
    ///   active flag intact.
    #[tokio::test]
    async fn keyring_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(&dir);

        let manager = KeyManager::new(MasterKey::generate());
        manager.rotate_data_key();
        let wrapped = manager.export_wrapped().unwrap();

        backend.store_keyring(&wrapped).await.unwrap();
        let loaded = backend.load_keyring().await.unwrap();

        assert_eq!(loaded.len(), wrapped.len());
        assert_eq!(
            loaded.iter().map(|k| k.id.clone()).collect::<Vec<_>>(),
            wrapped.iter().map(|k| k.id.clone()).collect::<Vec<_>>()
        );
        assert_eq!(loaded.iter().filter(|k| k.active).count(), 1);

        // Re-storing replaces rather than appends.
        backend.store_keyring(&wrapped).await.unwrap();
        assert_eq!(backend.load_keyring().await.unwrap().len(), wrapped.len());
    }
}
