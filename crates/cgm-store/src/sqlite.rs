//! `SQLite` persistence backend.
//!
//! # Schema
//!
//! One row per artifact in `artifacts`. Timestamps are stored as TEXT in
//! RFC 3339 with millisecond precision and a `Z` suffix, so lexicographic
//! order matches chronological order. `payload` holds the same JSON array the
//! directory backend writes to disk.
//!
//! Re-persisting an artifact name replaces its row.

use std::path::Path;

use cgm_core::persist::{ArtifactNaming, prepare};
use cgm_core::record::UnknownRecordKind;
use cgm_core::{
    Artifact, BatchPersister, Diagnostic, PersistenceError, RecordKind, SharedSink,
    TimestampedRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

/// Store errors outside of the persist path.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid timestamp for artifact {name}: {timestamp}")]
    TimestampParse {
        name: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid record kind for artifact {name}")]
    Kind {
        name: String,
        #[source]
        source: UnknownRecordKind,
    },
    #[error("invalid payload for artifact {name}")]
    Payload {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Persists artifacts as rows of a `SQLite` database.
///
/// Wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
pub struct SqlitePersister {
    conn: Connection,
    /// Where the database lives, for diagnostics.
    location: String,
    naming: ArtifactNaming,
    sink: Option<SharedSink>,
}

impl SqlitePersister {
    /// Opens a database at the given path, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.display().to_string())
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, location: String) -> Result<Self, StoreError> {
        let store = Self {
            conn,
            location,
            naming: ArtifactNaming::default(),
            sink: None,
        };
        store.init()?;
        Ok(store)
    }

    #[must_use]
    pub fn with_naming(mut self, naming: ArtifactNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Reports each stored row to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Initializes the schema. Idempotent.
    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS artifacts (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                first_timestamp TEXT NOT NULL,
                last_timestamp TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_kind_first ON artifacts(kind, first_timestamp);
            ",
        )?;
        Ok(())
    }

    /// Lists stored artifacts ordered by kind then first timestamp.
    pub fn list_artifacts(&self) -> Result<Vec<Artifact>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT name, kind, first_timestamp, last_timestamp, record_count
            FROM artifacts
            ORDER BY kind ASC, first_timestamp ASC, name ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut artifacts = Vec::new();
        for row in rows {
            let (name, kind, first, last, count) = row?;
            let kind = kind.parse::<RecordKind>().map_err(|source| StoreError::Kind {
                name: name.clone(),
                source,
            })?;
            artifacts.push(Artifact {
                kind,
                first: parse_timestamp(&first, &name)?,
                last: parse_timestamp(&last, &name)?,
                records: usize::try_from(count).unwrap_or_default(),
                name,
            });
        }
        Ok(artifacts)
    }

    /// The stored records of artifact `name`, if present.
    pub fn load_payload(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM artifacts WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| {
                serde_json::from_str(&payload).map_err(|source| StoreError::Payload {
                    name: name.to_string(),
                    source,
                })
            })
            .transpose()
    }
}

impl BatchPersister for SqlitePersister {
    fn persist<R: TimestampedRecord>(
        &self,
        batches: &[Vec<R>],
    ) -> Result<Artifact, PersistenceError> {
        let prepared = prepare(batches, &self.naming)?;
        let payload = serde_json::to_string(&prepared.records)?;
        let bytes = payload.len();
        let artifact = prepared.artifact;

        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        tx.execute(
            "
            INSERT OR REPLACE INTO artifacts
            (name, kind, first_timestamp, last_timestamp, record_count, payload)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                artifact.name,
                artifact.kind.as_str(),
                format_timestamp(artifact.first),
                format_timestamp(artifact.last),
                i64::try_from(artifact.records).unwrap_or(i64::MAX),
                payload,
            ],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;

        if let Some(sink) = &self.sink {
            sink.report(&Diagnostic::ArtifactStored {
                name: &artifact.name,
                location: &self.location,
                bytes,
            });
        }
        Ok(artifact)
    }
}

fn backend(source: rusqlite::Error) -> PersistenceError {
    PersistenceError::Backend {
        message: format!("sqlite error: {source}"),
        source: Box::new(source),
    }
}

fn parse_timestamp(timestamp: &str, name: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse {
            name: name.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
