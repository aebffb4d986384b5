//! The contract every persistence backend satisfies.
//!
//! A flush hands a persister one or more day-batches of a single record kind.
//! The batches are concatenated in the order given (never re-sorted) into one
//! flat sequence and written as a single artifact. Artifact names derive only
//! from the records, so identical input always yields identical names.

use std::path::PathBuf;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::record::{RecordKind, TimestampedRecord};

/// Default timestamp format in artifact names, rendered in UTC.
pub const DEFAULT_FILENAME_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Failures writing a batch. The caller keeps its buffer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cannot persist an empty batch")]
    EmptyBatch,
    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize records")]
    Serialize(#[from] serde_json::Error),
    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Handle to a persisted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub kind: RecordKind,
    pub name: String,
    pub records: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

/// Rejected artifact name timestamp format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid timestamp format {0:?} for artifact names")]
pub struct InvalidTimeFormat(String);

/// How artifact names are rendered.
///
/// The timestamp format is checked on construction, so rendering a name
/// cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNaming {
    time_format: String,
    extension: String,
}

impl Default for ArtifactNaming {
    fn default() -> Self {
        Self {
            time_format: DEFAULT_FILENAME_TIME_FORMAT.to_string(),
            extension: "json".to_string(),
        }
    }
}

impl ArtifactNaming {
    /// Naming with a custom strftime `time_format` and the default extension.
    pub fn with_time_format(time_format: &str) -> Result<Self, InvalidTimeFormat> {
        let invalid = time_format.is_empty()
            || StrftimeItems::new(time_format).any(|item| matches!(item, Item::Error));
        if invalid {
            return Err(InvalidTimeFormat(time_format.to_string()));
        }
        Ok(Self {
            time_format: time_format.to_string(),
            ..Self::default()
        })
    }

    /// `<prefix>-<first>.<ext>`, or `<prefix>-<first>_<last>.<ext>` for a range.
    pub fn name(
        &self,
        kind: RecordKind,
        first: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
    ) -> String {
        let start = first.format(&self.time_format);
        match last {
            Some(last) => format!(
                "{}-{start}_{}.{}",
                kind.artifact_prefix(),
                last.format(&self.time_format),
                self.extension
            ),
            None => format!("{}-{start}.{}", kind.artifact_prefix(), self.extension),
        }
    }
}

/// Writes day-batches of one record kind as a single artifact.
pub trait BatchPersister {
    fn persist<R: TimestampedRecord>(
        &self,
        batches: &[Vec<R>],
    ) -> Result<Artifact, PersistenceError>;
}

/// Batches merged and named, ready for a backend to store.
#[derive(Debug)]
pub struct PreparedBatch<'a, R> {
    pub artifact: Artifact,
    pub records: Vec<&'a R>,
}

impl<R: TimestampedRecord> PreparedBatch<'_, R> {
    /// The merged records as a JSON array.
    pub fn to_json(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(&self.records)?)
    }
}

/// Concatenates batches in the order given.
pub fn merge_batches<R>(batches: &[Vec<R>]) -> Vec<&R> {
    batches.iter().flatten().collect()
}

/// Validates, merges, and names `batches`.
///
/// A single batch is named from its first record, several from the first
/// record of the first batch and the last record of the last batch.
pub fn prepare<'a, R: TimestampedRecord>(
    batches: &'a [Vec<R>],
    naming: &ArtifactNaming,
) -> Result<PreparedBatch<'a, R>, PersistenceError> {
    if batches.is_empty() || batches.iter().any(Vec::is_empty) {
        return Err(PersistenceError::EmptyBatch);
    }
    let records = merge_batches(batches);
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return Err(PersistenceError::EmptyBatch);
    };
    let first = first.time().instant();
    let last = last.time().instant();
    let name = naming.name(R::KIND, first, (batches.len() > 1).then_some(last));
    Ok(PreparedBatch {
        artifact: Artifact {
            kind: R::KIND,
            name,
            records: records.len(),
            first,
            last,
        },
        records,
    })
}
