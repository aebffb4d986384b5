//! Diagnostic sink threaded through a conversion run.
//!
//! Components never log through a global. They receive a [`DiagnosticSink`]
//! and report what they skipped, adjusted, or wrote.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
#[cfg(any(test, feature = "testing"))]
use std::sync::Mutex;

use crate::record::format_location;
use crate::{Artifact, RecordKind};

/// Something worth telling the operator about.
pub enum Diagnostic<'a> {
    /// An input file was not decoded.
    FileSkipped {
        path: &'a Path,
        reason: &'a dyn fmt::Display,
    },
    /// An input file was decoded.
    FileDecoded {
        path: &'a Path,
        device: &'a str,
        events: usize,
    },
    /// A decoded event was dropped because it could not be reconciled or classified.
    EventSkipped {
        path: &'a Path,
        index: usize,
        reason: &'a dyn fmt::Display,
    },
    /// A decoded event had a sub-type no record kind covers.
    EventIgnored { path: &'a Path, event_type: &'a str },
    /// The device offset was rounded by more than a minute.
    OffsetRounded {
        raw_seconds: i64,
        applied: chrono::FixedOffset,
    },
    /// A batch artifact was persisted.
    ArtifactWritten { artifact: &'a Artifact },
    /// A backend stored an artifact's bytes.
    ArtifactStored {
        name: &'a str,
        location: &'a dyn fmt::Display,
        bytes: usize,
    },
    /// A flush failed; the stream keeps its buffer.
    FlushFailed {
        kind: RecordKind,
        error: &'a dyn fmt::Display,
    },
    /// A window was given up after its flush failed.
    WindowDropped { kind: RecordKind, records: usize },
}

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileSkipped { path, reason } => {
                write!(f, "skipped file {}: {reason}", path.display())
            }
            Self::FileDecoded {
                path,
                device,
                events,
            } => write!(
                f,
                "decoded {events} events from {} (device {device})",
                path.display()
            ),
            Self::EventSkipped {
                path,
                index,
                reason,
            } => write!(f, "skipped event {index} in {}: {reason}", path.display()),
            Self::EventIgnored { path, event_type } => {
                write!(f, "ignored {event_type} event in {}", path.display())
            }
            Self::OffsetRounded {
                raw_seconds,
                applied,
            } => write!(
                f,
                "rounded device offset {raw_seconds}s to {}",
                format_location(*applied)
            ),
            Self::ArtifactWritten { artifact } => write!(
                f,
                "wrote {} {} records to {}",
                artifact.records, artifact.kind, artifact.name
            ),
            Self::ArtifactStored {
                name,
                location,
                bytes,
            } => write!(f, "stored {name} in {location} ({bytes} bytes)"),
            Self::FlushFailed { kind, error } => write!(f, "flush of {kind} failed: {error}"),
            Self::WindowDropped { kind, records } => {
                write!(f, "dropped {records} unpersisted {kind} records")
            }
        }
    }
}

/// Receives diagnostics from a conversion run.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic<'_>);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: &Diagnostic<'_>) {
        match diagnostic {
            Diagnostic::FileSkipped { path, reason } => {
                tracing::warn!(path = ?path, reason = %reason, "skipping input file");
            }
            Diagnostic::FileDecoded {
                path,
                device,
                events,
            } => tracing::debug!(path = ?path, device, events, "decoded input file"),
            Diagnostic::EventSkipped {
                path,
                index,
                reason,
            } => tracing::warn!(path = ?path, index, reason = %reason, "skipping event"),
            Diagnostic::EventIgnored { path, event_type } => {
                tracing::debug!(path = ?path, event_type, "ignoring unsupported event type");
            }
            Diagnostic::OffsetRounded {
                raw_seconds,
                applied,
            } => tracing::debug!(
                raw_seconds,
                applied = %format_location(*applied),
                "rounded device clock offset"
            ),
            Diagnostic::ArtifactWritten { artifact } => tracing::info!(
                kind = %artifact.kind,
                name = %artifact.name,
                records = artifact.records,
                "persisted batch"
            ),
            Diagnostic::ArtifactStored {
                name,
                location,
                bytes,
            } => tracing::debug!(name, location = %location, bytes, "stored artifact"),
            Diagnostic::FlushFailed { kind, error } => {
                tracing::error!(kind = %kind, error = %error, "flush failed");
            }
            Diagnostic::WindowDropped { kind, records } => {
                tracing::error!(kind = %kind, records, "dropped unpersisted window");
            }
        }
    }
}

/// Keeps rendered diagnostics in memory.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "testing"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered diagnostics in the order they were reported.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "testing"))]
impl DiagnosticSink for MemorySink {
    fn report(&self, diagnostic: &Diagnostic<'_>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(diagnostic.to_string());
        }
    }
}
