//! Core conversion logic for CGM device exports.
//!
//! This crate contains:
//! - Record model: glucose reads, calibrations, injections, meals, exercises
//! - Clock reconciliation: device display/internal clocks to an absolute instant
//! - Windowed batching: per-kind streams flushed in fixed-duration windows
//! - The persister contract and artifact naming
//! - The conversion driver tying a decoder to a persister

pub mod batch;
pub mod classify;
pub mod clock;
pub mod diagnostics;
pub mod ingest;
pub mod persist;
pub mod record;

pub use batch::{
    BatchError, DEFAULT_WINDOW_DAYS, DroppedWindow, InvalidWindow, StreamState, WindowAlignment,
    WindowConfig, WindowedBatcher,
};
pub use classify::{Classified, ClassifyError, RawEvent, RawFields, SourceKind, classify};
pub use clock::{
    ClockError, ClockField, ClockReconciler, ClockSettings, DEFAULT_DEVICE_TIME_FORMAT,
    InvalidOffsetPolicy, OffsetPolicy,
};
#[cfg(any(test, feature = "testing"))]
pub use diagnostics::MemorySink;
pub use diagnostics::{Diagnostic, DiagnosticSink, SharedSink, TracingSink};
pub use ingest::{
    ConvertOptions, ConvertReport, Converter, DecodeError, DecodedFile, EventDecoder, IngestError,
};
pub use persist::{
    Artifact, ArtifactNaming, BatchPersister, DEFAULT_FILENAME_TIME_FORMAT, InvalidTimeFormat,
    PersistenceError, PreparedBatch, prepare,
};
pub use record::{
    CalibrationRead, Exercise, GlucoseRead, GlucoseUnit, Injection, Meal, Record, RecordKind,
    ReconciledTime, TimestampedRecord, UnknownRecordKind,
};
