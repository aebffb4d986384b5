//! Windowed batching of a single record stream.
//!
//! A [`WindowedBatcher`] accumulates records of one kind into a fixed-duration
//! window and flushes the window to a [`BatchPersister`] as soon as a record
//! falls past its end, or when the stream is closed. Records keep their
//! arrival order; nothing is sorted.
//!
//! # States
//!
//! - `Empty`: no open window.
//! - `Open`: a window with a fixed start and at least one buffered record.
//! - `Closed`: terminal, writes are rejected.
//!
//! A failed flush leaves the stream `Open` with its buffer untouched, so the
//! same flush can be retried by calling [`WindowedBatcher::close`] again or by
//! repeating the [`WindowedBatcher::write`] that triggered it. Callers that do
//! not retry use [`WindowedBatcher::write_or_drop`], which gives up on the
//! failed window and carries on with the next one.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diagnostics::{Diagnostic, SharedSink};
use crate::persist::{Artifact, BatchPersister, PersistenceError};
use crate::record::{RecordKind, TimestampedRecord};

/// Default window length.
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// Where a new window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlignment {
    /// At the instant of the window's first record.
    #[default]
    FirstRecord,
    /// At midnight of the first record's local calendar day.
    StartOfDay,
}

/// Rejected window configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("window duration must be at least one day, got {0}")]
pub struct InvalidWindow(u32);

/// Window length and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    duration: Duration,
    alignment: WindowAlignment,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration: Duration::days(i64::from(DEFAULT_WINDOW_DAYS)),
            alignment: WindowAlignment::FirstRecord,
        }
    }
}

impl WindowConfig {
    pub fn days(days: u32) -> Result<Self, InvalidWindow> {
        if days == 0 {
            return Err(InvalidWindow(days));
        }
        Ok(Self {
            duration: Duration::days(i64::from(days)),
            ..Self::default()
        })
    }

    #[must_use]
    pub const fn with_alignment(mut self, alignment: WindowAlignment) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Empty,
    Open,
    Closed,
}

/// Errors from writing to or closing a stream.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The stream was already closed.
    #[error("{kind} stream is closed")]
    Closed { kind: RecordKind },
    /// The window could not be flushed; its records are still buffered.
    #[error("failed to flush {kind} window")]
    Persistence {
        kind: RecordKind,
        #[source]
        source: PersistenceError,
    },
}

/// A window given up after its flush failed.
#[derive(Debug)]
pub struct DroppedWindow {
    pub error: BatchError,
    /// Buffered records that were never persisted.
    pub records: usize,
}

/// Groups a stream of `R` into time windows flushed through `P`.
pub struct WindowedBatcher<'p, R, P> {
    persister: &'p P,
    config: WindowConfig,
    sink: SharedSink,
    state: StreamState,
    window_start: Option<DateTime<Utc>>,
    /// Buffered records, already split into runs sharing a local calendar day.
    days: Vec<Vec<R>>,
    flushed: Vec<Artifact>,
}

impl<'p, R: TimestampedRecord, P: BatchPersister> WindowedBatcher<'p, R, P> {
    pub fn new(persister: &'p P, config: WindowConfig, sink: SharedSink) -> Self {
        Self {
            persister,
            config,
            sink,
            state: StreamState::Empty,
            window_start: None,
            days: Vec::new(),
            flushed: Vec::new(),
        }
    }

    pub const fn kind(&self) -> RecordKind {
        R::KIND
    }

    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Start of the open window.
    pub const fn window_start(&self) -> Option<DateTime<Utc>> {
        self.window_start
    }

    /// Number of records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.days.iter().map(Vec::len).sum()
    }

    /// Artifacts this stream has written so far.
    pub fn flushed(&self) -> &[Artifact] {
        &self.flushed
    }

    /// Adds `record` to the open window, flushing first if it lies past the window end.
    ///
    /// When that flush fails the record is not buffered.
    pub fn write(&mut self, record: R) -> Result<(), BatchError> {
        match self.state {
            StreamState::Closed => Err(BatchError::Closed { kind: R::KIND }),
            StreamState::Empty => {
                self.open(record);
                Ok(())
            }
            StreamState::Open => {
                if self.in_window(&record) {
                    self.push(record);
                } else {
                    self.flush()?;
                    self.open(record);
                }
                Ok(())
            }
        }
    }

    /// Like [`write`](Self::write), but a failed flush drops the window.
    ///
    /// The flush is attempted once. On failure the buffered records are
    /// dropped and `record` opens the next window.
    pub fn write_or_drop(&mut self, record: R) -> Result<(), DroppedWindow> {
        if self.state != StreamState::Open || self.in_window(&record) {
            return self.write(record).map_err(|error| DroppedWindow { error, records: 0 });
        }
        match self.flush() {
            Ok(()) => {
                self.open(record);
                Ok(())
            }
            Err(error) => {
                let records = self.drop_buffer();
                self.open(record);
                Err(DroppedWindow { error, records })
            }
        }
    }

    /// Flushes any buffered records and closes the stream.
    ///
    /// Closing a closed stream succeeds without I/O.
    pub fn close(&mut self) -> Result<(), BatchError> {
        match self.state {
            StreamState::Closed => Ok(()),
            StreamState::Empty => {
                self.state = StreamState::Closed;
                Ok(())
            }
            StreamState::Open => {
                self.flush()?;
                self.state = StreamState::Closed;
                Ok(())
            }
        }
    }

    /// Drops buffered records without writing them and closes the stream.
    ///
    /// Returns how many records were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.drop_buffer();
        self.state = StreamState::Closed;
        dropped
    }

    fn drop_buffer(&mut self) -> usize {
        let dropped = self.buffered();
        self.days.clear();
        self.window_start = None;
        self.state = StreamState::Empty;
        dropped
    }

    /// Whether `record` falls before the end of the open window.
    ///
    /// A window whose end is past the last representable instant never ends.
    fn in_window(&self, record: &R) -> bool {
        let instant = record.time().instant();
        self.window_start.is_some_and(|start| {
            start
                .checked_add_signed(self.config.duration)
                .is_none_or(|end| instant < end)
        })
    }

    fn open(&mut self, record: R) {
        let time = record.time();
        let start = match self.config.alignment {
            WindowAlignment::FirstRecord => time.instant(),
            WindowAlignment::StartOfDay => {
                let midnight = time.local_date().and_time(NaiveTime::MIN);
                let offset = i64::from(time.local().offset().local_minus_utc());
                midnight
                    .checked_sub_signed(Duration::seconds(offset))
                    .map_or_else(|| time.instant(), |start| start.and_utc())
            }
        };
        self.window_start = Some(start);
        self.state = StreamState::Open;
        self.push(record);
    }

    fn push(&mut self, record: R) {
        let date = record.time().local_date();
        match self.days.last_mut() {
            Some(day) if day.last().is_some_and(|r| r.time().local_date() == date) => {
                day.push(record);
            }
            _ => self.days.push(vec![record]),
        }
    }

    fn flush(&mut self) -> Result<(), BatchError> {
        if self.days.is_empty() {
            return Ok(());
        }
        match self.persister.persist(&self.days) {
            Ok(artifact) => {
                self.sink
                    .report(&Diagnostic::ArtifactWritten { artifact: &artifact });
                self.flushed.push(artifact);
                self.days.clear();
                self.window_start = None;
                self.state = StreamState::Empty;
                Ok(())
            }
            Err(source) => {
                self.sink.report(&Diagnostic::FlushFailed {
                    kind: R::KIND,
                    error: &source,
                });
                Err(BatchError::Persistence {
                    kind: R::KIND,
                    source,
                })
            }
        }
    }
}
