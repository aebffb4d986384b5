//! Conversion driver: directory in, batch artifacts out.
//!
//! Input files are ordered by modification time, oldest first, as a proxy for
//! the order the device exported them. Each file is decoded by an
//! [`EventDecoder`], every event is reconciled and classified, and the
//! resulting record is routed to the batcher of its kind. All batchers are
//! closed at the end of input and their failures are reported together.
//!
//! Every window gets exactly one flush attempt. A window whose flush fails is
//! dropped and counted in [`ConvertReport::records_dropped`]; the record that
//! triggered the flush opens the next window and ingestion carries on.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::batch::{BatchError, DroppedWindow, WindowConfig, WindowedBatcher};
use crate::classify::{Classified, RawEvent, SourceKind, classify};
use crate::clock::{ClockReconciler, ClockSettings};
use crate::diagnostics::{Diagnostic, SharedSink};
use crate::persist::{Artifact, BatchPersister};
use crate::record::{
    CalibrationRead, Exercise, GlucoseRead, Injection, Meal, Record, RecordKind, TimestampedRecord,
};

/// Events decoded from one export file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFile {
    /// Identifier of the exporting device.
    pub device: String,
    pub events: Vec<RawEvent>,
}

/// A file that could not be decoded. The file is skipped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed export {}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Turns a device export file into raw events.
pub trait EventDecoder: Sync {
    /// Whether this decoder understands `path`.
    fn accepts(&self, path: &Path) -> bool;

    fn decode(&self, path: &Path) -> Result<DecodedFile, DecodeError>;
}

/// Run-level failures.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot read input directory {}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// One or more streams failed to flush. `report` covers what was written.
    #[error("{} record stream(s) failed to flush", failures.len())]
    Flush {
        failures: Vec<BatchError>,
        report: Box<ConvertReport>,
    },
}

/// Knobs for one conversion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    pub window: WindowConfig,
    pub clock: ClockSettings,
    /// Record kinds to convert. `None` converts every kind.
    pub kinds: Option<Vec<RecordKind>>,
}

impl ConvertOptions {
    /// Whether records of `kind` are converted.
    pub fn converts(&self, kind: RecordKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Summary of a conversion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvertReport {
    pub files_read: usize,
    pub files_skipped: usize,
    pub events_read: usize,
    pub events_skipped: usize,
    pub events_ignored: usize,
    /// Records lost to windows whose flush failed.
    pub records_dropped: usize,
    pub artifacts: Vec<Artifact>,
}

/// Regular files in `dir`, oldest modification first, ties by name.
pub fn list_input_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((modified, entry.file_name(), entry.path()));
    }
    files.sort();
    Ok(files.into_iter().map(|(_, _, path)| path).collect())
}

/// One batcher per record kind.
struct Streams<'p, P> {
    glucose: WindowedBatcher<'p, GlucoseRead, P>,
    calibration: WindowedBatcher<'p, CalibrationRead, P>,
    injection: WindowedBatcher<'p, Injection, P>,
    meal: WindowedBatcher<'p, Meal, P>,
    exercise: WindowedBatcher<'p, Exercise, P>,
}

impl<'p, P: BatchPersister> Streams<'p, P> {
    fn new(persister: &'p P, window: WindowConfig, sink: &SharedSink) -> Self {
        Self {
            glucose: WindowedBatcher::new(persister, window, sink.clone()),
            calibration: WindowedBatcher::new(persister, window, sink.clone()),
            injection: WindowedBatcher::new(persister, window, sink.clone()),
            meal: WindowedBatcher::new(persister, window, sink.clone()),
            exercise: WindowedBatcher::new(persister, window, sink.clone()),
        }
    }

    fn write(&mut self, record: Record) -> Result<(), DroppedWindow> {
        match record {
            Record::GlucoseRead(r) => self.glucose.write_or_drop(r),
            Record::CalibrationRead(r) => self.calibration.write_or_drop(r),
            Record::Injection(r) => self.injection.write_or_drop(r),
            Record::Meal(r) => self.meal.write_or_drop(r),
            Record::Exercise(r) => self.exercise.write_or_drop(r),
        }
    }

    /// Closes every stream, collecting every failure.
    ///
    /// A stream whose final flush fails is discarded. Returns how many records
    /// were lost that way.
    fn close_all(&mut self, failures: &mut Vec<BatchError>, sink: &SharedSink) -> usize {
        close_stream(&mut self.glucose, failures, sink)
            + close_stream(&mut self.calibration, failures, sink)
            + close_stream(&mut self.injection, failures, sink)
            + close_stream(&mut self.meal, failures, sink)
            + close_stream(&mut self.exercise, failures, sink)
    }

    fn artifacts(&self) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = [
            self.glucose.flushed(),
            self.calibration.flushed(),
            self.injection.flushed(),
            self.meal.flushed(),
            self.exercise.flushed(),
        ]
        .concat();
        artifacts.sort_by_key(|a| a.kind);
        artifacts
    }
}

fn close_stream<R: TimestampedRecord, P: BatchPersister>(
    stream: &mut WindowedBatcher<'_, R, P>,
    failures: &mut Vec<BatchError>,
    sink: &SharedSink,
) -> usize {
    match stream.close() {
        Ok(()) => 0,
        Err(error) => {
            failures.push(error);
            let records = stream.discard();
            sink.report(&Diagnostic::WindowDropped {
                kind: R::KIND,
                records,
            });
            records
        }
    }
}

/// Drives a conversion run over one input directory.
pub struct Converter<'a, D, P> {
    decoder: &'a D,
    persister: &'a P,
    options: ConvertOptions,
    sink: SharedSink,
}

impl<'a, D: EventDecoder, P: BatchPersister> Converter<'a, D, P> {
    pub fn new(
        decoder: &'a D,
        persister: &'a P,
        options: ConvertOptions,
        sink: SharedSink,
    ) -> Self {
        Self {
            decoder,
            persister,
            options,
            sink,
        }
    }

    /// Converts every file in `input`.
    ///
    /// Decoding runs in parallel; reconciliation and batching run in file order.
    pub fn run(&self, input: &Path) -> Result<ConvertReport, IngestError> {
        let files = list_input_files(input).map_err(|source| IngestError::ReadDir {
            path: input.to_path_buf(),
            source,
        })?;

        let mut report = ConvertReport::default();
        let (accepted, rejected): (Vec<PathBuf>, Vec<PathBuf>) =
            files.into_iter().partition(|path| self.decoder.accepts(path));
        for path in &rejected {
            report.files_skipped += 1;
            self.sink.report(&Diagnostic::FileSkipped {
                path,
                reason: &"unsupported file type",
            });
        }

        let decoder = self.decoder;
        let decoded: Vec<_> = accepted.par_iter().map(|path| decoder.decode(path)).collect();

        let mut clocks: HashMap<(String, SourceKind), ClockReconciler> = HashMap::new();
        let mut streams = Streams::new(self.persister, self.options.window, &self.sink);
        let mut failures = Vec::new();

        for (path, result) in accepted.iter().zip(decoded) {
            let file = match result {
                Ok(file) => file,
                Err(error) => {
                    report.files_skipped += 1;
                    self.sink.report(&Diagnostic::FileSkipped {
                        path,
                        reason: &error,
                    });
                    continue;
                }
            };
            report.files_read += 1;
            self.sink.report(&Diagnostic::FileDecoded {
                path,
                device: &file.device,
                events: file.events.len(),
            });

            for (index, event) in file.events.iter().enumerate() {
                report.events_read += 1;
                let clock = clocks
                    .entry((file.device.clone(), event.source))
                    .or_insert_with(|| {
                        ClockReconciler::new(self.options.clock.clone(), self.sink.clone())
                    });
                match classify(event, clock) {
                    Ok(Classified::Record(record)) if !self.options.converts(record.kind()) => {
                        report.events_ignored += 1;
                        self.sink.report(&Diagnostic::EventIgnored {
                            path,
                            event_type: record.kind().as_str(),
                        });
                    }
                    Ok(Classified::Record(record)) => {
                        let kind = record.kind();
                        if let Err(dropped) = streams.write(record) {
                            report.records_dropped += dropped.records;
                            self.sink.report(&Diagnostic::WindowDropped {
                                kind,
                                records: dropped.records,
                            });
                            failures.push(dropped.error);
                        }
                    }
                    Ok(Classified::Ignored { event_type }) => {
                        report.events_ignored += 1;
                        self.sink.report(&Diagnostic::EventIgnored {
                            path,
                            event_type: &event_type,
                        });
                    }
                    Err(error) => {
                        report.events_skipped += 1;
                        self.sink.report(&Diagnostic::EventSkipped {
                            path,
                            index,
                            reason: &error,
                        });
                    }
                }
            }
        }

        report.records_dropped += streams.close_all(&mut failures, &self.sink);
        report.artifacts = streams.artifacts();

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(IngestError::Flush {
                failures,
                report: Box::new(report),
            })
        }
    }
}
