//! Turning decoded device events into typed records.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::clock::{ClockError, ClockReconciler};
use crate::record::{
    CalibrationRead, Exercise, GlucoseRead, GlucoseUnit, Injection, Meal, Record,
};

static CARBS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Carbs\s+([+-]?\d+)").unwrap());

static INSULIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Insulin\s+([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)").unwrap()
});

static EXERCISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Exercise\s+(\S+)(?:\s+\(([+-]?\d+))?").unwrap());

/// The element a decoded event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// A sensor glucose reading.
    Glucose,
    /// A meter reading entered for calibration.
    CalibrationMeter,
    /// A user-entered event marker (carbs, insulin, exercise, ...).
    Event,
}

/// Attributes carried by a decoded event, still as device text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFields {
    pub display_time: String,
    pub internal_time: String,
    pub event_time: Option<String>,
    pub value: Option<String>,
    pub event_type: Option<String>,
    pub description: Option<String>,
}

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub source: SourceKind,
    pub fields: RawFields,
}

/// Outcome of classifying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Record(Record),
    /// An event marker whose sub-type maps to no record kind.
    Ignored { event_type: String },
}

/// Per-event classification failures. These skip the event, not the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error("missing {0} attribute")]
    MissingField(&'static str),
    #[error("invalid reading value {0:?}")]
    InvalidValue(String),
}

enum Marker {
    Carbs,
    Insulin,
    Exercise,
}

impl Marker {
    fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "Carbs" => Some(Self::Carbs),
            "Insulin" => Some(Self::Insulin),
            t if t.starts_with("Exercise") => Some(Self::Exercise),
            _ => None,
        }
    }
}

/// Reconciles the event's clocks and builds the matching record.
pub fn classify(
    event: &RawEvent,
    clock: &mut ClockReconciler,
) -> Result<Classified, ClassifyError> {
    let fields = &event.fields;
    let record = match event.source {
        SourceKind::Glucose => {
            let value = reading_value(fields)?;
            let time = clock.reconcile(
                &fields.display_time,
                &fields.internal_time,
                &fields.display_time,
            )?;
            Record::GlucoseRead(GlucoseRead {
                time,
                unit: GlucoseUnit::MgPerDl,
                value,
            })
        }
        SourceKind::CalibrationMeter => {
            let value = reading_value(fields)?;
            let time = clock.reconcile(
                &fields.display_time,
                &fields.internal_time,
                &fields.display_time,
            )?;
            Record::CalibrationRead(CalibrationRead {
                time,
                unit: GlucoseUnit::MgPerDl,
                value,
            })
        }
        SourceKind::Event => {
            let event_type = fields
                .event_type
                .as_deref()
                .ok_or(ClassifyError::MissingField("EventType"))?;
            let Some(marker) = Marker::from_event_type(event_type) else {
                return Ok(Classified::Ignored {
                    event_type: event_type.to_string(),
                });
            };
            let event_time = fields
                .event_time
                .as_deref()
                .ok_or(ClassifyError::MissingField("EventTime"))?;
            let time = clock.reconcile(&fields.display_time, &fields.internal_time, event_time)?;
            let description = fields.description.as_deref().unwrap_or_default();

            match marker {
                Marker::Carbs => Record::Meal(Meal {
                    time,
                    carbohydrates: grams(parse_carbs(description)),
                    proteins: 0.0,
                    fat: 0.0,
                    saturated: 0.0,
                }),
                Marker::Insulin => Record::Injection(Injection {
                    time,
                    units: parse_insulin(description),
                    insulin_name: String::new(),
                    insulin_type: String::new(),
                }),
                Marker::Exercise => {
                    let (intensity, duration) = parse_exercise(description);
                    Record::Exercise(Exercise {
                        time,
                        duration,
                        intensity,
                        description: description.to_string(),
                    })
                }
            }
        }
    };
    Ok(Classified::Record(record))
}

fn reading_value(fields: &RawFields) -> Result<f32, ClassifyError> {
    let raw = fields
        .value
        .as_deref()
        .ok_or(ClassifyError::MissingField("Value"))?;
    raw.trim()
        .parse()
        .map_err(|_| ClassifyError::InvalidValue(raw.to_string()))
}

#[expect(clippy::cast_precision_loss, reason = "gram counts are small")]
const fn grams(count: i32) -> f32 {
    count as f32
}

/// Grams from `"Carbs %d grams"`, 0 when absent.
pub fn parse_carbs(description: &str) -> i32 {
    CARBS_RE
        .captures(description.trim())
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

/// Units from `"Insulin %f units"`, 0 when absent.
pub fn parse_insulin(description: &str) -> f32 {
    INSULIN_RE
        .captures(description.trim())
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0.0)
}

/// Intensity and minutes from `"Exercise %s (%d minutes)"`.
///
/// Whatever parsed before a mismatch is kept.
pub fn parse_exercise(description: &str) -> (String, i32) {
    let Some(caps) = EXERCISE_RE.captures(description.trim()) else {
        return (String::new(), 0);
    };
    let intensity = caps[1].to_string();
    let duration = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    (intensity, duration)
}
