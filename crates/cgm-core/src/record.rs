//! Typed device records with reconciled timestamps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The five record kinds produced by a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    GlucoseRead,
    CalibrationRead,
    Injection,
    Meal,
    Exercise,
}

impl RecordKind {
    /// All kinds, in the order batchers are closed.
    pub const ALL: [Self; 5] = [
        Self::GlucoseRead,
        Self::CalibrationRead,
        Self::Injection,
        Self::Meal,
        Self::Exercise,
    ];

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GlucoseRead => "glucose",
            Self::CalibrationRead => "calibration",
            Self::Injection => "injection",
            Self::Meal => "meal",
            Self::Exercise => "exercise",
        }
    }

    /// Prefix used when naming batch artifacts.
    #[must_use]
    pub const fn artifact_prefix(&self) -> &'static str {
        match self {
            Self::GlucoseRead => "glucoseReads",
            Self::CalibrationRead => "calibrations",
            Self::Injection => "injections",
            Self::Meal => "meals",
            Self::Exercise => "exercises",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = UnknownRecordKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glucose" => Ok(Self::GlucoseRead),
            "calibration" => Ok(Self::CalibrationRead),
            "injection" => Ok(Self::Injection),
            "meal" | "carb" => Ok(Self::Meal),
            "exercise" => Ok(Self::Exercise),
            _ => Err(UnknownRecordKind(s.to_string())),
        }
    }
}

impl Serialize for RecordKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown record kind strings.
#[derive(Debug, Clone, Error)]
#[error("unknown record kind: {0}")]
pub struct UnknownRecordKind(String);

/// Errors decoding a serialized [`ReconciledTime`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeReprError {
    #[error("invalid timezone: {0}")]
    Timezone(String),
    #[error("timestamp out of range: {0}")]
    OutOfRange(i64),
}

/// An instant qualified with the UTC offset the device was displaying.
///
/// Serialized as `{"timestamp": <epoch ms>, "timezone": "<location>"}`, where
/// the location is `UTC` for a zero offset and `+HH:MM`/`-HH:MM` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimeRepr", into = "TimeRepr")]
pub struct ReconciledTime(DateTime<FixedOffset>);

impl ReconciledTime {
    pub const fn new(at: DateTime<FixedOffset>) -> Self {
        Self(at)
    }

    /// The instant in UTC.
    pub fn instant(&self) -> DateTime<Utc> {
        self.0.with_timezone(&Utc)
    }

    /// The instant as seen on the device's wall clock.
    pub const fn local(&self) -> DateTime<FixedOffset> {
        self.0
    }

    /// Calendar day on the device's wall clock.
    pub fn local_date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Implied location string for this instant's offset.
    pub fn location(&self) -> String {
        format_location(*self.0.offset())
    }
}

/// Renders an offset as a location string.
pub fn format_location(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    if seconds == 0 {
        return "UTC".to_string();
    }
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.unsigned_abs() / 60;
    format!("{sign}{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Parses a location string produced by [`format_location`].
pub fn parse_location(location: &str) -> Option<FixedOffset> {
    if location == "UTC" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match location.split_at_checked(1)? {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Serialize, Deserialize)]
struct TimeRepr {
    timestamp: i64,
    timezone: String,
}

impl From<ReconciledTime> for TimeRepr {
    fn from(time: ReconciledTime) -> Self {
        Self {
            timestamp: time.timestamp_millis(),
            timezone: time.location(),
        }
    }
}

impl TryFrom<TimeRepr> for ReconciledTime {
    type Error = TimeReprError;

    fn try_from(repr: TimeRepr) -> Result<Self, Self::Error> {
        let offset =
            parse_location(&repr.timezone).ok_or(TimeReprError::Timezone(repr.timezone))?;
        let utc = DateTime::from_timestamp_millis(repr.timestamp)
            .ok_or(TimeReprError::OutOfRange(repr.timestamp))?;
        Ok(Self(utc.with_timezone(&offset)))
    }
}

/// A record the windowed batcher can group by time.
pub trait TimestampedRecord: Serialize {
    /// The kind every value of this type belongs to.
    const KIND: RecordKind;

    /// The record's reconciled timestamp.
    fn time(&self) -> &ReconciledTime;
}

/// Unit of a glucose measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GlucoseUnit {
    #[default]
    #[serde(rename = "mg/dL")]
    MgPerDl,
    #[serde(rename = "mmol/L")]
    MmolPerL,
}

/// A sensor glucose reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseRead {
    pub time: ReconciledTime,
    pub unit: GlucoseUnit,
    pub value: f32,
}

/// A fingerstick meter reading entered for calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRead {
    pub time: ReconciledTime,
    pub unit: GlucoseUnit,
    pub value: f32,
}

/// An insulin injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Injection {
    pub time: ReconciledTime,
    pub units: f32,
    #[serde(default)]
    pub insulin_name: String,
    #[serde(default)]
    pub insulin_type: String,
}

/// A meal, in grams per nutrient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meal {
    pub time: ReconciledTime,
    pub carbohydrates: f32,
    pub proteins: f32,
    pub fat: f32,
    pub saturated: f32,
}

/// An exercise session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub time: ReconciledTime,
    /// Duration in minutes.
    pub duration: i32,
    pub intensity: String,
    pub description: String,
}

macro_rules! impl_timestamped {
    ($($ty:ty => $kind:ident),+ $(,)?) => {
        $(
            impl TimestampedRecord for $ty {
                const KIND: RecordKind = RecordKind::$kind;

                fn time(&self) -> &ReconciledTime {
                    &self.time
                }
            }

            impl From<$ty> for Record {
                fn from(record: $ty) -> Self {
                    Self::$kind(record)
                }
            }
        )+
    };
}

impl_timestamped!(
    GlucoseRead => GlucoseRead,
    CalibrationRead => CalibrationRead,
    Injection => Injection,
    Meal => Meal,
    Exercise => Exercise,
);

/// Any record, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    GlucoseRead(GlucoseRead),
    CalibrationRead(CalibrationRead),
    Injection(Injection),
    Meal(Meal),
    Exercise(Exercise),
}

impl Record {
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::GlucoseRead(_) => RecordKind::GlucoseRead,
            Self::CalibrationRead(_) => RecordKind::CalibrationRead,
            Self::Injection(_) => RecordKind::Injection,
            Self::Meal(_) => RecordKind::Meal,
            Self::Exercise(_) => RecordKind::Exercise,
        }
    }
}
