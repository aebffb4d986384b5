//! Device clock reconciliation.
//!
//! A receiver reports two clocks for every event: the wall clock it displays
//! (set by the user, subject to timezone changes and DST) and an internal
//! clock anchored to UTC that only ever moves forward. The difference between
//! the two is the offset the user had configured at that moment. Rounding it
//! to a plausible timezone boundary gives the event's implied location, which
//! then qualifies the separately reported event time.
//!
//! The offset is derived again for every event since a device may travel
//! across timezones.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime};
use thiserror::Error;

use crate::ReconciledTime;
use crate::diagnostics::{Diagnostic, SharedSink};

/// Default textual format of receiver timestamps.
pub const DEFAULT_DEVICE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Westernmost offset in use (UTC-12:00).
const MIN_OFFSET_SECONDS: i64 = -12 * 3600;

/// Easternmost offset in use (UTC+14:00).
const MAX_OFFSET_SECONDS: i64 = 14 * 3600;

/// Rounding slack below which no diagnostic is reported.
const DRIFT_REPORT_SECONDS: i64 = 60;

/// Which of the three clock values failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockField {
    Display,
    Internal,
    Event,
}

impl fmt::Display for ClockField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Display => "display",
            Self::Internal => "internal",
            Self::Event => "event",
        };
        write!(f, "{s}")
    }
}

/// Per-event reconciliation failures. These skip the event, not the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClockError {
    /// A time string did not match the device format.
    #[error("cannot parse {field} time {value:?}: {source}")]
    Parse {
        field: ClockField,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// The internal clock went backwards.
    #[error("internal time {current} is earlier than previous internal time {previous}")]
    Ordering {
        previous: NaiveDateTime,
        current: NaiveDateTime,
    },
    /// The implied offset is not one any timezone uses.
    #[error("implied offset of {minutes} minutes is outside -12:00..+14:00")]
    OffsetOutOfRange { minutes: i64 },
    /// Applying the offset moves the event time past the supported calendar.
    #[error("event time {event} is out of range once shifted to UTC")]
    TimeOutOfRange { event: NaiveDateTime },
}

/// Invalid offset rounding configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("offset granularity must be a positive divisor of 1440 minutes, got {0}")]
pub struct InvalidOffsetPolicy(u32);

/// How raw offsets are snapped to timezone boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPolicy {
    granularity_minutes: u32,
}

impl Default for OffsetPolicy {
    fn default() -> Self {
        Self {
            granularity_minutes: 15,
        }
    }
}

impl OffsetPolicy {
    /// Creates a policy rounding to multiples of `granularity_minutes`.
    pub const fn new(granularity_minutes: u32) -> Result<Self, InvalidOffsetPolicy> {
        if granularity_minutes == 0 || 1440 % granularity_minutes != 0 {
            return Err(InvalidOffsetPolicy(granularity_minutes));
        }
        Ok(Self {
            granularity_minutes,
        })
    }

    pub const fn granularity_minutes(&self) -> u32 {
        self.granularity_minutes
    }

    /// Rounds to the nearest multiple of the granularity, halves away from zero.
    pub fn round(&self, raw_seconds: i64) -> i64 {
        let step = i64::from(self.granularity_minutes) * 60;
        let half = step / 2;
        let steps = if raw_seconds >= 0 {
            (raw_seconds + half) / step
        } else {
            -((half - raw_seconds) / step)
        };
        steps * step
    }
}

/// Settings shared by every reconciler of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSettings {
    pub device_time_format: String,
    pub offset_policy: OffsetPolicy,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            device_time_format: DEFAULT_DEVICE_TIME_FORMAT.to_string(),
            offset_policy: OffsetPolicy::default(),
        }
    }
}

/// Reconciles one monotonic sequence of device clock readings.
pub struct ClockReconciler {
    settings: ClockSettings,
    last_internal: Option<NaiveDateTime>,
    sink: SharedSink,
}

impl ClockReconciler {
    pub fn new(settings: ClockSettings, sink: SharedSink) -> Self {
        Self {
            settings,
            last_internal: None,
            sink,
        }
    }

    /// Internal time of the last successfully reconciled event.
    pub const fn last_internal(&self) -> Option<NaiveDateTime> {
        self.last_internal
    }

    /// Infers the device offset from `display` and `internal` and applies it to `event`.
    ///
    /// A failed event leaves the monotonicity reference untouched.
    pub fn reconcile(
        &mut self,
        display: &str,
        internal: &str,
        event: &str,
    ) -> Result<ReconciledTime, ClockError> {
        let display = self.parse(ClockField::Display, display)?;
        let internal = self.parse(ClockField::Internal, internal)?;
        let event = self.parse(ClockField::Event, event)?;

        if let Some(previous) = self.last_internal {
            if internal < previous {
                return Err(ClockError::Ordering {
                    previous,
                    current: internal,
                });
            }
        }

        let raw_seconds = (display - internal).num_seconds();
        let offset_seconds = self.settings.offset_policy.round(raw_seconds);
        if !(MIN_OFFSET_SECONDS..=MAX_OFFSET_SECONDS).contains(&offset_seconds) {
            return Err(ClockError::OffsetOutOfRange {
                minutes: offset_seconds / 60,
            });
        }
        let offset = i32::try_from(offset_seconds)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or(ClockError::OffsetOutOfRange {
                minutes: offset_seconds / 60,
            })?;

        if (raw_seconds - offset_seconds).abs() > DRIFT_REPORT_SECONDS {
            self.sink.report(&Diagnostic::OffsetRounded {
                raw_seconds,
                applied: offset,
            });
        }

        let utc = event
            .checked_sub_signed(Duration::seconds(offset_seconds))
            .ok_or(ClockError::TimeOutOfRange { event })?;
        self.last_internal = Some(internal);
        Ok(ReconciledTime::new(DateTime::from_naive_utc_and_offset(
            utc, offset,
        )))
    }

    fn parse(&self, field: ClockField, value: &str) -> Result<NaiveDateTime, ClockError> {
        NaiveDateTime::parse_from_str(value.trim(), &self.settings.device_time_format).map_err(
            |source| ClockError::Parse {
                field,
                value: value.to_string(),
                source,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::diagnostics::MemorySink;

    fn reconciler() -> ClockReconciler {
        ClockReconciler::new(ClockSettings::default(), Arc::new(MemorySink::new()))
    }

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, DEFAULT_DEVICE_TIME_FORMAT).unwrap()
    }

    fn render(t: NaiveDateTime) -> String {
        t.format(DEFAULT_DEVICE_TIME_FORMAT).to_string()
    }

    #[test]
    fn constant_offset_shifts_every_event_time() {
        let mut clock = reconciler();
        let start = naive("2014-02-20 14:00:00");
        for step in 0..48 {
            let internal = start + Duration::minutes(step * 5);
            // Receivers drift a few seconds from the configured offset.
            let display = internal - Duration::hours(8) + Duration::seconds(step % 40);
            let event = display - Duration::minutes(3);

            let time = clock
                .reconcile(&render(display), &render(internal), &render(event))
                .unwrap();

            assert_eq!(time.location(), "-08:00");
            assert_eq!(time.instant().naive_utc(), event + Duration::hours(8));
            assert_eq!(time.local().naive_local(), event);
        }
    }

    #[test]
    fn matching_clocks_are_utc() {
        let mut clock = reconciler();
        let time = clock
            .reconcile(
                "2014-02-20 06:06:48",
                "2014-02-20 06:06:48",
                "2014-02-20 06:00:00",
            )
            .unwrap();
        assert_eq!(time.location(), "UTC");
        assert_eq!(
            time.instant(),
            Utc.with_ymd_and_hms(2014, 2, 20, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn half_hour_offsets_survive_default_rounding() {
        let mut clock = reconciler();
        let time = clock
            .reconcile(
                "2014-02-20 19:36:10",
                "2014-02-20 14:06:03",
                "2014-02-20 19:36:10",
            )
            .unwrap();
        assert_eq!(time.location(), "+05:30");
    }

    #[test]
    fn policy_rounds_half_away_from_zero() {
        let hourly = OffsetPolicy::new(60).unwrap();
        assert_eq!(hourly.round(5 * 3600 + 30 * 60), 6 * 3600);
        assert_eq!(hourly.round(-(5 * 3600 + 30 * 60)), -6 * 3600);
        assert_eq!(hourly.round(5 * 3600 + 29 * 60), 5 * 3600);

        let quarter = OffsetPolicy::default();
        assert_eq!(quarter.round(-28_755), -8 * 3600);
        assert_eq!(quarter.round(7 * 60 + 29), 0);
        assert_eq!(quarter.round(7 * 60 + 30), 15 * 60);
    }

    #[test]
    fn policy_rejects_non_divisors() {
        assert!(OffsetPolicy::new(0).is_err());
        assert!(OffsetPolicy::new(7).is_err());
        assert!(OffsetPolicy::new(30).is_ok());
        assert!(OffsetPolicy::new(1440).is_ok());
    }

    #[test]
    fn backwards_internal_clock_skips_only_that_event() {
        let mut clock = reconciler();
        clock
            .reconcile(
                "2014-02-20 06:10:00",
                "2014-02-20 14:10:00",
                "2014-02-20 06:10:00",
            )
            .unwrap();

        let err = clock
            .reconcile(
                "2014-02-20 06:05:00",
                "2014-02-20 14:05:00",
                "2014-02-20 06:05:00",
            )
            .unwrap_err();
        assert!(matches!(err, ClockError::Ordering { .. }));
        assert_eq!(clock.last_internal(), Some(naive("2014-02-20 14:10:00")));

        // Equal internal time is not a violation.
        assert!(
            clock
                .reconcile(
                    "2014-02-20 06:10:00",
                    "2014-02-20 14:10:00",
                    "2014-02-20 06:10:00",
                )
                .is_ok()
        );
    }

    #[test]
    fn unparseable_time_names_the_field() {
        let mut clock = reconciler();
        let err = clock
            .reconcile("2014-02-20 06:10:00", "yesterday", "2014-02-20 06:10:00")
            .unwrap_err();
        match err {
            ClockError::Parse { field, value, .. } => {
                assert_eq!(field, ClockField::Internal);
                assert_eq!(value, "yesterday");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(clock.last_internal().is_none());
    }

    #[test]
    fn implausible_offset_is_rejected() {
        let mut clock = reconciler();
        let err = clock
            .reconcile(
                "2014-02-21 10:00:00",
                "2014-02-20 14:00:00",
                "2014-02-21 10:00:00",
            )
            .unwrap_err();
        assert_eq!(err, ClockError::OffsetOutOfRange { minutes: 20 * 60 });
    }

    #[test]
    fn event_shifted_past_calendar_end_is_rejected() {
        let mut clock = reconciler();
        let err = clock
            .reconcile(
                "+262142-12-31 12:00:00",
                "+262142-12-31 20:00:00",
                "+262142-12-31 23:59:59",
            )
            .unwrap_err();
        assert!(matches!(err, ClockError::TimeOutOfRange { .. }));
        assert!(clock.last_internal().is_none());
    }

    #[test]
    fn large_rounding_is_reported() {
        let sink = Arc::new(MemorySink::new());
        let mut clock = ClockReconciler::new(ClockSettings::default(), sink.clone());
        clock
            .reconcile(
                "2014-02-20 06:04:00",
                "2014-02-20 14:00:00",
                "2014-02-20 06:04:00",
            )
            .unwrap();
        clock
            .reconcile(
                "2014-02-20 06:00:30",
                "2014-02-20 14:00:00",
                "2014-02-20 06:00:30",
            )
            .unwrap();
        assert_eq!(
            sink.entries(),
            vec!["rounded device offset -28560s to -08:00".to_string()]
        );
    }

    #[test]
    fn custom_device_format() {
        let settings = ClockSettings {
            device_time_format: "%d/%m/%Y %H:%M".to_string(),
            offset_policy: OffsetPolicy::default(),
        };
        let mut clock = ClockReconciler::new(settings, Arc::new(MemorySink::new()));
        let time = clock
            .reconcile("20/02/2014 15:00", "20/02/2014 14:00", "20/02/2014 15:00")
            .unwrap();
        assert_eq!(time.location(), "+01:00");
        assert_eq!(
            time.local_date(),
            NaiveDate::from_ymd_opt(2014, 2, 20).unwrap()
        );
    }
}
