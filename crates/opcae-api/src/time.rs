// ── Wire timestamps ──
//
// FILETIME: 100-nanosecond ticks since 1601-01-01 UTC, split into two DWORDs.
// DATE (inside VARIANTs): fractional days since 1899-12-30.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{DecodeError, Error};

const TICKS_PER_SECOND: u64 = 10_000_000;
const NANOS_PER_TICK: u64 = 100;
/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE_SECS: i64 = 11_644_473_600;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Binary FILETIME as laid out in records and out-parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileTime {
    pub low: u32,
    pub high: u32,
}

impl FileTime {
    pub fn from_ticks(ticks: u64) -> Self {
        Self {
            low: (ticks & 0xFFFF_FFFF).try_into().unwrap_or(u32::MAX),
            high: (ticks >> 32).try_into().unwrap_or(u32::MAX),
        }
    }

    pub fn ticks(self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }

    pub fn is_zero(self) -> bool {
        self.ticks() == 0
    }

    /// Absolute point in time, 100ns precision preserved.
    pub fn to_utc(self, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
        let ticks = self.ticks();
        let secs = i64::try_from(ticks / TICKS_PER_SECOND)
            .map_err(|_| DecodeError::InvalidTimestamp { field })?
            - EPOCH_DIFFERENCE_SECS;
        let nanos = u32::try_from((ticks % TICKS_PER_SECOND) * NANOS_PER_TICK)
            .map_err(|_| DecodeError::InvalidTimestamp { field })?;
        DateTime::from_timestamp(secs, nanos).ok_or(DecodeError::InvalidTimestamp { field })
    }

    /// Like [`to_utc`](Self::to_utc), but a zero FILETIME ("never") is `None`.
    pub fn to_utc_opt(self, field: &'static str) -> Result<Option<DateTime<Utc>>, DecodeError> {
        if self.is_zero() {
            Ok(None)
        } else {
            self.to_utc(field).map(Some)
        }
    }

    /// Encode a point in time. Instants before 1601 cannot be represented.
    pub fn from_utc(time: DateTime<Utc>) -> Result<Self, Error> {
        let out_of_range = || Error::InvalidArgument {
            message: format!("{time} is before the FILETIME epoch"),
        };
        let secs = u64::try_from(time.timestamp() + EPOCH_DIFFERENCE_SECS)
            .map_err(|_| out_of_range())?;
        let ticks = secs
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(u64::from(time.timestamp_subsec_nanos()) / NANOS_PER_TICK))
            .ok_or_else(out_of_range)?;
        Ok(Self::from_ticks(ticks))
    }
}

fn ole_epoch() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(DateTime::<Utc>::MIN_UTC, |naive| naive.and_utc())
}

/// Decode an OLE automation DATE.
///
/// The integer part counts days from 1899-12-30 (negative before it); the
/// fractional part is always the positive time of day, so `-1.25` is
/// 1899-12-29 06:00.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn ole_date_to_utc(days: f64, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    if !days.is_finite() {
        return Err(DecodeError::InvalidTimestamp { field });
    }
    let whole = days.trunc();
    let fraction = (days - whole).abs();
    let millis = whole * MILLIS_PER_DAY + (fraction * MILLIS_PER_DAY).round();
    // i64::MAX as f64 rounds up; anything that large is out of chrono's range anyway.
    if millis.abs() >= 9.0e15 {
        return Err(DecodeError::InvalidTimestamp { field });
    }
    ole_epoch()
        .checked_add_signed(Duration::milliseconds(millis as i64))
        .ok_or(DecodeError::InvalidTimestamp { field })
}

/// Encode a point in time as an OLE automation DATE (millisecond precision).
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn utc_to_ole_date(time: DateTime<Utc>) -> f64 {
    let millis = (time - ole_epoch()).num_milliseconds();
    let day_millis = 86_400_000_i64;
    let days = millis.div_euclid(day_millis);
    let rem = millis.rem_euclid(day_millis) as f64 / MILLIS_PER_DAY;
    if days < 0 {
        // Negative dates: the fraction still counts forward from midnight.
        days as f64 - rem
    } else {
        days as f64 + rem
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    #[test]
    fn unix_epoch_ticks() {
        let ft = FileTime::from_ticks(116_444_736_000_000_000);
        assert_eq!(ft.to_utc("t").unwrap(), Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn round_trip_keeps_sub_microsecond_ticks() {
        let t = Utc
            .with_ymd_and_hms(2024, 3, 9, 17, 45, 12)
            .unwrap()
            .with_nanosecond(123_456_700)
            .unwrap();
        let ft = FileTime::from_utc(t).unwrap();
        assert_eq!(ft.to_utc("t").unwrap(), t);
    }

    #[test]
    fn zero_is_never() {
        assert_eq!(FileTime::default().to_utc_opt("t").unwrap(), None);
    }

    #[test]
    fn before_1601_is_rejected() {
        let t = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();
        assert!(FileTime::from_utc(t).is_err());
    }

    #[test]
    fn ole_dates() {
        let noon = ole_date_to_utc(2.5, "d").unwrap();
        assert_eq!(noon, Utc.with_ymd_and_hms(1900, 1, 1, 12, 0, 0).unwrap());

        let before = ole_date_to_utc(-1.25, "d").unwrap();
        assert_eq!(before, Utc.with_ymd_and_hms(1899, 12, 29, 6, 0, 0).unwrap());

        assert!(ole_date_to_utc(f64::NAN, "d").is_err());
    }

    #[test]
    fn ole_date_round_trip() {
        for t in [
            Utc.with_ymd_and_hms(2023, 11, 2, 8, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(1899, 12, 29, 6, 0, 0).unwrap(),
        ] {
            assert_eq!(ole_date_to_utc(utc_to_ole_date(t), "d").unwrap(), t);
        }
    }
}
