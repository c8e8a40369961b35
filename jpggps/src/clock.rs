//! Camera clock offsets and conversion of capture times to UTC.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};

use crate::GeoError;

/// Camera clock minus UTC, to the second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockOffset {
    seconds: i64,
}

impl ClockOffset {
    pub const ZERO: ClockOffset = ClockOffset { seconds: 0 };

    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    pub fn from_hms(hours: i64, minutes: i64, seconds: i64) -> Self {
        Self {
            seconds: hours * 3600 + minutes * 60 + seconds,
        }
    }

    /// Offset implied by a camera reading and the true UTC instant it was taken at,
    /// rounded to the nearest second.
    pub fn between(local: NaiveDateTime, utc: DateTime<Utc>) -> Self {
        let delta = local - utc.naive_utc();
        let millis = delta.num_milliseconds();
        Self {
            seconds: (millis as f64 / 1000.0).round() as i64,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn as_duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    /// Parse `[+-]hh:mm[:ss]` or the compact `[+-]hhmm[ss]`. A missing sign means
    /// the camera runs ahead of UTC.
    pub fn parse(input: &str) -> Result<Self, GeoError> {
        let invalid = || GeoError::InvalidOffset(input.to_string());
        let trimmed = input.trim();
        let (sign, body) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            Some(_) => (1, trimmed),
            None => return Err(invalid()),
        };
        if !body.is_ascii() {
            return Err(invalid());
        }

        let fields: Vec<&str> = if body.contains(':') {
            body.split(':').collect()
        } else {
            match body.len() {
                4 => vec![&body[..2], &body[2..]],
                6 => vec![&body[..2], &body[2..4], &body[4..]],
                _ => return Err(invalid()),
            }
        };
        if !(2..=3).contains(&fields.len())
            || fields[0].len() > 3
            || fields[1..].iter().any(|f| f.len() != 2)
            || fields
                .iter()
                .any(|f| f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }

        let hours: i64 = fields[0].parse().map_err(|_| invalid())?;
        let minutes: i64 = fields[1].parse().map_err(|_| invalid())?;
        let seconds: i64 = match fields.get(2) {
            Some(s) => s.parse().map_err(|_| invalid())?,
            None => 0,
        };
        if minutes >= 60 || seconds >= 60 {
            return Err(invalid());
        }
        Ok(Self::from_hms(hours, minutes, seconds) * sign)
    }
}

impl std::ops::Mul<i64> for ClockOffset {
    type Output = ClockOffset;

    fn mul(self, rhs: i64) -> ClockOffset {
        ClockOffset {
            seconds: self.seconds * rhs,
        }
    }
}

impl FromStr for ClockOffset {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ClockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.seconds < 0 { '-' } else { '+' };
        let total = self.seconds.unsigned_abs();
        write!(
            f,
            "{}{:02}:{:02}:{:02}",
            sign,
            total / 3600,
            (total / 60) % 60,
            total % 60
        )
    }
}

impl Serialize for ClockOffset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Convert a camera capture time to UTC given the camera's offset.
pub fn to_utc(local: NaiveDateTime, offset: ClockOffset) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - offset.as_duration()))
}

/// Offset selection for a batch of photos: a default plus per-directory overrides.
#[derive(Clone, Debug, Default)]
pub struct ClockCorrection {
    default: ClockOffset,
    overrides: Vec<(PathBuf, ClockOffset)>,
}

impl ClockCorrection {
    pub fn fixed(offset: ClockOffset) -> Self {
        Self {
            default: offset,
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, dir: impl Into<PathBuf>, offset: ClockOffset) -> Self {
        self.overrides.push((dir.into(), offset));
        self
    }

    pub fn default_offset(&self) -> ClockOffset {
        self.default
    }

    /// The most specific override whose directory contains `photo`.
    pub fn offset_for(&self, photo: &Path) -> ClockOffset {
        self.overrides
            .iter()
            .filter(|(dir, _)| photo.starts_with(dir))
            .max_by_key(|(dir, _)| dir.components().count())
            .map(|(_, offset)| *offset)
            .unwrap_or(self.default)
    }

    pub fn to_utc(&self, photo: &Path, local: NaiveDateTime) -> DateTime<Utc> {
        to_utc(local, self.offset_for(photo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, 1, 2)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn parses_offset_formats() {
        assert_eq!(ClockOffset::parse("-08:00").unwrap().seconds(), -8 * 3600);
        assert_eq!(ClockOffset::parse("+05:30").unwrap().seconds(), 5 * 3600 + 1800);
        assert_eq!(
            ClockOffset::parse("-07:59:50").unwrap().seconds(),
            -(7 * 3600 + 59 * 60 + 50)
        );
        assert_eq!(ClockOffset::parse("-0800").unwrap().seconds(), -8 * 3600);
        assert_eq!(ClockOffset::parse("0700").unwrap().seconds(), 7 * 3600);
        assert_eq!(ClockOffset::parse("-000012").unwrap().seconds(), -12);
        assert_eq!("+00:00".parse::<ClockOffset>().unwrap(), ClockOffset::ZERO);
    }

    #[test]
    fn rejects_malformed_offsets() {
        for bad in ["", "+", "8", "-800", "+08:60", "+08:00:75", "+08:0", "ab:cd", "+1:2:3:4", "+08h00"] {
            assert!(
                matches!(ClockOffset::parse(bad), Err(GeoError::InvalidOffset(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn displays_signed_hms() {
        assert_eq!(ClockOffset::from_seconds(-(8 * 3600 + 10)).to_string(), "-08:00:10");
        assert_eq!(ClockOffset::from_hms(5, 30, 0).to_string(), "+05:30:00");
        assert_eq!(ClockOffset::ZERO.to_string(), "+00:00:00");
    }

    #[test]
    fn to_utc_subtracts_offset() {
        let pst = ClockOffset::parse("-08:00").unwrap();
        assert_eq!(
            to_utc(local(10, 0, 0), pst),
            Utc.with_ymd_and_hms(2016, 1, 2, 18, 0, 0).unwrap()
        );
        let ahead = ClockOffset::from_seconds(12);
        assert_eq!(
            to_utc(local(0, 0, 5), ahead),
            Utc.with_ymd_and_hms(2016, 1, 1, 23, 59, 53).unwrap()
        );
    }

    #[test]
    fn between_inverts_to_utc() {
        let utc = Utc.with_ymd_and_hms(2016, 1, 2, 18, 0, 0).unwrap();
        let offset = ClockOffset::between(local(10, 0, 7), utc);
        assert_eq!(offset.to_string(), "-07:59:53");
        assert_eq!(to_utc(local(10, 0, 7), offset), utc);
    }

    #[test]
    fn most_specific_override_wins() {
        let clock = ClockCorrection::fixed(ClockOffset::from_hms(-8, 0, 0))
            .with_override("/photos/2016-07", ClockOffset::from_hms(-7, 0, 0))
            .with_override("/photos/2016-07/2016-07-04", ClockOffset::from_hms(-4, 0, 0));
        assert_eq!(
            clock.offset_for(Path::new("/photos/2016-01/a.jpg")).seconds(),
            -8 * 3600
        );
        assert_eq!(
            clock.offset_for(Path::new("/photos/2016-07/2016-07-01/a.jpg")).seconds(),
            -7 * 3600
        );
        assert_eq!(
            clock.offset_for(Path::new("/photos/2016-07/2016-07-04/a.jpg")).seconds(),
            -4 * 3600
        );
        assert_eq!(
            clock.to_utc(Path::new("/photos/2016-07/x.jpg"), local(10, 0, 0)),
            Utc.with_ymd_and_hms(2016, 1, 2, 17, 0, 0).unwrap()
        );
    }
}
