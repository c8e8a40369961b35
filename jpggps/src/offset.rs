//! Camera clock offset estimation.
//!
//! Two sources of evidence are supported: a single photo of a clock showing
//! true UTC, or the onboard GPS timestamps of a population of photos. The
//! onboard timestamp is frozen at the last satellite fix, so it can lag the
//! real capture instant by seconds to tens of seconds. Population samples
//! therefore run positive of the true offset, and the true offset is never
//! more positive than the most negative sample. The estimate picks that most
//! negative sample, and reports the mode alongside it with a divergence flag
//! so the caller can decide when a weak minimum looks suspicious.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::clock::ClockOffset;
use crate::photo::PhotoRecord;
use crate::GeoError;

pub const DEFAULT_TOLERANCE_S: i64 = 2;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OffsetSample {
    pub photo: PathBuf,
    pub offset: ClockOffset,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OffsetEstimate {
    /// Most negative observed offset.
    pub chosen: ClockOffset,
    /// Most frequent offset; ties go to the more negative value.
    pub mode: ClockOffset,
    /// The mode sits further than the tolerance above `chosen`.
    pub divergent: bool,
    pub distribution: BTreeMap<ClockOffset, usize>,
}

impl OffsetEstimate {
    /// Estimate from a photo of a clock displaying `ground_truth`.
    pub fn from_reference(
        photo: &PhotoRecord,
        ground_truth: DateTime<Utc>,
    ) -> Result<Self, GeoError> {
        let local = photo.capture_time.ok_or_else(|| {
            GeoError::NoSample(format!(
                "reference photo {} has no capture time",
                photo.path.display()
            ))
        })?;
        let sample = OffsetSample {
            photo: photo.path.clone(),
            offset: ClockOffset::between(local, ground_truth),
        };
        Self::from_samples(&[sample], 0)
    }

    /// Estimate from every photo carrying an active fix and both timestamps.
    pub fn from_population(photos: &[PhotoRecord], tolerance_s: i64) -> Result<Self, GeoError> {
        let samples = collect_samples(photos);
        if samples.is_empty() {
            return Err(GeoError::NoSample(format!(
                "none of {} photos has an active GPS fix with a timestamp",
                photos.len()
            )));
        }
        debug!("{} of {} photos usable as offset samples", samples.len(), photos.len());
        Self::from_samples(&samples, tolerance_s)
    }

    pub fn from_samples(samples: &[OffsetSample], tolerance_s: i64) -> Result<Self, GeoError> {
        let mut distribution: BTreeMap<ClockOffset, usize> = BTreeMap::new();
        for sample in samples {
            *distribution.entry(sample.offset).or_insert(0) += 1;
        }
        let chosen = *distribution
            .keys()
            .next()
            .ok_or_else(|| GeoError::NoSample("no samples".into()))?;

        let mut mode = chosen;
        let mut best = 0usize;
        for (&offset, &count) in &distribution {
            if count > best {
                best = count;
                mode = offset;
            }
        }

        Ok(Self {
            chosen,
            mode,
            divergent: mode.seconds() - chosen.seconds() > tolerance_s,
            distribution,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.distribution.values().sum()
    }

    /// One-line summary of the chosen offset.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "offset {} from {} sample{}",
            self.chosen,
            self.sample_count(),
            if self.sample_count() == 1 { "" } else { "s" }
        );
        if self.divergent {
            let _ = write!(
                line,
                "; mode {} differs by {} s, consider it instead",
                self.mode,
                self.mode.seconds() - self.chosen.seconds()
            );
        }
        line
    }

    /// Summary followed by a `count x offset` line per distinct value when
    /// more than one value was seen.
    pub fn report(&self) -> String {
        let mut out = self.summary();
        if self.distribution.len() > 1 {
            for (offset, count) in &self.distribution {
                let _ = write!(out, "\n  {:>4} x {}", count, offset);
            }
        }
        out
    }
}

pub fn collect_samples(photos: &[PhotoRecord]) -> Vec<OffsetSample> {
    photos
        .iter()
        .filter(|p| p.is_offset_sample())
        .filter_map(|p| {
            Some(OffsetSample {
                photo: p.path.clone(),
                offset: ClockOffset::between(p.capture_time?, p.gps_time?),
            })
        })
        .collect()
}
