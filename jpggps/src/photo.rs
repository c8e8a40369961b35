//! Photo metadata as seen by the engine, and the seam to whatever reads and
//! writes EXIF.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interpolate::InterpolatedPosition;
use crate::GeoError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsStatus {
    /// Receiver reported an active (`A`) rather than void measurement.
    pub active: bool,
    pub measure_mode: Option<u8>,
}

impl GpsStatus {
    /// Active with a 2-D or 3-D fix.
    pub fn is_fix(&self) -> bool {
        self.active && self.measure_mode.map_or(false, |mode| mode > 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub path: PathBuf,
    /// Camera clock reading, no zone attached.
    pub capture_time: Option<NaiveDateTime>,
    /// Onboard GPS timestamp; frozen at the last fix.
    pub gps_time: Option<DateTime<Utc>>,
    pub gps_status: Option<GpsStatus>,
    pub position: Option<Coordinates>,
}

impl PhotoRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capture_time: None,
            gps_time: None,
            gps_status: None,
            position: None,
        }
    }

    pub fn has_fix(&self) -> bool {
        self.gps_status.map_or(false, |s| s.is_fix())
    }

    /// Usable as an offset sample: a fix plus both clocks.
    pub fn is_offset_sample(&self) -> bool {
        self.has_fix() && self.capture_time.is_some() && self.gps_time.is_some()
    }

    /// Embedded coordinates backed by a real fix.
    pub fn fixed_position(&self) -> Option<Coordinates> {
        if self.has_fix() {
            self.position
        } else {
            None
        }
    }

    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Name of the directory holding the photo, used to group photos by day.
    pub fn group(&self) -> Option<String> {
        self.path
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
    }
}

/// Access to image metadata. Implementations wrap an EXIF reader/writer.
pub trait PhotoMetadata {
    fn read(&self, path: &Path) -> Result<PhotoRecord, GeoError>;

    fn write_position(&self, path: &Path, position: &InterpolatedPosition) -> Result<(), GeoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_requires_active_and_two_dimensions() {
        let fix = |active, mode| GpsStatus {
            active,
            measure_mode: mode,
        };
        assert!(fix(true, Some(3)).is_fix());
        assert!(fix(true, Some(2)).is_fix());
        assert!(!fix(true, Some(1)).is_fix());
        assert!(!fix(true, None).is_fix());
        assert!(!fix(false, Some(3)).is_fix());
    }

    #[test]
    fn names_and_group() {
        let photo = PhotoRecord::new("/trips/2016-01-02/IMG_0001.JPG");
        assert_eq!(photo.name(), "IMG_0001");
        assert_eq!(photo.file_name(), "IMG_0001.JPG");
        assert_eq!(photo.group().as_deref(), Some("2016-01-02"));
    }

    #[test]
    fn position_without_fix_is_ignored() {
        let mut photo = PhotoRecord::new("a.jpg");
        photo.position = Some(Coordinates {
            lat: 1.0,
            lon: 2.0,
            ele: None,
        });
        assert_eq!(photo.fixed_position(), None);
        photo.gps_status = Some(GpsStatus {
            active: true,
            measure_mode: Some(3),
        });
        assert!(photo.fixed_position().is_some());
        assert!(!photo.is_offset_sample());
    }
}
