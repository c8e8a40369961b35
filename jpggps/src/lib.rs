//! Correlate photographs with GPS tracks recorded on another device.
//!
//! The crate estimates the camera-clock offset, maps photo capture times to
//! UTC, interpolates positions from GPX/FIT tracks and merges the results into
//! a KML document without clobbering what is already there.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod clock;
pub mod document;
pub mod geotag;
pub mod interpolate;
pub mod offset;
pub mod photo;
pub mod track;

pub use clock::{to_utc, ClockCorrection, ClockOffset};
pub use document::{DocumentState, KmlDocument, MergeOutcome, MergeReport, Placemark, TrackEntry};
pub use geotag::{locate_all, tracks_from_photos, GeotagOptions, GeotagSummary, Outcome, PhotoResult};
pub use interpolate::{interpolate, locate, InterpolatedPosition};
pub use offset::{OffsetEstimate, OffsetSample};
pub use photo::{Coordinates, GpsStatus, PhotoMetadata, PhotoRecord};
pub use track::{Track, TrackPoint, TrackStore};

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("failed to parse track {track}: {message}")]
    Parse { track: String, message: String },
    #[error("tracks {first} and {second} overlap in time")]
    Overlap { first: String, second: String },
    #[error("failed to write track {track}: {message}")]
    Write { track: String, message: String },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no usable offset samples: {0}")]
    NoSample(String),
    #[error("no track covers {0}")]
    OutOfRange(DateTime<Utc>),
    #[error("invalid clock offset {0:?}: expected [+-]hh:mm[:ss] or [+-]hhmm[ss]")]
    InvalidOffset(String),
    #[error("malformed KML document: {0}")]
    Document(String),
    #[error("metadata access failed for {}: {message}", path.display())]
    Metadata { path: PathBuf, message: String },
}

impl GeoError {
    /// Errors raised while loading tracks; these abort a run.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            GeoError::Parse { .. } | GeoError::Overlap { .. } | GeoError::Io { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GeoError::Io {
            path: path.into(),
            source,
        }
    }
}
