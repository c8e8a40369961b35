//! Batch geotagging: per-photo position lookup with per-item outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::ClockCorrection;
use crate::interpolate::{interpolate, InterpolatedPosition};
use crate::photo::{Coordinates, PhotoMetadata, PhotoRecord};
use crate::track::{Track, TrackPoint, TrackStore};
use crate::GeoError;

#[derive(Clone, Debug, Default)]
pub struct GeotagOptions {
    /// Recompute positions for photos that already carry a GPS fix.
    pub overwrite_existing: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Outcome {
    Located(InterpolatedPosition),
    AlreadyPresent(Coordinates),
    NoCoveringTrack,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhotoResult {
    pub path: PathBuf,
    pub utc: Option<DateTime<Utc>>,
    pub outcome: Outcome,
}

impl PhotoResult {
    /// Position to show on a map: the computed one, else the embedded fix.
    pub fn coordinates(&self) -> Option<Coordinates> {
        match &self.outcome {
            Outcome::Located(pos) => Some(Coordinates {
                lat: pos.lat,
                lon: pos.lon,
                ele: pos.ele,
            }),
            Outcome::AlreadyPresent(coords) => Some(*coords),
            Outcome::NoCoveringTrack | Outcome::Failed(_) => None,
        }
    }
}

/// Compute an outcome for every photo. Photos are independent, so the work is
/// spread over the rayon pool; results keep the input order.
pub fn locate_all(
    photos: &[PhotoRecord],
    store: &TrackStore,
    clock: &ClockCorrection,
    options: &GeotagOptions,
) -> Vec<PhotoResult> {
    photos
        .par_iter()
        .map(|photo| locate_one(photo, store, clock, options))
        .collect()
}

fn locate_one(
    photo: &PhotoRecord,
    store: &TrackStore,
    clock: &ClockCorrection,
    options: &GeotagOptions,
) -> PhotoResult {
    let Some(local) = photo.capture_time else {
        return PhotoResult {
            path: photo.path.clone(),
            utc: None,
            outcome: Outcome::Failed("no capture time".into()),
        };
    };
    let utc = clock.to_utc(&photo.path, local);

    // Any embedded coordinates count here, fix status or not.
    let outcome = match photo.position {
        Some(existing) if !options.overwrite_existing => Outcome::AlreadyPresent(existing),
        _ => match store.find_segment(utc) {
            None => Outcome::NoCoveringTrack,
            Some(track) => match interpolate(utc, track) {
                Ok(pos) => Outcome::Located(pos),
                Err(err) => Outcome::Failed(err.to_string()),
            },
        },
    };
    debug!("{}: {:?}", photo.path.display(), outcome);
    PhotoResult {
        path: photo.path.clone(),
        utc: Some(utc),
        outcome,
    }
}

/// Write every located position through `metadata`, in order. A failed write
/// turns that photo's outcome into `Failed` and the batch carries on.
pub fn apply<M: PhotoMetadata + ?Sized>(results: &mut [PhotoResult], metadata: &M) {
    for result in results.iter_mut() {
        let Outcome::Located(pos) = &result.outcome else {
            continue;
        };
        if let Err(err) = metadata.write_position(&result.path, pos) {
            warn!("{}", err);
            result.outcome = Outcome::Failed(err.to_string());
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GeotagSummary {
    pub updated: usize,
    pub already_present: usize,
    pub no_track: usize,
    pub failed: usize,
    pub failures: Vec<(PathBuf, String)>,
    pub uncovered: Vec<PathBuf>,
}

impl GeotagSummary {
    pub fn from_results(results: &[PhotoResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match &result.outcome {
                Outcome::Located(_) => summary.updated += 1,
                Outcome::AlreadyPresent(_) => summary.already_present += 1,
                Outcome::NoCoveringTrack => {
                    summary.no_track += 1;
                    summary.uncovered.push(result.path.clone());
                }
                Outcome::Failed(reason) => {
                    summary.failed += 1;
                    summary.failures.push((result.path.clone(), reason.clone()));
                }
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.updated + self.already_present + self.no_track + self.failed
    }

    /// Summary line; a dry run reports located photos as "would update".
    pub fn describe(&self, dry_run: bool) -> String {
        format!(
            "{} {}, {} skipped (already present), {} skipped (no covering track), {} failed (malformed input)",
            self.updated,
            if dry_run { "would update" } else { "updated" },
            self.already_present,
            self.no_track,
            self.failed
        )
    }
}

impl fmt::Display for GeotagSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(false))
    }
}

/// Build one track per photo directory from the fixes embedded in the photos.
///
/// Point times come from the onboard GPS timestamp when present, otherwise
/// from the capture time corrected by `clock`. Photos without a fix are left
/// out; directories with no usable photo yield no track.
pub fn tracks_from_photos(
    photos: &[PhotoRecord],
    clock: &ClockCorrection,
) -> Result<Vec<Track>, GeoError> {
    let mut groups: BTreeMap<String, Vec<TrackPoint>> = BTreeMap::new();
    for photo in photos {
        let Some(coords) = photo.fixed_position() else {
            continue;
        };
        let time = match (photo.gps_time, photo.capture_time) {
            (Some(gps), _) => gps,
            (None, Some(local)) => clock.to_utc(&photo.path, local),
            (None, None) => continue,
        };
        let group = photo.group().unwrap_or_else(|| "photos".to_string());
        groups
            .entry(group)
            .or_default()
            .push(TrackPoint::new(time, coords.lat, coords.lon, coords.ele));
    }
    groups
        .into_iter()
        .map(|(id, points)| Track::new(id, points))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOffset;
    use crate::photo::GpsStatus;
    use chrono::{Duration, TimeZone};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;

    #[derive(Default)]
    struct MemoryMetadata {
        photos: HashMap<PathBuf, PhotoRecord>,
        written: RefCell<Vec<(PathBuf, InterpolatedPosition)>>,
        read_only: Vec<PathBuf>,
    }

    impl PhotoMetadata for MemoryMetadata {
        fn read(&self, path: &Path) -> Result<PhotoRecord, GeoError> {
            self.photos.get(path).cloned().ok_or_else(|| GeoError::Metadata {
                path: path.to_path_buf(),
                message: "unknown photo".into(),
            })
        }

        fn write_position(&self, path: &Path, position: &InterpolatedPosition) -> Result<(), GeoError> {
            if self.read_only.iter().any(|p| p == path) {
                return Err(GeoError::Metadata {
                    path: path.to_path_buf(),
                    message: "read-only file".into(),
                });
            }
            self.written
                .borrow_mut()
                .push((path.to_path_buf(), position.clone()));
            Ok(())
        }
    }

    fn utc(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 2, 18, 0, 0).unwrap() + Duration::seconds(s)
    }

    fn pst() -> ClockCorrection {
        ClockCorrection::fixed(ClockOffset::from_hms(-8, 0, 0))
    }

    fn photo_at(path: &str, utc_s: i64) -> PhotoRecord {
        let mut photo = PhotoRecord::new(path);
        photo.capture_time = Some(utc(utc_s).naive_utc() - Duration::hours(8));
        photo
    }

    fn store() -> TrackStore {
        TrackStore::from_tracks(vec![Track::new(
            "2016-01-02",
            vec![
                TrackPoint::new(utc(0), 0.0, 0.0, None),
                TrackPoint::new(utc(100), 2.0, 2.0, None),
            ],
        )
        .unwrap()])
        .unwrap()
    }

    fn with_fix(mut photo: PhotoRecord, lat: f64, lon: f64) -> PhotoRecord {
        photo.gps_status = Some(GpsStatus {
            active: true,
            measure_mode: Some(3),
        });
        photo.position = Some(Coordinates { lat, lon, ele: None });
        photo
    }

    #[test]
    fn batch_records_every_outcome() {
        let photos = vec![
            photo_at("/d/a.jpg", 50),
            photo_at("/d/b.jpg", 500),
            PhotoRecord::new("/d/c.jpg"),
            with_fix(photo_at("/d/e.jpg", 10), 7.0, 8.0),
        ];
        let results = locate_all(&photos, &store(), &pst(), &GeotagOptions::default());
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].path, PathBuf::from("/d/a.jpg"));
        assert_eq!(results[0].utc, Some(utc(50)));
        match &results[0].outcome {
            Outcome::Located(pos) => assert!((pos.lat - 1.0).abs() < 1e-12),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(results[1].outcome, Outcome::NoCoveringTrack);
        assert!(matches!(results[2].outcome, Outcome::Failed(_)));
        assert!(matches!(results[3].outcome, Outcome::AlreadyPresent(_)));
        assert_eq!(results[3].coordinates().map(|c| c.lat), Some(7.0));

        let summary = GeotagSummary::from_results(&results);
        assert_eq!(
            (summary.updated, summary.already_present, summary.no_track, summary.failed),
            (1, 1, 1, 1)
        );
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.uncovered, vec![PathBuf::from("/d/b.jpg")]);
        assert_eq!(
            summary.to_string(),
            "1 updated, 1 skipped (already present), 1 skipped (no covering track), 1 failed (malformed input)"
        );
    }

    #[test]
    fn coordinates_without_fix_status_are_kept() {
        let mut photo = photo_at("/d/phone.jpg", 50);
        photo.position = Some(Coordinates {
            lat: 45.0,
            lon: 7.0,
            ele: None,
        });
        assert!(!photo.has_fix());

        let results = locate_all(&[photo.clone()], &store(), &pst(), &GeotagOptions::default());
        assert_eq!(
            results[0].outcome,
            Outcome::AlreadyPresent(Coordinates {
                lat: 45.0,
                lon: 7.0,
                ele: None
            })
        );

        let metadata = MemoryMetadata::default();
        let mut results = results;
        apply(&mut results, &metadata);
        assert!(metadata.written.borrow().is_empty());

        // Without a fix the photo still does not contribute to a track.
        assert!(tracks_from_photos(&[photo], &pst()).unwrap().is_empty());
    }

    #[test]
    fn dry_run_summary_says_would_update() {
        let results = locate_all(&[photo_at("/d/a.jpg", 50)], &store(), &pst(), &GeotagOptions::default());
        let summary = GeotagSummary::from_results(&results);
        assert!(summary.describe(true).starts_with("1 would update, "));
        assert!(!summary.describe(true).contains("updated"));
        assert_eq!(summary.describe(false), summary.to_string());
    }

    #[test]
    fn overwrite_recomputes_existing_fix() {
        let photos = vec![with_fix(photo_at("/d/e.jpg", 10), 7.0, 8.0)];
        let options = GeotagOptions {
            overwrite_existing: true,
        };
        let results = locate_all(&photos, &store(), &pst(), &options);
        assert!(matches!(results[0].outcome, Outcome::Located(_)));
    }

    #[test]
    fn apply_writes_located_and_records_failures() {
        let photos = vec![photo_at("/d/a.jpg", 50), photo_at("/d/ro.jpg", 60), photo_at("/d/x.jpg", 900)];
        let mut results = locate_all(&photos, &store(), &pst(), &GeotagOptions::default());
        let metadata = MemoryMetadata {
            read_only: vec![PathBuf::from("/d/ro.jpg")],
            ..Default::default()
        };
        apply(&mut results, &metadata);

        let written = metadata.written.borrow();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, PathBuf::from("/d/a.jpg"));
        assert!(matches!(results[1].outcome, Outcome::Failed(_)));
        assert_eq!(results[2].outcome, Outcome::NoCoveringTrack);
        assert!(metadata.read(Path::new("/d/a.jpg")).is_err());
    }

    #[test]
    fn builds_tracks_per_directory() {
        let mut first = with_fix(photo_at("/t/2016-01-02/b.jpg", 20), 2.0, 2.0);
        first.gps_time = Some(utc(15));
        let photos = vec![
            first,
            with_fix(photo_at("/t/2016-01-02/a.jpg", 0), 1.0, 1.0),
            with_fix(photo_at("/t/2016-01-03/c.jpg", 86_400), 3.0, 3.0),
            photo_at("/t/2016-01-03/nofix.jpg", 86_500),
        ];
        let tracks = tracks_from_photos(&photos, &pst()).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id(), "2016-01-02");
        assert_eq!(tracks[0].points().len(), 2);
        assert_eq!(tracks[0].points()[0].lat, 1.0);
        assert_eq!(tracks[0].end(), utc(15));
        assert_eq!(tracks[1].points().len(), 1);
    }
}
