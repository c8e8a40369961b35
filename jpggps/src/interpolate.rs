use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::track::{Track, TrackPoint, TrackStore};
use crate::GeoError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterpolatedPosition {
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
    pub track: String,
}

/// Linear position along `track` at `time`.
///
/// Fails with [`GeoError::OutOfRange`] outside the track's time range; use
/// [`TrackStore::find_segment`] (or [`locate`]) to pick the track first. An exact
/// timestamp match returns the stored point untouched. Elevation is interpolated
/// when both neighbours carry one, otherwise whichever is present is used.
pub fn interpolate(time: DateTime<Utc>, track: &Track) -> Result<InterpolatedPosition, GeoError> {
    if !track.contains(time) {
        return Err(GeoError::OutOfRange(time));
    }
    let points = track.points();
    let idx = points.partition_point(|p| p.time < time);
    let p1 = &points[idx];
    if p1.time == time {
        return Ok(position(p1, track));
    }
    let p0 = &points[idx - 1];

    let span = (p1.time - p0.time).num_milliseconds();
    let frac = if span > 0 {
        ((time - p0.time).num_milliseconds() as f64 / span as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let lerp = |a: f64, b: f64| a + frac * (b - a);

    Ok(InterpolatedPosition {
        lat: lerp(p0.lat, p1.lat),
        lon: lerp(p0.lon, p1.lon),
        ele: match (p0.ele, p1.ele) {
            (Some(a), Some(b)) => Some(lerp(a, b)),
            (a, b) => a.or(b),
        },
        track: track.id().to_string(),
    })
}

/// Find the covering track and interpolate on it.
pub fn locate(time: DateTime<Utc>, store: &TrackStore) -> Result<InterpolatedPosition, GeoError> {
    let track = store
        .find_segment(time)
        .ok_or(GeoError::OutOfRange(time))?;
    interpolate(time, track)
}

fn position(point: &TrackPoint, track: &Track) -> InterpolatedPosition {
    InterpolatedPosition {
        lat: point.lat,
        lon: point.lon,
        ele: point.ele,
        track: track.id().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 2, 10, 0, 0).unwrap() + chrono::Duration::seconds(s)
    }

    fn sample_track() -> Track {
        Track::new(
            "2016-01-02",
            vec![
                TrackPoint::new(at(0), 0.0, 0.0, Some(100.0)),
                TrackPoint::new(at(10), 2.0, 2.0, Some(120.0)),
                TrackPoint::new(at(20), 48.123_456_789, -123.987_654_321, None),
                TrackPoint::new(at(30), 48.2, -124.0, Some(50.0)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn midpoint_is_average() {
        let pos = interpolate(at(5), &sample_track()).unwrap();
        assert!((pos.lat - 1.0).abs() < 1e-12);
        assert!((pos.lon - 1.0).abs() < 1e-12);
        assert_eq!(pos.ele, Some(110.0));
        assert_eq!(pos.track, "2016-01-02");
    }

    #[test]
    fn exact_match_returns_point_verbatim() {
        let pos = interpolate(at(20), &sample_track()).unwrap();
        assert_eq!(pos.lat, 48.123_456_789);
        assert_eq!(pos.lon, -123.987_654_321);
        assert_eq!(pos.ele, None);

        let first = interpolate(at(0), &sample_track()).unwrap();
        assert_eq!((first.lat, first.lon), (0.0, 0.0));
        let last = interpolate(at(30), &sample_track()).unwrap();
        assert_eq!((last.lat, last.lon, last.ele), (48.2, -124.0, Some(50.0)));
    }

    #[test]
    fn missing_elevation_falls_back_to_neighbour() {
        let pos = interpolate(at(25), &sample_track()).unwrap();
        assert_eq!(pos.ele, Some(50.0));
    }

    #[test]
    fn duplicate_timestamps_use_first_point() {
        let track = Track::new(
            "dup",
            vec![
                TrackPoint::new(at(0), 1.0, 1.0, None),
                TrackPoint::new(at(0), 5.0, 5.0, None),
                TrackPoint::new(at(10), 3.0, 3.0, None),
            ],
        )
        .unwrap();
        let pos = interpolate(at(0), &track).unwrap();
        assert_eq!((pos.lat, pos.lon), (1.0, 1.0));
        let pos = interpolate(at(5), &track).unwrap();
        assert!((pos.lat - 4.0).abs() < 1e-12);
    }

    #[test]
    fn outside_range_is_error() {
        assert!(matches!(
            interpolate(at(-1), &sample_track()),
            Err(GeoError::OutOfRange(_))
        ));
        assert!(matches!(
            interpolate(at(31), &sample_track()),
            Err(GeoError::OutOfRange(_))
        ));
    }

    #[test]
    fn locate_uses_covering_track() {
        let other = Track::new(
            "2016-01-03",
            vec![
                TrackPoint::new(at(86_400), 10.0, 10.0, None),
                TrackPoint::new(at(86_410), 20.0, 20.0, None),
            ],
        )
        .unwrap();
        let store = TrackStore::from_tracks(vec![other, sample_track()]).unwrap();
        assert_eq!(locate(at(86_405), &store).unwrap().lat, 15.0);
        assert_eq!(locate(at(5), &store).unwrap().track, "2016-01-02");
        assert!(matches!(locate(at(40), &store), Err(GeoError::OutOfRange(_))));
    }
}
