//! GPS track loading and time-range indexing.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::GeoError;

const SEMICIRCLE_TO_DEG: f64 = 180.0 / 2_147_483_648.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
}

impl TrackPoint {
    pub fn new(time: DateTime<Utc>, lat: f64, lon: f64, ele: Option<f64>) -> Self {
        Self { time, lat, lon, ele }
    }
}

/// One logical track: every point from a single source file, time ordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TrackFields")]
pub struct Track {
    id: String,
    points: Vec<TrackPoint>,
}

/// Deserialized form, checked through [`Track::new`].
#[derive(Deserialize)]
struct TrackFields {
    id: String,
    points: Vec<TrackPoint>,
}

impl TryFrom<TrackFields> for Track {
    type Error = GeoError;

    fn try_from(fields: TrackFields) -> Result<Self, GeoError> {
        Track::new(fields.id, fields.points)
    }
}

impl Track {
    /// Build a track, sorting points by time. Points sharing a timestamp keep
    /// their source order.
    pub fn new(id: impl Into<String>, mut points: Vec<TrackPoint>) -> Result<Self, GeoError> {
        let id = id.into();
        if points.is_empty() {
            return Err(GeoError::Parse {
                track: id,
                message: "no timestamped points".into(),
            });
        }
        if let Some(bad) = points.iter().find(|p| !valid_coordinates(p.lat, p.lon)) {
            return Err(GeoError::Parse {
                track: id,
                message: format!("coordinates out of range: {}, {}", bad.lat, bad.lon),
            });
        }
        points.sort_by_key(|p| p.time);
        Ok(Self { id, points })
    }

    /// Parse track bytes using the provided format hint (extension).
    pub fn parse(input: &[u8], id: &str, format: &str) -> Result<Self, GeoError> {
        let format_lc = format.to_ascii_lowercase();
        let points = if format_lc.ends_with(".fit") || format_lc == "fit" {
            parse_fit_points(input, id)?
        } else if format_lc.ends_with(".gpx") || format_lc == "gpx" {
            parse_gpx_points(input, id)?
        } else {
            return Err(GeoError::Parse {
                track: id.to_string(),
                message: format!("unsupported file format: {format}"),
            });
        };
        Self::new(id, points)
    }

    /// Read a track file; the identifier is the file stem.
    pub fn from_file(path: &Path) -> Result<Self, GeoError> {
        let data = fs::read(path).map_err(|e| GeoError::io(path, e))?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let hint = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("gpx");
        Self::parse(&data, &id, hint)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.points[0].time
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.points[self.points.len() - 1].time
    }

    pub fn time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start(), self.end())
    }

    /// Inclusive on both ends.
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start() <= time && time <= self.end()
    }

    /// Calendar day encoded in a `YYYY-MM-DD...` identifier, if any.
    pub fn date_hint(&self) -> Option<NaiveDate> {
        let prefix = self.id.get(..10)?;
        NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
    }

    /// Serialize as a single-segment GPX 1.1 document.
    pub fn write_gpx<W: Write>(&self, writer: W) -> Result<(), GeoError> {
        let write_err = |message: String| GeoError::Write {
            track: self.id.clone(),
            message,
        };
        let mut segment = gpx::TrackSegment::new();
        for point in &self.points {
            let mut waypoint = gpx::Waypoint::new(geo_types::Point::new(point.lon, point.lat));
            waypoint.elevation = point.ele;
            waypoint.time = Some(to_gpx_time(point.time).map_err(write_err)?);
            segment.points.push(waypoint);
        }
        let mut track = gpx::Track::new();
        track.name = Some(self.id.clone());
        track.segments.push(segment);

        let doc = gpx::Gpx {
            version: gpx::GpxVersion::Gpx11,
            creator: Some("jpggps".to_string()),
            tracks: vec![track],
            ..Default::default()
        };
        gpx::write(&doc, writer).map_err(|e| write_err(e.to_string()))
    }
}

fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0
}

fn to_gpx_time(time: DateTime<Utc>) -> Result<gpx::Time, String> {
    let nanos = time
        .timestamp_nanos_opt()
        .ok_or_else(|| format!("timestamp out of range: {time}"))?;
    let odt = time::OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
        .map_err(|e| e.to_string())?;
    Ok(gpx::Time::from(odt))
}

fn parse_gpx_points(input: &[u8], id: &str) -> Result<Vec<TrackPoint>, GeoError> {
    let parse_err = |message: String| GeoError::Parse {
        track: id.to_string(),
        message,
    };
    let mut cursor = Cursor::new(input);
    let doc = gpx::read(&mut cursor).map_err(|e| parse_err(e.to_string()))?;
    let mut out = Vec::new();
    let mut untimed = 0usize;

    for track in doc.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else {
                    untimed += 1;
                    continue;
                };
                let iso = time.format().map_err(|e| parse_err(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| parse_err(e.to_string()))?
                    .with_timezone(&Utc);
                let geo = point.point();
                out.push(TrackPoint::new(utc, geo.y(), geo.x(), point.elevation));
            }
        }
    }
    if untimed > 0 {
        debug!("{}: skipped {} points without a timestamp", id, untimed);
    }
    Ok(out)
}

fn parse_fit_points(input: &[u8], id: &str) -> Result<Vec<TrackPoint>, GeoError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;

    let records = from_bytes(input).map_err(|e| GeoError::Parse {
        track: id.to_string(),
        message: e.to_string(),
    })?;
    let mut out = Vec::new();

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut lat: Option<f64> = None;
        let mut lon: Option<f64> = None;
        let mut ele: Option<f64> = None;
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                "position_lat" => lat = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLE_TO_DEG),
                "position_long" => lon = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLE_TO_DEG),
                "altitude" | "enhanced_altitude" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        ele = Some(val);
                    }
                }
                _ => {}
            }
        }
        // Records without a fix carry no position.
        if let (Some(time), Some(lat), Some(lon)) = (timestamp, lat, lon) {
            out.push(TrackPoint::new(time, lat, lon, ele));
        }
    }

    Ok(out)
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

/// Tracks loaded together, sorted by start time with disjoint time ranges.
#[derive(Clone, Debug, Default)]
pub struct TrackStore {
    tracks: Vec<Track>,
}

impl TrackStore {
    /// Load every file as one track. Any parse failure or overlap aborts the load.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, GeoError> {
        let tracks = paths
            .iter()
            .map(|path| Track::from_file(path.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let store = Self::from_tracks(tracks)?;
        info!("Loaded {} tracks", store.len());
        Ok(store)
    }

    pub fn from_tracks(mut tracks: Vec<Track>) -> Result<Self, GeoError> {
        tracks.sort_by_key(|t| t.start());
        for pair in tracks.windows(2) {
            if pair[1].start() <= pair[0].end() {
                return Err(GeoError::Overlap {
                    first: pair[0].id.clone(),
                    second: pair[1].id.clone(),
                });
            }
        }
        for track in &tracks {
            check_date_hint(track);
        }
        Ok(Self { tracks })
    }

    /// The track whose inclusive time range contains `time`, if any.
    pub fn find_segment(&self, time: DateTime<Utc>) -> Option<&Track> {
        let idx = self.tracks.partition_point(|t| t.start() <= time);
        if idx == 0 {
            return None;
        }
        let candidate = &self.tracks[idx - 1];
        (time <= candidate.end()).then_some(candidate)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Write each track to `<dir>/<id>.gpx`, returning the written paths.
    pub fn write_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, GeoError> {
        fs::create_dir_all(dir).map_err(|e| GeoError::io(dir, e))?;
        let mut written = Vec::with_capacity(self.tracks.len());
        for track in &self.tracks {
            let path = dir.join(format!("{}.gpx", track.id));
            let file = fs::File::create(&path).map_err(|e| GeoError::io(&path, e))?;
            track.write_gpx(std::io::BufWriter::new(file))?;
            written.push(path);
        }
        Ok(written)
    }
}

fn check_date_hint(track: &Track) {
    let Some(day) = track.date_hint() else {
        return;
    };
    // The name is local time, the range is UTC: allow a day either side.
    let first = track.start().date_naive().pred_opt().unwrap_or(NaiveDate::MIN);
    let last = track.end().date_naive().succ_opt().unwrap_or(NaiveDate::MAX);
    if day < first || day > last {
        warn!(
            "Track {} covers {} .. {}, which does not match its name",
            track.id,
            track.start(),
            track.end()
        );
    }
}
