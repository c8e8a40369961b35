//! Photo metadata through the `exiftool` command.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, NaiveDateTime, Utc};
use jpggps::{Coordinates, GeoError, GpsStatus, InterpolatedPosition, PhotoMetadata, PhotoRecord};
use serde_json::Value as JsonValue;
use tracing::debug;

const READ_TAGS: [&str; 7] = [
    "-EXIF:DateTimeOriginal",
    "-EXIF:GPSStatus",
    "-EXIF:GPSMeasureMode",
    "-Composite:GPSLatitude",
    "-Composite:GPSLongitude",
    "-Composite:GPSAltitude",
    "-Composite:GPSDateTime",
];

#[derive(Clone, Debug)]
pub struct ExifTool {
    program: PathBuf,
}

impl Default for ExifTool {
    fn default() -> Self {
        Self {
            program: PathBuf::from("exiftool"),
        }
    }
}

impl ExifTool {
    fn run(&self, path: &Path, args: &[String]) -> Result<Vec<u8>, GeoError> {
        let fail = |message: String| GeoError::Metadata {
            path: path.to_path_buf(),
            message,
        };
        let output = Command::new(&self.program)
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| fail(format!("failed to run {}: {}", self.program.display(), e)))?;
        if !output.status.success() {
            return Err(fail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(output.stdout)
    }
}

impl PhotoMetadata for ExifTool {
    fn read(&self, path: &Path) -> Result<PhotoRecord, GeoError> {
        let mut args: Vec<String> = vec!["-j".into(), "-n".into(), "-G".into()];
        args.extend(READ_TAGS.iter().map(|t| t.to_string()));
        let stdout = self.run(path, &args)?;
        parse_record(path, &String::from_utf8_lossy(&stdout))
    }

    fn write_position(&self, path: &Path, position: &InterpolatedPosition) -> Result<(), GeoError> {
        let mut args = vec![
            "-overwrite_original".to_string(),
            "-n".to_string(),
            format!("-GPSLatitude={}", position.lat.abs()),
            format!("-GPSLatitudeRef={}", if position.lat < 0.0 { "S" } else { "N" }),
            format!("-GPSLongitude={}", position.lon.abs()),
            format!("-GPSLongitudeRef={}", if position.lon < 0.0 { "W" } else { "E" }),
            "-GPSStatus=A".to_string(),
            "-GPSMeasureMode=2".to_string(),
        ];
        if let Some(ele) = position.ele {
            args.push(format!("-GPSAltitude={}", ele.abs()));
            args.push(format!("-GPSAltitudeRef={}", if ele < 0.0 { 1 } else { 0 }));
        }
        self.run(path, &args)?;
        debug!("Tagged {} from track {}", path.display(), position.track);
        Ok(())
    }
}

/// Parse `exiftool -j -n -G` output for a single file.
pub fn parse_record(path: &Path, json: &str) -> Result<PhotoRecord, GeoError> {
    let fail = |message: String| GeoError::Metadata {
        path: path.to_path_buf(),
        message,
    };
    let value: JsonValue = serde_json::from_str(json).map_err(|e| fail(e.to_string()))?;
    let obj = value
        .as_array()
        .and_then(|items| items.first())
        .and_then(JsonValue::as_object)
        .ok_or_else(|| fail("unexpected exiftool output".into()))?;
    let text = |key: &str| match obj.get(key) {
        Some(JsonValue::String(s)) => Some(s.trim().to_string()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let number = |key: &str| match obj.get(key) {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    };

    let mut record = PhotoRecord::new(path);
    record.capture_time = text("EXIF:DateTimeOriginal").and_then(|s| parse_exif_time(&s));
    record.gps_time = text("Composite:GPSDateTime")
        .and_then(|s| parse_exif_time(s.trim_end_matches('Z')))
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    if let Some(status) = text("EXIF:GPSStatus") {
        record.gps_status = Some(GpsStatus {
            active: status.eq_ignore_ascii_case("A"),
            measure_mode: number("EXIF:GPSMeasureMode").map(|m| m as u8),
        });
    }
    if let (Some(lat), Some(lon)) = (number("Composite:GPSLatitude"), number("Composite:GPSLongitude")) {
        record.position = Some(Coordinates {
            lat,
            lon,
            ele: number("Composite:GPSAltitude"),
        });
    }
    Ok(record)
}

fn parse_exif_time(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y:%m:%d %H:%M:%S%.f").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_tagged_photo() {
        let json = r#"[{
            "SourceFile": "IMG_0001.JPG",
            "EXIF:DateTimeOriginal": "2016:01:02 10:00:12",
            "EXIF:GPSStatus": "A",
            "EXIF:GPSMeasureMode": 3,
            "Composite:GPSLatitude": 48.4284,
            "Composite:GPSLongitude": -123.3656,
            "Composite:GPSAltitude": 12.5,
            "Composite:GPSDateTime": "2016:01:02 18:00:00Z"
        }]"#;
        let record = parse_record(Path::new("IMG_0001.JPG"), json).unwrap();
        assert_eq!(
            record.capture_time.map(|t| t.to_string()).as_deref(),
            Some("2016-01-02 10:00:12")
        );
        assert_eq!(
            record.gps_time,
            Some(Utc.with_ymd_and_hms(2016, 1, 2, 18, 0, 0).unwrap())
        );
        assert!(record.has_fix());
        assert!(record.is_offset_sample());
        let pos = record.position.unwrap();
        assert_eq!((pos.lat, pos.lon, pos.ele), (48.4284, -123.3656, Some(12.5)));
    }

    #[test]
    fn parses_untagged_photo() {
        let json = r#"[{"SourceFile": "b.jpg", "EXIF:DateTimeOriginal": "2016:01:02 10:00:12.50", "EXIF:GPSStatus": "V", "EXIF:GPSMeasureMode": "2"}]"#;
        let record = parse_record(Path::new("b.jpg"), json).unwrap();
        assert!(record.capture_time.is_some());
        assert_eq!(
            record.gps_status,
            Some(GpsStatus {
                active: false,
                measure_mode: Some(2)
            })
        );
        assert!(record.position.is_none());
        assert!(!record.has_fix());
    }

    #[test]
    fn rejects_unexpected_output() {
        assert!(parse_record(Path::new("c.jpg"), "[]").is_err());
        assert!(parse_record(Path::new("c.jpg"), "Error: File not found").is_err());
    }
}
