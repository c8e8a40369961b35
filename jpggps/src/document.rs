//! KML output document and the keyed merge of new tracks and placemarks into it.
//!
//! Tracks are keyed by track identifier, photo placemarks by source path. A
//! document read from disk keeps the original XML text of every entry, so
//! entries the merge does not touch are written back byte for byte.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::geotag::PhotoResult;
use crate::photo::Coordinates;
use crate::track::{Track, TrackPoint};
use crate::GeoError;

const KML_NS: &str = "http://www.opengis.net/kml/2.2";
const GX_NS: &str = "http://www.google.com/kml/ext/2.2";
const DEFAULT_NAME: &str = "JPEG GPS Position track";
const CAMERA_ICON: &str = "http://maps.google.com/mapfiles/kml/shapes/camera.png";
/// aabbggrr line colours assigned to successive tracks.
const LINE_COLORS: [&str; 6] = [
    "bfff3f3f", "7f00ff00", "7f0000ff", "7fffff00", "7fff00ff", "7f00ffff",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DocumentState {
    /// Fresh document, nothing added yet.
    Empty,
    /// Read from disk and unchanged since.
    Loaded,
    /// Holds entries that are not on disk.
    Modified,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    Inserted,
    Skipped,
    Replaced,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub skipped_keys: Vec<String>,
}

impl MergeReport {
    fn record(&mut self, key: &str, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Replaced => self.replaced += 1,
            MergeOutcome::Skipped => {
                self.skipped += 1;
                self.skipped_keys.push(key.to_string());
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackEntry {
    pub key: String,
    pub description: Option<String>,
    pub points: Vec<TrackPoint>,
    raw: Option<String>,
}

impl TrackEntry {
    pub fn new(key: impl Into<String>, points: Vec<TrackPoint>) -> Self {
        Self {
            key: key.into(),
            description: None,
            points,
            raw: None,
        }
    }

    pub fn from_track(track: &Track) -> Self {
        let mut entry = Self::new(track.id(), track.points().to_vec());
        entry.description = Some(format!(
            "Path taken while acquiring the pictures in {}",
            track.id()
        ));
        entry
    }

    /// Source text when the entry came from a loaded document.
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Placemark {
    /// Source photo path.
    pub key: String,
    pub name: String,
    pub time: Option<DateTime<Utc>>,
    pub coordinates: Coordinates,
    pub description: Option<String>,
    raw: Option<String>,
}

impl Placemark {
    pub fn for_photo(
        photo: &Path,
        time: Option<DateTime<Utc>>,
        coordinates: Coordinates,
        base_url: Option<&str>,
    ) -> Self {
        let name = photo
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = photo
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let description = base_url.map(|base| {
            format!(
                "<img src=\"{}\" width=400/><br/>{}<br/>",
                join_url(base, &file_name),
                file_name
            )
        });
        Self {
            key: photo.to_string_lossy().into_owned(),
            name,
            time,
            coordinates,
            description,
            raw: None,
        }
    }

    /// Placemark for a photo that ended up with a position, located or embedded.
    pub fn from_result(result: &PhotoResult, base_url: Option<&str>) -> Option<Self> {
        let coordinates = result.coordinates()?;
        Some(Self::for_photo(&result.path, result.utc, coordinates, base_url))
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }
}

fn join_url(base: &str, file: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{file}")
    } else {
        format!("{base}/{file}")
    }
}

#[derive(Clone, Debug)]
pub struct KmlDocument {
    state: DocumentState,
    name: String,
    description: Option<String>,
    tracks: BTreeMap<String, TrackEntry>,
    placemarks: BTreeMap<String, Placemark>,
    /// Loaded placemarks with other geometry, kept as raw XML.
    others: Vec<String>,
}

impl Default for KmlDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl KmlDocument {
    pub fn new() -> Self {
        Self {
            state: DocumentState::Empty,
            name: DEFAULT_NAME.to_string(),
            description: None,
            tracks: BTreeMap::new(),
            placemarks: BTreeMap::new(),
            others: Vec::new(),
        }
    }

    /// Read `path` if it exists, otherwise start an empty document.
    pub fn load_or_new(path: &Path) -> Result<Self, GeoError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path).map_err(|e| GeoError::io(path, e))?;
        let doc = Self::parse(&text)?;
        info!(
            "Loaded {} ({} tracks, {} placemarks)",
            path.display(),
            doc.tracks.len(),
            doc.placemarks.len()
        );
        Ok(doc)
    }

    pub fn parse(xml: &str) -> Result<Self, GeoError> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| GeoError::Document(format!("XML parse error: {e}")))?;
        let root = doc.root_element();
        if root.tag_name().name() != "kml" {
            return Err(GeoError::Document("root element must be <kml>".into()));
        }
        let document = child(root, "Document")
            .ok_or_else(|| GeoError::Document("missing <Document>".into()))?;

        let mut out = Self::new();
        out.state = DocumentState::Loaded;
        if let Some(name) = child_text(document, "name") {
            out.name = name;
        }
        out.description = child_text(document, "description");

        for node in document
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "Placemark")
        {
            let raw = xml[node.range()].to_string();
            if let Some(track) = descendant(node, "Track") {
                let key = child_text(node, "name")
                    .ok_or_else(|| GeoError::Document("track placemark without <name>".into()))?;
                let entry = TrackEntry {
                    points: parse_gx_track(track, &key)?,
                    description: child_text(node, "description"),
                    key: key.clone(),
                    raw: Some(raw),
                };
                insert_loaded(&mut out.tracks, key, entry);
            } else if let Some(point) = descendant(node, "Point") {
                let text = descendant(point, "coordinates")
                    .and_then(|n| n.text())
                    .ok_or_else(|| GeoError::Document("<Point> without <coordinates>".into()))?;
                let name = child_text(node, "name").unwrap_or_default();
                let key = source_key(node).unwrap_or_else(|| name.clone());
                if key.is_empty() {
                    return Err(GeoError::Document("placemark without name or source".into()));
                }
                let placemark = Placemark {
                    coordinates: parse_point(text)?,
                    time: descendant(node, "TimeStamp")
                        .and_then(|ts| child_text(ts, "when"))
                        .and_then(|when| parse_when(&when)),
                    description: child_text(node, "description"),
                    name,
                    key: key.clone(),
                    raw: Some(raw),
                };
                insert_loaded(&mut out.placemarks, key, placemark);
            } else {
                debug!("Keeping placemark without point or track as is");
                out.others.push(raw);
            }
        }
        Ok(out)
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn is_modified(&self) -> bool {
        self.state == DocumentState::Modified
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    pub fn track(&self, key: &str) -> Option<&TrackEntry> {
        self.tracks.get(key)
    }

    pub fn placemark(&self, key: &str) -> Option<&Placemark> {
        self.placemarks.get(key)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackEntry> {
        self.tracks.values()
    }

    pub fn placemarks(&self) -> impl Iterator<Item = &Placemark> {
        self.placemarks.values()
    }

    /// Raw XML of loaded placemarks that are neither tracks nor points.
    pub fn others(&self) -> &[String] {
        &self.others
    }

    pub fn merge_track(&mut self, entry: TrackEntry, replace: bool) -> MergeOutcome {
        let outcome = merge_entry(&mut self.tracks, entry.key.clone(), entry, replace);
        self.note(outcome);
        outcome
    }

    pub fn merge_placemark(&mut self, placemark: Placemark, replace: bool) -> MergeOutcome {
        let outcome = merge_entry(&mut self.placemarks, placemark.key.clone(), placemark, replace);
        self.note(outcome);
        outcome
    }

    /// Merge candidates in key order so skip/replace decisions are reproducible.
    pub fn merge_all(
        &mut self,
        mut tracks: Vec<TrackEntry>,
        mut placemarks: Vec<Placemark>,
        replace: bool,
    ) -> MergeReport {
        tracks.sort_by(|a, b| a.key.cmp(&b.key));
        placemarks.sort_by(|a, b| a.key.cmp(&b.key));

        let mut report = MergeReport::default();
        for entry in tracks {
            let key = entry.key.clone();
            let outcome = self.merge_track(entry, replace);
            report.record(&key, outcome);
        }
        for placemark in placemarks {
            let key = placemark.key.clone();
            let outcome = self.merge_placemark(placemark, replace);
            report.record(&key, outcome);
        }
        report
    }

    fn note(&mut self, outcome: MergeOutcome) {
        if outcome != MergeOutcome::Skipped {
            self.state = DocumentState::Modified;
        }
    }

    /// Write the document to `path` only when it holds unsaved changes.
    /// Returns whether anything was written.
    pub fn save_if_modified(&mut self, path: &Path) -> Result<bool, GeoError> {
        if !self.is_modified() {
            debug!("{} unchanged, not rewriting", path.display());
            return Ok(false);
        }
        fs::write(path, self.to_kml()).map_err(|e| GeoError::io(path, e))?;
        self.state = DocumentState::Loaded;
        info!("Wrote {}", path.display());
        Ok(true)
    }

    pub fn to_kml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!("<kml xmlns=\"{KML_NS}\" xmlns:gx=\"{GX_NS}\">\n"));
        xml.push_str("  <Document>\n");
        xml.push_str(&format!("    <name>{}</name>\n", escape_xml(&self.name)));
        if let Some(desc) = &self.description {
            xml.push_str(&format!("    <description>{}</description>\n", text_or_cdata(desc)));
        }
        xml.push_str("    <visibility>1</visibility>\n");
        xml.push_str("    <open>1</open>\n");
        push_styles(&mut xml);

        xml.push_str("    <Folder>\n      <name>Tracks</name>\n");
        for (idx, entry) in self.tracks.values().enumerate() {
            match &entry.raw {
                Some(raw) => push_raw(&mut xml, raw),
                None => push_track(&mut xml, entry, idx % LINE_COLORS.len()),
            }
        }
        xml.push_str("    </Folder>\n");

        xml.push_str("    <Folder>\n      <name>Photos</name>\n");
        for placemark in self.placemarks.values() {
            match &placemark.raw {
                Some(raw) => push_raw(&mut xml, raw),
                None => push_placemark(&mut xml, placemark),
            }
        }
        xml.push_str("    </Folder>\n");

        if !self.others.is_empty() {
            xml.push_str("    <Folder>\n      <name>Other</name>\n");
            for raw in &self.others {
                push_raw(&mut xml, raw);
            }
            xml.push_str("    </Folder>\n");
        }
        xml.push_str("  </Document>\n");
        xml.push_str("</kml>\n");
        xml
    }
}

fn merge_entry<E>(
    map: &mut BTreeMap<String, E>,
    key: String,
    entry: E,
    replace: bool,
) -> MergeOutcome {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(entry);
            MergeOutcome::Inserted
        }
        Entry::Occupied(mut slot) if replace => {
            debug!("Replacing {}", slot.key());
            slot.insert(entry);
            MergeOutcome::Replaced
        }
        Entry::Occupied(slot) => {
            info!("Skipping {}: already present", slot.key());
            MergeOutcome::Skipped
        }
    }
}

fn insert_loaded<E>(map: &mut BTreeMap<String, E>, key: String, entry: E) {
    if map.contains_key(&key) {
        warn!("Duplicate entry {} in loaded document, keeping the first", key);
        return;
    }
    map.insert(key, entry);
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn descendant<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text(node: roxmltree::Node, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn source_key(placemark: roxmltree::Node) -> Option<String> {
    let data = placemark
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Data" && n.attribute("name") == Some("source"))?;
    child_text(data, "value")
}

fn parse_when(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    // Zone-less times are taken as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_gx_track(track: roxmltree::Node, key: &str) -> Result<Vec<TrackPoint>, GeoError> {
    let elements = || track.children().filter(|n| n.is_element());
    let whens: Vec<&str> = elements()
        .filter(|n| n.tag_name().name() == "when")
        .map(|n| n.text().unwrap_or("").trim())
        .collect();
    let coords: Vec<&str> = elements()
        .filter(|n| n.tag_name().name() == "coord")
        .map(|n| n.text().unwrap_or("").trim())
        .collect();
    if whens.len() != coords.len() {
        return Err(GeoError::Document(format!(
            "track {key}: {} <when> but {} <gx:coord>",
            whens.len(),
            coords.len()
        )));
    }

    whens
        .iter()
        .zip(coords.iter())
        .map(|(when, coord)| {
            let time = parse_when(when)
                .ok_or_else(|| GeoError::Document(format!("track {key}: bad time {when:?}")))?;
            let values = parse_numbers(coord.split_whitespace(), coord)?;
            Ok(TrackPoint::new(time, values.1, values.0, values.2))
        })
        .collect()
}

fn parse_point(text: &str) -> Result<Coordinates, GeoError> {
    let (lon, lat, ele) = parse_numbers(text.trim().split(','), text)?;
    Ok(Coordinates { lat, lon, ele })
}

/// `lon lat [alt]` from any separator split.
fn parse_numbers<'a>(
    parts: impl Iterator<Item = &'a str>,
    source: &str,
) -> Result<(f64, f64, Option<f64>), GeoError> {
    let values = parts
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| GeoError::Document(format!("bad coordinates {source:?}")))?;
    match values.as_slice() {
        [lon, lat] => Ok((*lon, *lat, None)),
        [lon, lat, alt] => Ok((*lon, *lat, Some(*alt))),
        _ => Err(GeoError::Document(format!("bad coordinates {source:?}"))),
    }
}

fn format_when(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn push_styles(xml: &mut String) {
    xml.push_str("    <Style id=\"picture\">\n");
    xml.push_str("      <IconStyle id=\"picture_style\">\n");
    xml.push_str("        <scale>1.0</scale>\n");
    xml.push_str(&format!("        <Icon><href>{CAMERA_ICON}</href></Icon>\n"));
    xml.push_str("      </IconStyle>\n");
    xml.push_str("    </Style>\n");
    for (idx, normal) in LINE_COLORS.iter().enumerate() {
        let highlight = format!("ff{}", &normal[2..]);
        for (suffix, color, width) in [("n", normal.to_string(), 6), ("h", highlight, 8)] {
            xml.push_str(&format!("    <Style id=\"color{idx}_{suffix}\">\n"));
            xml.push_str("      <IconStyle><Icon/></IconStyle>\n");
            xml.push_str(&format!(
                "      <LineStyle><color>{color}</color><width>{width}</width></LineStyle>\n"
            ));
            xml.push_str("    </Style>\n");
        }
        xml.push_str(&format!("    <StyleMap id=\"color{idx}\">\n"));
        xml.push_str(&format!(
            "      <Pair><key>normal</key><styleUrl>#color{idx}_n</styleUrl></Pair>\n"
        ));
        xml.push_str(&format!(
            "      <Pair><key>highlight</key><styleUrl>#color{idx}_h</styleUrl></Pair>\n"
        ));
        xml.push_str("    </StyleMap>\n");
    }
}

fn push_raw(xml: &mut String, raw: &str) {
    xml.push_str("      ");
    xml.push_str(raw);
    xml.push('\n');
}

fn push_track(xml: &mut String, entry: &TrackEntry, color: usize) {
    xml.push_str("      <Placemark>\n");
    xml.push_str(&format!("        <name>{}</name>\n", escape_xml(&entry.key)));
    if let Some(desc) = &entry.description {
        xml.push_str(&format!("        <description>{}</description>\n", text_or_cdata(desc)));
    }
    xml.push_str("        <visibility>1</visibility>\n");
    xml.push_str(&format!("        <styleUrl>#color{color}</styleUrl>\n"));
    xml.push_str("        <gx:Track>\n");
    xml.push_str("          <altitudeMode>clampToGround</altitudeMode>\n");
    for point in &entry.points {
        xml.push_str(&format!("          <when>{}</when>\n", format_when(point.time)));
    }
    for point in &entry.points {
        xml.push_str(&format!(
            "          <gx:coord>{} {} {}</gx:coord>\n",
            point.lon,
            point.lat,
            point.ele.unwrap_or(0.0)
        ));
    }
    xml.push_str("        </gx:Track>\n");
    xml.push_str("      </Placemark>\n");
}

fn push_placemark(xml: &mut String, placemark: &Placemark) {
    xml.push_str("      <Placemark>\n");
    xml.push_str(&format!("        <name>{}</name>\n", escape_xml(&placemark.name)));
    xml.push_str("        <visibility>1</visibility>\n");
    xml.push_str("        <styleUrl>#picture</styleUrl>\n");
    if let Some(desc) = &placemark.description {
        xml.push_str(&format!("        <description>{}</description>\n", text_or_cdata(desc)));
    }
    if let Some(time) = placemark.time {
        xml.push_str(&format!(
            "        <TimeStamp><when>{}</when></TimeStamp>\n",
            format_when(time)
        ));
    }
    xml.push_str(&format!(
        "        <ExtendedData><Data name=\"source\"><value>{}</value></Data></ExtendedData>\n",
        escape_xml(&placemark.key)
    ));
    let c = &placemark.coordinates;
    let coords = match c.ele {
        Some(ele) => format!("{},{},{}", c.lon, c.lat, ele),
        None => format!("{},{}", c.lon, c.lat),
    };
    xml.push_str(&format!(
        "        <Point><coordinates>{coords}</coordinates></Point>\n"
    ));
    xml.push_str("      </Placemark>\n");
}

fn text_or_cdata(text: &str) -> String {
    if text.contains('<') {
        format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
    } else {
        escape_xml(text)
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
