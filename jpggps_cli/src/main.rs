use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use jpggps::geotag::apply;
use jpggps::{
    locate_all, tracks_from_photos, DocumentState, GeoError, GeotagOptions, GeotagSummary, KmlDocument,
    OffsetEstimate, Outcome, PhotoMetadata, PhotoRecord, PhotoResult, Placemark, TrackEntry,
    TrackStore,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

mod config;
mod exiftool;

use config::{ConfigFile, Overrides, Progress, Settings};
use exiftool::ExifTool;

#[derive(Parser, Debug)]
#[command(author, version, about = "Geotag photos from GPS tracks and map them as KML", long_about = None)]
struct Cli {
    /// TOML configuration file with defaults in an [arguments] table
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Progress message detail
    #[arg(short, long, global = true, value_enum)]
    progress: Option<Progress>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate the camera clock offset from GPS-tagged photos or a clock photo
    FindOffset(FindOffsetArgs),
    /// Write one GPX track per photo directory from the photos' own GPS fixes
    MakeGpx(MakeGpxArgs),
    /// Interpolate positions from GPS tracks and write them into the photos
    EditGps(EditGpsArgs),
    /// Add tracks and photo placemarks to a KML document
    MakeKml(MakeKmlArgs),
}

#[derive(Args, Debug)]
struct ClockArgs {
    /// Camera clock offset from UTC, (+/-)hh:mm[:ss] or (+/-)hhmm, e.g. PST = -0800
    #[arg(short, long, allow_hyphen_values = true)]
    timezone: Option<String>,
}

#[derive(Args, Debug)]
struct FindOffsetArgs {
    /// Photos or directories of photos
    #[arg(value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Photo of a clock showing true time
    #[arg(long, requires = "clock", value_hint = ValueHint::FilePath)]
    reference: Option<PathBuf>,

    /// UTC time displayed in the reference photo (RFC 3339 or "YYYY-MM-DD HH:MM:SS")
    #[arg(long, requires = "reference")]
    clock: Option<String>,

    /// Seconds the mode may sit above the most negative offset before it is flagged
    #[arg(long)]
    tolerance: Option<i64>,

    /// Print the estimate as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct MakeGpxArgs {
    /// Photos or directories of photos
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Directory for the GPX files
    #[arg(short, long, default_value = ".", value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,

    #[command(flatten)]
    clock: ClockArgs,
}

#[derive(Args, Debug)]
struct EditGpsArgs {
    /// Photos or directories of photos
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// GPX/FIT track files
    #[arg(long = "track", value_hint = ValueHint::FilePath)]
    tracks: Vec<PathBuf>,

    #[command(flatten)]
    clock: ClockArgs,

    /// Overwrite GPS coordinates already present in a photo
    #[arg(long, action = ArgAction::SetTrue)]
    replace: bool,

    /// Compute positions without writing them
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct MakeKmlArgs {
    /// Photos or directories of photos
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// GPX/FIT track files; without them tracks are built from the photos
    #[arg(long = "track", value_hint = ValueHint::FilePath)]
    tracks: Vec<PathBuf>,

    #[command(flatten)]
    clock: ClockArgs,

    /// Output KML; existing entries are kept
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Base URL for images, e.g. file:///absolute/path/ or http://host/path/
    #[arg(short, long)]
    url: Option<String>,

    /// Replace entries already present in the output
    #[arg(long, action = ArgAction::SetTrue)]
    replace: bool,
}

impl Command {
    fn overrides(&self, progress: Option<Progress>) -> Overrides {
        let mut out = Overrides {
            progress,
            ..Default::default()
        };
        match self {
            Command::FindOffset(args) => out.tolerance = args.tolerance,
            Command::MakeGpx(args) => out.timezone = args.clock.timezone.clone(),
            Command::EditGps(args) => {
                out.timezone = args.clock.timezone.clone();
                out.tracks = args.tracks.clone();
                out.replace = args.replace;
            }
            Command::MakeKml(args) => {
                out.timezone = args.clock.timezone.clone();
                out.tracks = args.tracks.clone();
                out.output = args.output.clone();
                out.url = args.url.clone();
                out.replace = args.replace;
            }
        }
        out
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = ConfigFile::load(cli.config.as_deref())?;
    let settings = Settings::resolve(&file, &cli.command.overrides(cli.progress))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.progress.level()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::FindOffset(args) => handle_find_offset(args, &settings),
        Command::MakeGpx(args) => handle_make_gpx(args, &settings),
        Command::EditGps(args) => handle_edit_gps(args, &settings),
        Command::MakeKml(args) => handle_make_kml(args, &settings),
    }
}

fn handle_find_offset(args: FindOffsetArgs, settings: &Settings) -> Result<()> {
    let metadata = ExifTool::default();
    let estimate = match (args.reference.as_ref(), args.clock.as_ref()) {
        (Some(reference), Some(clock)) => {
            let truth = parse_utc(clock)?;
            let photo = metadata
                .read(reference)
                .with_context(|| format!("failed to read {}", reference.display()))?;
            OffsetEstimate::from_reference(&photo, truth)?
        }
        _ => {
            if args.inputs.is_empty() {
                return Err(anyhow!("no photos supplied"));
            }
            let paths = discover_photos(&args.inputs)?;
            let (photos, failed) = read_photos(&metadata, &paths);
            for (path, reason) in &failed {
                warn!("Skipping {}: {}", path.display(), reason);
            }
            OffsetEstimate::from_population(&photos, settings.tolerance_s).map_err(|err| {
                anyhow!("{err}; supply the offset manually with --timezone instead")
            })?
        }
    };

    if estimate.divergent {
        warn!(
            "Most frequent offset {} differs from the most negative {}",
            estimate.mode, estimate.chosen
        );
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
    } else {
        println!("{}", estimate.report());
    }
    Ok(())
}

fn handle_make_gpx(args: MakeGpxArgs, settings: &Settings) -> Result<()> {
    let metadata = ExifTool::default();
    let paths = discover_photos(&args.inputs)?;
    let (photos, failed) = read_photos(&metadata, &paths);
    for (path, reason) in &failed {
        warn!("Skipping {}: {}", path.display(), reason);
    }
    if !settings.has_offset && photos.iter().any(|p| p.gps_time.is_none()) {
        warn!("No --timezone given; photos without a GPS timestamp are taken as UTC");
    }

    let tracks = tracks_from_photos(&photos, &settings.clock)?;
    if tracks.is_empty() {
        return Err(anyhow!("none of {} photos carries a GPS fix", photos.len()));
    }
    let store = TrackStore::from_tracks(tracks)?;
    for path in store.write_dir(&args.output_dir)? {
        info!("Wrote track: {}", path.display());
    }
    Ok(())
}

fn handle_edit_gps(args: EditGpsArgs, settings: &Settings) -> Result<()> {
    if settings.tracks.is_empty() {
        return Err(anyhow!("no track files supplied (use --track)"));
    }
    if !settings.has_offset {
        warn!("No --timezone given; camera clock is taken to be UTC");
    }
    let store = TrackStore::load(&settings.tracks).context("failed to load tracks")?;

    let metadata = ExifTool::default();
    let paths = discover_photos(&args.inputs)?;
    let (photos, failed) = read_photos(&metadata, &paths);
    let options = GeotagOptions {
        overwrite_existing: settings.replace,
    };
    let mut results = locate_all(&photos, &store, &settings.clock, &options);
    if args.dry_run {
        info!("Dry run: no photo is modified");
    } else {
        apply(&mut results, &metadata);
    }
    results.extend(failed_results(failed));

    report_results(&results, settings.progress, args.dry_run);
    Ok(())
}

fn handle_make_kml(args: MakeKmlArgs, settings: &Settings) -> Result<()> {
    let metadata = ExifTool::default();
    let paths = discover_photos(&args.inputs)?;
    let (photos, failed) = read_photos(&metadata, &paths);

    let store = if settings.tracks.is_empty() {
        TrackStore::from_tracks(tracks_from_photos(&photos, &settings.clock)?)?
    } else {
        TrackStore::load(&settings.tracks).context("failed to load tracks")?
    };

    let mut results = locate_all(&photos, &store, &settings.clock, &GeotagOptions::default());
    results.extend(failed_results(failed));
    let url = settings.url.as_deref();
    let placemarks: Vec<Placemark> = results
        .iter()
        .filter_map(|r| Placemark::from_result(r, url))
        .collect();
    let entries: Vec<TrackEntry> = store.tracks().iter().map(TrackEntry::from_track).collect();

    let output = settings.kml_output();
    let mut doc = KmlDocument::load_or_new(&output)
        .with_context(|| format!("failed to load {}", output.display()))?;
    if doc.state() == DocumentState::Empty {
        doc.set_description(format!(
            "Tracks derived from GPS data for {}",
            describe_inputs(&args.inputs)
        ));
    }
    let report = doc.merge_all(entries, placemarks, settings.replace);
    info!(
        "Merge: {} added, {} replaced, {} already present",
        report.inserted, report.replaced, report.skipped
    );
    doc.save_if_modified(&output)?;

    report_results(&results, settings.progress, false);
    Ok(())
}

fn read_photos<M: PhotoMetadata + Sync>(
    metadata: &M,
    paths: &[PathBuf],
) -> (Vec<PhotoRecord>, Vec<(PathBuf, String)>) {
    let read: Vec<(PathBuf, Result<PhotoRecord, GeoError>)> = paths
        .par_iter()
        .map(|path| (path.clone(), metadata.read(path)))
        .collect();
    let mut photos = Vec::with_capacity(read.len());
    let mut failed = Vec::new();
    for (path, result) in read {
        match result {
            Ok(photo) => photos.push(photo),
            Err(err) => failed.push((path, err.to_string())),
        }
    }
    debug!("Read metadata for {} photos, {} failed", photos.len(), failed.len());
    (photos, failed)
}

fn failed_results(failed: Vec<(PathBuf, String)>) -> impl Iterator<Item = PhotoResult> {
    failed.into_iter().map(|(path, reason)| PhotoResult {
        path,
        utc: None,
        outcome: Outcome::Failed(reason),
    })
}

fn report_results(results: &[PhotoResult], progress: Progress, dry_run: bool) {
    let summary = GeotagSummary::from_results(results);
    if progress != Progress::Quiet {
        for path in &summary.uncovered {
            info!("No covering track: {}", path.display());
        }
    }
    for (path, reason) in &summary.failures {
        warn!("Failed: {}: {}", path.display(), reason);
    }
    println!("{}", summary.describe(dry_run));
}

/// JPEG files named directly, or found below the given directories, sorted.
///
/// Paths are canonical so a photo keeps one identity however it was named on
/// the command line.
fn discover_photos(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        let input = fs::canonicalize(input)
            .with_context(|| format!("{} is not a file or directory", input.display()))?;
        if input.is_file() {
            out.push(input);
        } else if input.is_dir() {
            for entry in WalkDir::new(&input).sort_by_file_name() {
                let entry =
                    entry.with_context(|| format!("failed to scan {}", input.display()))?;
                if entry.file_type().is_file() && is_jpeg(entry.path()) {
                    out.push(entry.into_path());
                }
            }
        } else {
            return Err(anyhow!("{} is not a file or directory", input.display()));
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
        .unwrap_or(false)
}

fn describe_inputs(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// RFC 3339, or a zone-less date and time taken as UTC.
fn parse_utc(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y:%m:%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text.trim(), fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("cannot parse clock time {:?}", text))
}
