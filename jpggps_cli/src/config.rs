use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use jpggps::{ClockCorrection, ClockOffset};
use serde::Deserialize;

pub const DEFAULT_CONFIG: &str = "jpggps.toml";
pub const DEFAULT_KML: &str = "photos.kml";

/// Progress message detail; drives the log filter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    Quiet,
    #[default]
    Normal,
    Debug,
}

impl Progress {
    pub fn level(self) -> &'static str {
        match self {
            Progress::Quiet => "warn",
            Progress::Normal => "info",
            Progress::Debug => "debug",
        }
    }
}

/// Contents of the TOML configuration file.
///
/// ```toml
/// [arguments]
/// timezone = "-08:00"
/// url = "file:///home/me/photos/"
/// output = "trip.kml"
/// progress = "normal"
///
/// [offsets]
/// "/home/me/photos/2016-07" = "-07:00"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub arguments: Arguments,
    /// Per-directory clock offsets.
    pub offsets: BTreeMap<PathBuf, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Arguments {
    pub timezone: Option<String>,
    pub url: Option<String>,
    pub output: Option<PathBuf>,
    pub progress: Option<Progress>,
    pub replace: Option<bool>,
    pub tolerance: Option<i64>,
    pub tracks: Vec<PathBuf>,
}

impl ConfigFile {
    /// Load `path`, or the default config file when none is given. A missing
    /// default file is not an error; a missing explicit one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (expand_home(p), true),
            None => (PathBuf::from(DEFAULT_CONFIG), false),
        };
        if !path.exists() {
            if explicit {
                return Err(anyhow!("config file not found at {}", path.display()));
            }
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Values given on the command line; each one wins over the config file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub timezone: Option<String>,
    pub url: Option<String>,
    pub output: Option<PathBuf>,
    pub progress: Option<Progress>,
    pub replace: bool,
    pub tolerance: Option<i64>,
    pub tracks: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub clock: ClockCorrection,
    /// A clock offset was configured at all.
    pub has_offset: bool,
    pub url: Option<String>,
    pub output: Option<PathBuf>,
    pub progress: Progress,
    pub replace: bool,
    pub tolerance_s: i64,
    pub tracks: Vec<PathBuf>,
}

impl Settings {
    /// Merge command line over config file. Offsets are parsed here so a bad
    /// value stops the run before any photo is touched.
    pub fn resolve(file: &ConfigFile, cli: &Overrides) -> Result<Self> {
        let args = &file.arguments;
        let timezone = cli.timezone.as_ref().or(args.timezone.as_ref());
        let default = match timezone {
            Some(text) => ClockOffset::parse(text).context("invalid --timezone")?,
            None => ClockOffset::ZERO,
        };
        let mut clock = ClockCorrection::fixed(default);
        for (dir, text) in &file.offsets {
            let offset = ClockOffset::parse(text)
                .with_context(|| format!("invalid offset for {}", dir.display()))?;
            clock = clock.with_override(expand_home(dir), offset);
        }

        let tolerance_s = cli
            .tolerance
            .or(args.tolerance)
            .unwrap_or(jpggps::offset::DEFAULT_TOLERANCE_S);
        if tolerance_s < 0 {
            return Err(anyhow!("tolerance must not be negative, got {tolerance_s}"));
        }

        let tracks = if cli.tracks.is_empty() {
            args.tracks.iter().map(|p| expand_home(p)).collect()
        } else {
            cli.tracks.clone()
        };

        Ok(Self {
            clock,
            has_offset: timezone.is_some() || !file.offsets.is_empty(),
            url: cli.url.clone().or_else(|| args.url.clone()),
            output: cli
                .output
                .clone()
                .or_else(|| args.output.as_deref().map(expand_home)),
            progress: cli.progress.or(args.progress).unwrap_or_default(),
            replace: cli.replace || args.replace.unwrap_or(false),
            tolerance_s,
            tracks,
        })
    }

    pub fn kml_output(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KML))
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
