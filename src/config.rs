//! YAML configuration and hot reload.
//!
//! ```yaml
//! capture:
//!   device: 0
//!   width: 1280
//!   height: 720
//! ingest:
//!   profile: bt709            # or { coefficients: [...], range: full }
//!   output-rotation: rotate-right
//!   busy-policy: block        # or drop
//!   busy-timeout-ms: 100
//! beautify:
//!   smoothing: { radius: 4, distance-normalization: 4.0 }
//!   tone: { brightness: 0.1, saturation: 0.1 }
//! ```

use crate::capture::CaptureConfig;
use crate::color::{ColorRange, ConversionMatrix, ConversionProfile, MatrixError};
use crate::filter::BeautifyParams;
use crate::frame::Orientation;
use crate::ingest::{BusyPolicy, IngestConfig};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::{error, info, warn};

/// Whole configuration document. Every field has a default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub capture: CaptureConfig,
    pub ingest: IngestSettings,
    pub beautify: BeautifyParams,
}

/// Ingestion settings as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IngestSettings {
    pub profile: ProfileSetting,
    pub output_rotation: Orientation,
    pub busy_policy: BusyPolicySetting,
    pub busy_timeout_ms: u64,
    pub paused: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            profile: ProfileSetting::default(),
            output_rotation: Orientation::None,
            busy_policy: BusyPolicySetting::Block,
            busy_timeout_ms: BusyPolicy::DEFAULT_TIMEOUT.as_millis() as u64,
            paused: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicySetting {
    Block,
    Drop,
}

/// A named preset or a custom coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSetting {
    Named(NamedProfile),
    Custom {
        coefficients: Vec<f32>,
        #[serde(default = "default_range")]
        range: ColorRange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NamedProfile {
    #[default]
    #[serde(rename = "bt601-limited")]
    Bt601Limited,
    #[serde(rename = "bt601-full")]
    Bt601Full,
    #[serde(rename = "bt709")]
    Bt709,
}

fn default_range() -> ColorRange {
    ColorRange::Limited
}

impl Default for ProfileSetting {
    fn default() -> Self {
        ProfileSetting::Named(NamedProfile::default())
    }
}

impl ProfileSetting {
    pub fn to_profile(&self) -> Result<ConversionProfile, MatrixError> {
        Ok(match self {
            ProfileSetting::Named(NamedProfile::Bt601Limited) => ConversionProfile::Bt601Limited,
            ProfileSetting::Named(NamedProfile::Bt601Full) => ConversionProfile::Bt601Full,
            ProfileSetting::Named(NamedProfile::Bt709) => ConversionProfile::Bt709,
            ProfileSetting::Custom { coefficients, range } => {
                ConversionProfile::Custom(ConversionMatrix::from_slice(coefficients, *range)?)
            }
        })
    }
}

impl IngestSettings {
    pub fn busy_policy(&self) -> BusyPolicy {
        match self.busy_policy {
            BusyPolicySetting::Block => BusyPolicy::Block { timeout: Duration::from_millis(self.busy_timeout_ms) },
            BusyPolicySetting::Drop => BusyPolicy::Drop,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config {:?}", path))
    }

    /// Parse and validate a YAML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ingest.profile.to_profile()?;
        self.beautify.validate()?;
        Ok(())
    }

    /// Settings for [`FrameSource::spawn`](crate::ingest::FrameSource::spawn).
    pub fn ingest_config(&self) -> Result<IngestConfig> {
        Ok(IngestConfig {
            profile: self.ingest.profile.to_profile()?,
            output_rotation: self.ingest.output_rotation,
            busy_policy: self.ingest.busy_policy(),
            paused: self.ingest.paused,
            beautify: self.beautify,
        })
    }
}

/// A configuration file and the last version of it that parsed.
pub struct ConfigFile {
    path: PathBuf,
    current: Option<Config>,
}

impl ConfigFile {
    pub fn open(path: &Path) -> Self {
        Self { path: path.to_path_buf(), current: Config::load(path).ok() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Option<&Config> {
        self.current.as_ref()
    }

    /// Re-read the file. Returns `(old, new)` if it parses and differs; a
    /// broken file keeps the previous version.
    pub fn reload(&mut self) -> Option<(Option<Config>, Config)> {
        match Config::load(&self.path) {
            Ok(next) if self.current.as_ref() == Some(&next) => None,
            Ok(next) => {
                let old = self.current.replace(next.clone());
                Some((old, next))
            }
            Err(e) => {
                error!("Keeping previous config: {:#}", e);
                None
            }
        }
    }
}

/// Watches the configuration file and hands back changed documents.
pub struct ConfigWatcher {
    file: ConfigFile,
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
}

impl ConfigWatcher {
    /// Start watching `path`. Returns `None` if the watch cannot be set up.
    pub fn new(path: &Path) -> Option<Self> {
        let (tx, rx) = channel();
        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!("Failed to watch config file {:?}: {}", path, e);
            return None;
        }
        info!("Watching config file {:?} for changes", path);

        Some(Self { file: ConfigFile::open(path), _watcher: watcher, rx })
    }

    /// Drain file events and reload after a modification.
    pub fn check_for_changes(&mut self) -> Option<(Option<Config>, Config)> {
        let mut modified = false;
        while let Ok(event) = self.rx.try_recv() {
            if let Ok(event) = event {
                modified |= matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
            }
        }
        if !modified {
            return None;
        }
        info!("Config file changed, checking for updates...");
        self.file.reload()
    }
}
