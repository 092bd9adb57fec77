use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Radial coefficients used when a config names neither a table file nor inline values.
pub const DEFAULT_COEFFICIENTS: [f32; 3] = [1.0, 0.22, 0.24];

/// Rows carrying pixels versus total rows including blanking on the reference panel.
pub const DEFAULT_ACTIVE_SCANOUT_FRACTION: f64 = 112.0 / 135.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepMode {
    /// Park the thread until the wake point.
    #[default]
    Block,
    /// Spin on the clock until the wake point.
    Spin,
    /// Park until shortly before the wake point, then spin the remainder.
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub throttle: ThrottleSection,
    #[serde(default)]
    pub distortion: DistortionSection,
    #[serde(default)]
    pub diagnostics: DiagnosticsSection,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    pub asynchronous: bool,
    pub front_buffer: bool,
    pub allow_power_save: bool,
    pub minimum_vsyncs: u32,
    pub sliced: bool,
    /// The producer asked for real-time priority; the warp thread demotes it
    /// while it is idle.
    pub realtime_producer: bool,
    pub sleep: SleepMode,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub fence_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub prediction_bias: Duration,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            asynchronous: true,
            front_buffer: true,
            allow_power_save: true,
            minimum_vsyncs: 1,
            sliced: false,
            realtime_producer: false,
            sleep: SleepMode::Block,
            fence_timeout: Duration::from_secs(2),
            prediction_bias: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplaySection {
    pub refresh_hz: f64,
    pub width: u32,
    pub height: u32,
    pub active_scanout_fraction: f64,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            refresh_hz: 60.0,
            width: 1920,
            height: 1080,
            active_scanout_fraction: DEFAULT_ACTIVE_SCANOUT_FRACTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleSection {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub remount_grace: Duration,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            remount_grace: Duration::from_secs(5),
        }
    }
}

/// Either a path to a lens table file or the table inline.
///
/// Leaving the section out selects the built-in lens; a section that is
/// present must name its table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DistortionSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coefficients: Option<Vec<f32>>,
    #[serde(default = "default_chromatic")]
    pub chromatic: [f32; 2],
    #[serde(default = "default_lens_separation")]
    pub lens_separation: f32,
    #[serde(default = "default_tessellation")]
    pub tessellation: [u32; 2],
}

fn default_chromatic() -> [f32; 2] {
    [0.996, 1.014]
}

fn default_lens_separation() -> f32 {
    0.5
}

fn default_tessellation() -> [u32; 2] {
    [32, 32]
}

impl Default for DistortionSection {
    fn default() -> Self {
        Self {
            path: None,
            coefficients: Some(DEFAULT_COEFFICIENTS.to_vec()),
            chromatic: default_chromatic(),
            lens_separation: default_lens_separation(),
            tessellation: default_tessellation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    pub eye_log: bool,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self { eye_log: true }
    }
}

/// A lens table after `path` indirection has been resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionTable {
    pub coefficients: Vec<f32>,
    pub chromatic: [f32; 2],
    pub lens_separation: f32,
    pub tessellation: [u32; 2],
}

/// On-disk lens table. Keys left out fall back to the referencing section.
#[derive(Debug, Clone, Deserialize)]
struct DistortionFile {
    coefficients: Vec<f32>,
    #[serde(default)]
    chromatic: Option<[f32; 2]>,
    #[serde(default)]
    lens_separation: Option<f32>,
    #[serde(default)]
    tessellation: Option<[u32; 2]>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            pipeline: PipelineSection::default(),
            display: DisplaySection::default(),
            throttle: ThrottleSection::default(),
            distortion: DistortionSection::default(),
            diagnostics: DiagnosticsSection::default(),
            base_dir: None,
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() || v.is_infinite() {
                return Err(E::custom("duration must be a finite, non-negative number"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: PipelineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads and validates a config file; a relative distortion `path` resolves
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn vsync_period_nanos(&self) -> f64 {
        1e9 / self.display.refresh_hz
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let pipeline = &self.pipeline;
        if !(1..=4).contains(&pipeline.minimum_vsyncs) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.minimum_vsyncs must be within 1..=4, got {}",
                pipeline.minimum_vsyncs
            )));
        }
        if pipeline.fence_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "pipeline.fence_timeout must be greater than zero".into(),
            ));
        }

        let display = &self.display;
        if !(display.refresh_hz > 0.0 && display.refresh_hz <= 500.0) {
            return Err(ConfigError::Invalid(format!(
                "display.refresh_hz must be within (0, 500], got {}",
                display.refresh_hz
            )));
        }
        if display.width == 0 || display.height == 0 {
            return Err(ConfigError::Invalid(
                "display resolution must be non-zero".into(),
            ));
        }
        if !(display.active_scanout_fraction > 0.0 && display.active_scanout_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "display.active_scanout_fraction must be within (0, 1], got {}",
                display.active_scanout_fraction
            )));
        }

        if self.throttle.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "throttle.poll_interval must be greater than zero".into(),
            ));
        }

        let distortion = &self.distortion;
        match (&distortion.path, &distortion.coefficients) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "distortion must set either `path` or `coefficients`, not both".into(),
                ))
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "distortion must set `path` or `coefficients`; omit the section for the built-in lens"
                        .into(),
                ))
            }
            _ => {}
        }
        if let Some(coefficients) = &distortion.coefficients {
            validate_coefficients(coefficients)?;
        }
        validate_tessellation(distortion.tessellation)?;
        if !(distortion.lens_separation > 0.0 && distortion.lens_separation <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "distortion.lens_separation is a fraction of screen width, got {}",
                distortion.lens_separation
            )));
        }

        Ok(())
    }

    /// Resolves the distortion section, reading the table file when one is named.
    pub fn distortion_table(&self) -> Result<DistortionTable, ConfigError> {
        let section = &self.distortion;
        let Some(path) = &section.path else {
            let coefficients = section.coefficients.clone().ok_or_else(|| {
                ConfigError::Invalid("distortion must set `path` or `coefficients`".into())
            })?;
            return Ok(DistortionTable {
                coefficients,
                chromatic: section.chromatic,
                lens_separation: section.lens_separation,
                tessellation: section.tessellation,
            });
        };

        let resolved = match &self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.clone(),
        };
        let contents = fs::read_to_string(&resolved).map_err(|source| ConfigError::Io {
            path: resolved.clone(),
            source,
        })?;
        let file: DistortionFile = toml::from_str(&contents)?;
        validate_coefficients(&file.coefficients)?;
        let tessellation = file.tessellation.unwrap_or(section.tessellation);
        validate_tessellation(tessellation)?;

        Ok(DistortionTable {
            coefficients: file.coefficients,
            chromatic: file.chromatic.unwrap_or(section.chromatic),
            lens_separation: file.lens_separation.unwrap_or(section.lens_separation),
            tessellation,
        })
    }
}

fn validate_coefficients(coefficients: &[f32]) -> Result<(), ConfigError> {
    if coefficients.is_empty() {
        return Err(ConfigError::Invalid(
            "distortion coefficients must not be empty".into(),
        ));
    }
    if coefficients.iter().any(|k| !k.is_finite()) {
        return Err(ConfigError::Invalid(
            "distortion coefficients must be finite".into(),
        ));
    }
    Ok(())
}

fn validate_tessellation(tessellation: [u32; 2]) -> Result<(), ConfigError> {
    if tessellation[0] < 2 || tessellation[1] < 2 {
        return Err(ConfigError::Invalid(format!(
            "distortion.tessellation must be at least 2x2, got {}x{}",
            tessellation[0], tessellation[1]
        )));
    }
    Ok(())
}
