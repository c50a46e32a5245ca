use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use timeclock_core::LoopConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Daemon configuration: defaults, then the optional `TIMECLOCK_CONFIG`
/// TOML file, then `TIMECLOCK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a match (strict).
    pub match_threshold: f32,
    pub cooldown: Duration,
    /// Minimum delay between two recognition attempts.
    pub cadence: Duration,
    pub stall_after: Duration,
    /// Frames discarded after the camera starts streaming (AGC/AE settling).
    pub warmup_frames: usize,
    /// A recognition closer than this to the employee's last punch records nothing.
    pub min_punch_interval: Duration,
    pub registry_refresh: Duration,
}

/// Keys accepted in the TOML file. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    cooldown_ms: Option<u64>,
    cadence_ms: Option<u64>,
    stall_after_ms: Option<u64>,
    warmup_frames: Option<usize>,
    min_punch_interval_s: Option<u64>,
    registry_refresh_s: Option<u64>,
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match env("TIMECLOCK_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Some((path, text))
            }
            None => None,
        };
        Self::resolve(file.as_ref().map(|(p, t)| (p.as_path(), t.as_str())), env)
    }

    /// Layer `file` (path, TOML text) and `env` over the defaults.
    fn resolve(
        file: Option<(&Path, &str)>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match file {
            Some((path, text)) => toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            None => FileConfig::default(),
        };

        let data_dir = default_data_dir(&env);

        let config = Self {
            camera_device: env("TIMECLOCK_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir: env("TIMECLOCK_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: env("TIMECLOCK_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("timeclock.db")),
            match_threshold: parsed(&env, "TIMECLOCK_MATCH_THRESHOLD")?
                .or(file.match_threshold)
                .unwrap_or(timeclock_core::DEFAULT_MATCH_THRESHOLD),
            cooldown: Duration::from_millis(
                parsed(&env, "TIMECLOCK_COOLDOWN_MS")?
                    .or(file.cooldown_ms)
                    .unwrap_or(3000),
            ),
            cadence: Duration::from_millis(
                parsed(&env, "TIMECLOCK_CADENCE_MS")?
                    .or(file.cadence_ms)
                    .unwrap_or(250),
            ),
            stall_after: Duration::from_millis(
                parsed(&env, "TIMECLOCK_STALL_AFTER_MS")?
                    .or(file.stall_after_ms)
                    .unwrap_or(10_000),
            ),
            warmup_frames: parsed(&env, "TIMECLOCK_WARMUP_FRAMES")?
                .or(file.warmup_frames)
                .unwrap_or(4),
            min_punch_interval: Duration::from_secs(
                parsed(&env, "TIMECLOCK_MIN_PUNCH_INTERVAL_S")?
                    .or(file.min_punch_interval_s)
                    .unwrap_or(60),
            ),
            registry_refresh: Duration::from_secs(
                parsed(&env, "TIMECLOCK_REGISTRY_REFRESH_S")?
                    .or(file.registry_refresh_s)
                    .unwrap_or(30),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, value: String, reason: &str| ConfigError::Invalid {
            key,
            value,
            reason: reason.to_string(),
        };

        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(invalid(
                "match_threshold",
                self.match_threshold.to_string(),
                "must be a positive number",
            ));
        }
        for (key, value) in [
            ("cooldown_ms", self.cooldown),
            ("cadence_ms", self.cadence),
            ("stall_after_ms", self.stall_after),
            ("registry_refresh_s", self.registry_refresh),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "0".into(), "must be greater than zero"));
            }
        }
        if self.camera_device.trim().is_empty() {
            return Err(invalid("camera_device", self.camera_device.clone(), "must not be empty"));
        }
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            threshold: self.match_threshold,
            cooldown: self.cooldown,
            cadence: self.cadence,
            stall_after: self.stall_after,
        }
    }
}

/// `$XDG_DATA_HOME/timeclock`, falling back to `~/.local/share/timeclock`.
fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("timeclock")
}

fn parsed<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
