//! Runner configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use lazyscale_core::geometry::{DEFAULT_INPUT_SIZE, DEFAULT_MIN_DIMENSION, DEFAULT_SCALE_FACTOR};
use lazyscale_core::locator::DEFAULT_RELAY_ENDPOINT;
use lazyscale_core::retry::RetryConfig;
use lazyscale_pipeline::PipelineConfig;
use lazyscale_queue::QueueConfig;
use lazyscale_watcher::{WatcherConfig, DEFAULT_PRELOAD_MARGIN_PX};

/// Extra time the queue allows past the attempt timeout before it drops a
/// job outright.
const QUEUE_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration.
///
/// All fields have defaults that suit a local run against `manifest.json`
/// in the working directory.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Document manifest to process.
    pub manifest: PathBuf,
    /// Directory the upscaled PNGs are written to.
    pub output_dir: PathBuf,
    pub input_size: u32,
    pub scale_factor: u32,
    pub min_dimension: u32,
    pub relay_endpoint: String,
    pub preload_margin_px: f64,
    pub seed: Option<u64>,
    /// Decoder weights file; takes precedence over `seed`.
    pub weights: Option<PathBuf>,
    pub job_timeout: Option<Duration>,
    pub max_attempts: u32,
    /// Distance scrolled between visibility passes.
    pub scroll_step_px: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("manifest.json"),
            output_dir: PathBuf::from("upscaled"),
            input_size: DEFAULT_INPUT_SIZE,
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_dimension: DEFAULT_MIN_DIMENSION,
            relay_endpoint: DEFAULT_RELAY_ENDPOINT.to_string(),
            preload_margin_px: DEFAULT_PRELOAD_MARGIN_PX,
            seed: None,
            weights: None,
            job_timeout: None,
            max_attempts: RetryConfig::default().max_attempts,
            scroll_step_px: 400.0,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                          |
    /// |-------------------------------|----------------------------------|
    /// | `LAZYSCALE_MANIFEST`          | `manifest.json`                  |
    /// | `LAZYSCALE_OUTPUT_DIR`        | `upscaled`                       |
    /// | `LAZYSCALE_INPUT_SIZE`        | `384`                            |
    /// | `LAZYSCALE_SCALE_FACTOR`      | `2`                              |
    /// | `LAZYSCALE_MIN_DIMENSION`     | `64`                             |
    /// | `LAZYSCALE_RELAY_ENDPOINT`    | `https://api.allorigins.win/raw` |
    /// | `LAZYSCALE_PRELOAD_MARGIN_PX` | `500`                            |
    /// | `LAZYSCALE_SEED`              | unset (random)                   |
    /// | `LAZYSCALE_WEIGHTS`           | unset                            |
    /// | `LAZYSCALE_JOB_TIMEOUT_SECS`  | unset (no timeout)               |
    /// | `LAZYSCALE_MAX_ATTEMPTS`      | `3`                              |
    /// | `LAZYSCALE_SCROLL_STEP_PX`    | `400`                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`WorkerConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let config = Self {
            manifest: get("LAZYSCALE_MANIFEST")
                .map(PathBuf::from)
                .unwrap_or(defaults.manifest),
            output_dir: get("LAZYSCALE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            input_size: parse(&get, "LAZYSCALE_INPUT_SIZE")?.unwrap_or(defaults.input_size),
            scale_factor: parse(&get, "LAZYSCALE_SCALE_FACTOR")?.unwrap_or(defaults.scale_factor),
            min_dimension: parse(&get, "LAZYSCALE_MIN_DIMENSION")?
                .unwrap_or(defaults.min_dimension),
            relay_endpoint: get("LAZYSCALE_RELAY_ENDPOINT").unwrap_or(defaults.relay_endpoint),
            preload_margin_px: parse(&get, "LAZYSCALE_PRELOAD_MARGIN_PX")?
                .unwrap_or(defaults.preload_margin_px),
            seed: parse(&get, "LAZYSCALE_SEED")?,
            weights: get("LAZYSCALE_WEIGHTS").map(PathBuf::from),
            job_timeout: parse::<u64>(&get, "LAZYSCALE_JOB_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            max_attempts: parse(&get, "LAZYSCALE_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            scroll_step_px: parse(&get, "LAZYSCALE_SCROLL_STEP_PX")?
                .unwrap_or(defaults.scroll_step_px),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("LAZYSCALE_INPUT_SIZE", self.input_size as f64),
            ("LAZYSCALE_SCALE_FACTOR", self.scale_factor as f64),
            ("LAZYSCALE_MAX_ATTEMPTS", self.max_attempts as f64),
            ("LAZYSCALE_SCROLL_STEP_PX", self.scroll_step_px),
        ];
        for (var, value) in positive {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.preload_margin_px.is_nan() || self.preload_margin_px < 0.0 {
            return Err(ConfigError::Invalid {
                var: "LAZYSCALE_PRELOAD_MARGIN_PX",
                value: self.preload_margin_px.to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            input_size: self.input_size,
            scale_factor: self.scale_factor,
            min_dimension: self.min_dimension,
            relay_endpoint: self.relay_endpoint.clone(),
            seed: self.seed,
            weights_path: self.weights.clone(),
            ..Default::default()
        }
    }

    /// The watcher enforces `job_timeout` per attempt. The queue only steps
    /// in for a job that overran it by more than the grace period.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            job_timeout: self.job_timeout.map(|limit| limit + QUEUE_TIMEOUT_GRACE),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            preload_margin_px: self.preload_margin_px,
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
            attempt_timeout: self.job_timeout,
            ..Default::default()
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|var| env.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.manifest, PathBuf::from("manifest.json"));
        assert_eq!(config.input_size, 384);
        assert_eq!(config.scale_factor, 2);
        assert_eq!(config.min_dimension, 64);
        assert_eq!(config.relay_endpoint, "https://api.allorigins.win/raw");
        assert_eq!(config.preload_margin_px, 500.0);
        assert_eq!(config.max_attempts, 3);
        assert!(config.seed.is_none());
        assert!(config.job_timeout.is_none());
    }

    #[test]
    fn values_are_parsed() {
        let config = load(&[
            ("LAZYSCALE_INPUT_SIZE", "256"),
            ("LAZYSCALE_SEED", "42"),
            ("LAZYSCALE_JOB_TIMEOUT_SECS", " 90 "),
            ("LAZYSCALE_WEIGHTS", "/models/decoder.json"),
            ("LAZYSCALE_PRELOAD_MARGIN_PX", "0"),
        ])
        .unwrap();
        assert_eq!(config.input_size, 256);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.weights, Some(PathBuf::from("/models/decoder.json")));
        assert_eq!(config.preload_margin_px, 0.0);
    }

    #[test]
    fn job_timeout_bounds_attempts_before_the_queue() {
        let config = load(&[("LAZYSCALE_JOB_TIMEOUT_SECS", "30")]).unwrap();
        assert_eq!(config.watcher_config().attempt_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.queue_config().job_timeout, Some(Duration::from_secs(35)));

        let unbounded = load(&[]).unwrap();
        assert!(unbounded.watcher_config().attempt_timeout.is_none());
        assert!(unbounded.queue_config().job_timeout.is_none());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("LAZYSCALE_SCALE_FACTOR", "  "), ("LAZYSCALE_OUTPUT_DIR", "")]).unwrap();
        assert_eq!(config.scale_factor, 2);
        assert_eq!(config.output_dir, PathBuf::from("upscaled"));
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        assert_matches!(
            load(&[("LAZYSCALE_MAX_ATTEMPTS", "many")]),
            Err(ConfigError::Invalid { var: "LAZYSCALE_MAX_ATTEMPTS", .. })
        );
    }

    #[test]
    fn zero_scale_factor_is_rejected() {
        assert_matches!(
            load(&[("LAZYSCALE_SCALE_FACTOR", "0")]),
            Err(ConfigError::Invalid { var: "LAZYSCALE_SCALE_FACTOR", .. })
        );
    }

    #[test]
    fn negative_margin_is_rejected() {
        assert_matches!(
            load(&[("LAZYSCALE_PRELOAD_MARGIN_PX", "-1")]),
            Err(ConfigError::Invalid { var: "LAZYSCALE_PRELOAD_MARGIN_PX", .. })
        );
    }

    #[test]
    fn derived_configs_carry_settings() {
        let config = load(&[("LAZYSCALE_MAX_ATTEMPTS", "1"), ("LAZYSCALE_SEED", "7")]).unwrap();
        assert_eq!(config.watcher_config().retry.max_attempts, 1);
        assert_eq!(config.pipeline_config().seed, Some(7));
        assert_eq!(config.pipeline_config().input_size, 384);
    }
}
