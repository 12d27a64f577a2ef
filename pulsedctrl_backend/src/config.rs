//! TOML configuration of the measurement backend.
//!
//! ```toml
//! storage_path = "pulse_objects"
//! data_path = "measurements"
//! timer_interval_s = 0.5
//! compile_timeout_s = 900.0
//!
//! [plugin_roots]
//! sampling_functions = "builtin"
//! extraction_methods = ["lab_extraction", "builtin"]
//! ```
//!
//! Every plugin root entry may be a single name or a list of names. Roots are searched in order
//! after the built-in one, earlier discoveries of a name win.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pulsecompiler_backend::error::{PulsedError, Result};
use pulsecompiler_backend::generator::{GeneratorOptions, DEFAULT_CHUNK_SAMPLES};
use pulsecompiler_backend::predefined::GenerationParameters;

use crate::measurement::MeasurementOptions;

/// A single value or a list of values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginRoots {
    pub sampling_functions: OneOrMany,
    pub predefined_methods: OneOrMany,
    pub extraction_methods: OneOrMany,
    pub analysis_methods: OneOrMany,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsedConfig {
    /// Directory of the stored pulse objects. Objects are kept in memory only when unset.
    pub storage_path: Option<PathBuf>,
    /// Directory saved measurement data goes to. Defaults to `measurement_data` inside
    /// `storage_path`.
    pub data_path: Option<PathBuf>,
    pub plugin_roots: PluginRoots,
    pub timer_interval_s: f64,
    /// Samples per waveform write call, bounds host memory while sampling.
    pub write_chunk_samples: usize,
    /// Capacity of each worker's command queue.
    pub queue_capacity: usize,
    /// How long a blocking call waits for its worker's reply.
    pub reply_timeout_s: f64,
    /// Reply timeout of sampling, loading and predefined generation, which may run for minutes.
    pub compile_timeout_s: f64,
    /// How long starting or resuming waits for the loaded asset to finish compiling.
    pub asset_wait_s: f64,
    pub extraction_method: String,
    pub analysis_method: String,
    pub generation: GenerationParameters,
}

impl Default for PulsedConfig {
    fn default() -> Self {
        PulsedConfig {
            storage_path: None,
            data_path: None,
            plugin_roots: PluginRoots::default(),
            timer_interval_s: 1.0,
            write_chunk_samples: DEFAULT_CHUNK_SAMPLES,
            queue_capacity: 64,
            reply_timeout_s: 30.0,
            compile_timeout_s: 600.0,
            asset_wait_s: 1.0,
            extraction_method: "ungated_threshold".to_string(),
            analysis_method: "mean_norm".to_string(),
            generation: GenerationParameters::default(),
        }
    }
}

impl PulsedConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: PulsedConfig =
            toml::from_str(text).map_err(|err| PulsedError::config(format!("Invalid configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Falls back to the defaults if the file is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    "Using the default configuration, {} could not be loaded: {}",
                    path.as_ref().display(),
                    err
                );
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(PulsedError::config(format!("{} must be positive, got {}", name, value)))
            }
        };
        positive("timer_interval_s", self.timer_interval_s)?;
        positive("reply_timeout_s", self.reply_timeout_s)?;
        positive("compile_timeout_s", self.compile_timeout_s)?;
        if !(self.asset_wait_s >= 0.0) || !self.asset_wait_s.is_finite() {
            return Err(PulsedError::config(format!(
                "asset_wait_s must not be negative, got {}",
                self.asset_wait_s
            )));
        }
        if self.write_chunk_samples == 0 || self.queue_capacity == 0 {
            return Err(PulsedError::config(
                "write_chunk_samples and queue_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_secs_f64(self.timer_interval_s)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.reply_timeout_s)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.compile_timeout_s)
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_path
            .clone()
            .or_else(|| self.storage_path.as_ref().map(|root| root.join("measurement_data")))
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            storage_path: self.storage_path.clone(),
            write_chunk_samples: self.write_chunk_samples,
            sampling_function_roots: self.plugin_roots.sampling_functions.to_vec(),
            predefined_roots: self.plugin_roots.predefined_methods.to_vec(),
            generation_parameters: self.generation.clone(),
        }
    }

    pub fn measurement_options(&self) -> MeasurementOptions {
        MeasurementOptions {
            extraction_roots: self.plugin_roots.extraction_methods.to_vec(),
            analysis_roots: self.plugin_roots.analysis_methods.to_vec(),
            extraction_method: self.extraction_method.clone(),
            analysis_method: self.analysis_method.clone(),
            timer_interval: self.timer_interval(),
            asset_wait: Duration::from_secs_f64(self.asset_wait_s),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roots_accept_one_or_many() {
        let config = PulsedConfig::from_toml(
            r#"
            storage_path = "objects"
            timer_interval_s = 0.5

            [plugin_roots]
            sampling_functions = "builtin"
            extraction_methods = ["lab", "builtin"]

            [generation]
            laser_channel = "d_ch2"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage_path, Some(PathBuf::from("objects")));
        assert_eq!(config.plugin_roots.sampling_functions.to_vec(), vec!["builtin"]);
        assert_eq!(config.plugin_roots.extraction_methods.to_vec(), vec!["lab", "builtin"]);
        assert!(config.plugin_roots.analysis_methods.to_vec().is_empty());
        assert_eq!(config.generation.laser_channel, "d_ch2");
        assert_eq!(config.generation.laser_length, 3e-6);
        assert_eq!(config.measurement_options().timer_interval, Duration::from_millis(500));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.compile_timeout(), Duration::from_secs(600));
        assert_eq!(config.measurement_options().asset_wait, Duration::from_secs(1));
        assert_eq!(config.data_dir(), Some(PathBuf::from("objects").join("measurement_data")));
    }

    #[test]
    fn timeouts_and_data_path() {
        let config = PulsedConfig::from_toml(
            r#"
            data_path = "runs"
            compile_timeout_s = 900.0
            asset_wait_s = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(config.compile_timeout(), Duration::from_secs(900));
        assert_eq!(config.measurement_options().asset_wait, Duration::ZERO);
        assert_eq!(config.data_dir(), Some(PathBuf::from("runs")));
        assert_eq!(PulsedConfig::default().data_dir(), None);

        for bad in ["compile_timeout_s = 0.0", "asset_wait_s = -1.0"] {
            assert!(matches!(PulsedConfig::from_toml(bad), Err(PulsedError::Configuration(_))));
        }
    }

    #[test]
    fn invalid_files_are_configuration_errors() {
        assert!(matches!(
            PulsedConfig::from_toml("timer_interval_s = \"fast\""),
            Err(PulsedError::Configuration(_))
        ));
        assert!(matches!(
            PulsedConfig::from_toml("reply_timeout_s = 0.0"),
            Err(PulsedError::Configuration(_))
        ));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulsed.toml");
        assert_eq!(PulsedConfig::load_or_default(&path), PulsedConfig::default());
        fs::write(&path, "queue_capacity = 8").unwrap();
        assert_eq!(PulsedConfig::load(&path).unwrap().queue_capacity, 8);
    }
}
