//! Run configuration loaded from TOML.
//!
//! Every section is optional; missing keys fall back to the values used on
//! the test bench (750 MHz sampling, channel 1, 1024 triggers per step,
//! -0.4 V to 0.4 V in 10 mV steps with 100 ms settle time).
//!
//! ```toml
//! [sweep]
//! v_min = -0.3
//! v_max = 0.3
//! v_step = 0.05
//!
//! [pulser]
//! transport = "socket"
//! address = "aimtti-tgp3152-00"
//! ```
use crate::corrector::{AdcScale, InvalidCellPolicy, OutputUnit};
use crate::pulser::{CommandPulser, Pulser, DEFAULT_PULSER_ADDRESS, DEFAULT_PULSER_PROGRAM};
use crate::raw_event::ChannelId;
use crate::sweep::{CeilingPolicy, SweepPlan, VoltageCeiling, DEFAULT_PULSER_CEILING_VOLTS};
use crate::waveform_source::{AcquisitionRequest, SamplingFrequency};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeilingMode {
    #[default]
    Reject,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub v_min: f64,
    pub v_max: f64,
    pub v_step: f64,
    pub settle_ms: u64,
    pub events_per_step: usize,
    pub ceiling_volts: f64,
    pub ceiling_mode: CeilingMode,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            v_min: -0.4,
            v_max: 0.4,
            v_step: 0.01,
            settle_ms: 100,
            events_per_step: 1024,
            ceiling_volts: DEFAULT_PULSER_CEILING_VOLTS,
            ceiling_mode: CeilingMode::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub sampling_mhz: u32,
    /// The first entry is the channel calibrated and displayed.
    pub channels: Vec<u8>,
    pub triggers_per_readout: usize,
    pub retry_delay_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sampling_mhz: 750,
            channels: vec![1],
            triggers_per_readout: 1,
            retry_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulserTransport {
    /// Run the pulser command line tool once per command.
    #[default]
    Command,
    /// Talk to the pulser server's unix socket directly.
    Socket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulserConfig {
    pub transport: PulserTransport,
    pub address: String,
    pub program: PathBuf,
    /// Overrides the socket path derived from `address`.
    pub socket_path: Option<PathBuf>,
}

impl Default for PulserConfig {
    fn default() -> Self {
        Self {
            transport: PulserTransport::Command,
            address: DEFAULT_PULSER_ADDRESS.to_string(),
            program: PathBuf::from(DEFAULT_PULSER_PROGRAM),
            socket_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitConfig {
    #[default]
    Normalized,
    Adc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidCellConfig {
    #[default]
    Sentinel,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub model_file: String,
    /// Also persist the averaged calibration curves under this name.
    pub curves_file: Option<String>,
    pub unit: UnitConfig,
    pub invalid_cells: InvalidCellConfig,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("calibration"),
            model_file: "calibration.parquet".to_string(),
            curves_file: None,
            unit: UnitConfig::Normalized,
            invalid_cells: InvalidCellConfig::Sentinel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub sweep: SweepConfig,
    pub acquisition: AcquisitionConfig,
    pub pulser: PulserConfig,
    pub output: OutputConfig,
}

impl RunConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content)?;
        log::debug!("Loaded run configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampling()?;
        self.channels()?;
        self.sweep_plan()
            .setpoints()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.acquisition.triggers_per_readout == 0 {
            return Err(ConfigError::Invalid(
                "triggers_per_readout must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sampling(&self) -> Result<SamplingFrequency, ConfigError> {
        SamplingFrequency::from_mhz(self.acquisition.sampling_mhz).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "unsupported sampling frequency {} MHz (use 750, 1000, 2500 or 5000)",
                self.acquisition.sampling_mhz
            ))
        })
    }

    pub fn channels(&self) -> Result<Vec<ChannelId>, ConfigError> {
        if self.acquisition.channels.is_empty() {
            return Err(ConfigError::Invalid("no channel enabled".to_string()));
        }
        self.acquisition
            .channels
            .iter()
            .map(|&n| ChannelId::new(n).map_err(|e| ConfigError::Invalid(e.to_string())))
            .collect()
    }

    /// Channel that is calibrated and displayed.
    pub fn primary_channel(&self) -> Result<ChannelId, ConfigError> {
        self.channels().map(|channels| channels[0])
    }

    pub fn sweep_plan(&self) -> SweepPlan {
        let sweep = &self.sweep;
        let policy = match sweep.ceiling_mode {
            CeilingMode::Reject => CeilingPolicy::Reject,
            CeilingMode::Truncate => CeilingPolicy::Truncate,
        };
        SweepPlan::new(sweep.v_min, sweep.v_max, sweep.v_step)
            .settle_time(Duration::from_millis(sweep.settle_ms))
            .events_per_step(sweep.events_per_step)
            .ceiling(VoltageCeiling {
                volts: sweep.ceiling_volts,
                policy,
            })
    }

    pub fn acquisition_request(&self) -> Result<AcquisitionRequest, ConfigError> {
        Ok(AcquisitionRequest::new(
            &self.channels()?,
            self.sampling()?,
            self.acquisition.triggers_per_readout,
        ))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquisition.retry_delay_ms)
    }

    pub fn output_unit(&self) -> OutputUnit {
        match self.output.unit {
            UnitConfig::Normalized => OutputUnit::Normalized,
            UnitConfig::Adc => OutputUnit::AdcCounts(AdcScale::DT5742),
        }
    }

    pub fn invalid_cell_policy(&self) -> InvalidCellPolicy {
        match self.output.invalid_cells {
            InvalidCellConfig::Sentinel => InvalidCellPolicy::Sentinel,
            InvalidCellConfig::Abort => InvalidCellPolicy::Abort,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.output.directory.join(&self.output.model_file)
    }

    pub fn curves_path(&self) -> Option<PathBuf> {
        self.output
            .curves_file
            .as_ref()
            .map(|name| self.output.directory.join(name))
    }

    pub fn build_pulser(&self) -> Result<Box<dyn Pulser + Send>, ConfigError> {
        let pulser = &self.pulser;
        match pulser.transport {
            PulserTransport::Command => Ok(Box::new(CommandPulser::new(
                pulser.program.clone(),
                pulser.address.clone(),
            ))),
            #[cfg(unix)]
            PulserTransport::Socket => {
                let socket = match &pulser.socket_path {
                    Some(path) => crate::pulser::SocketPulser::new(path.clone()),
                    None => crate::pulser::SocketPulser::for_address(&pulser.address),
                };
                Ok(Box::new(socket))
            }
            #[cfg(not(unix))]
            PulserTransport::Socket => Err(ConfigError::Invalid(
                "the socket transport needs unix domain sockets".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_bench_defaults() {
        let config = RunConfig::parse("").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.sampling().unwrap(), SamplingFrequency::MHz750);
        assert_eq!(config.primary_channel().unwrap(), ChannelId::new(1).unwrap());

        let plan = config.sweep_plan();
        assert_eq!(plan.settle_time, Duration::from_millis(100));
        assert_eq!(plan.events_per_step, 1024);
        assert_eq!(plan.setpoints().unwrap().len(), 81);
        assert_eq!(config.model_path(), PathBuf::from("calibration/calibration.parquet"));
        assert_eq!(config.curves_path(), None);
    }

    #[test]
    fn test_partial_sections() {
        let config = RunConfig::parse(
            r#"
            [sweep]
            v_min = -0.3
            v_max = 0.3
            v_step = 0.15
            ceiling_mode = "truncate"

            [acquisition]
            channels = [3, 4]
            sampling_mhz = 5000

            [output]
            unit = "adc"
            invalid_cells = "abort"
            curves_file = "curves.parquet"
            "#,
        )
        .unwrap();

        assert_eq!(config.sweep.settle_ms, 100);
        assert_eq!(config.sweep_plan().ceiling.policy, CeilingPolicy::Truncate);
        assert_eq!(config.sweep_plan().setpoints().unwrap().len(), 5);

        let request = config.acquisition_request().unwrap();
        assert_eq!(request.channel_mask, 0b11000);
        assert_eq!(request.sampling, SamplingFrequency::MHz5000);
        assert_eq!(config.output_unit(), OutputUnit::AdcCounts(AdcScale::DT5742));
        assert_eq!(config.invalid_cell_policy(), InvalidCellPolicy::Abort);
        assert_eq!(config.curves_path(), Some(PathBuf::from("calibration/curves.parquet")));
    }

    #[test]
    fn test_validation_errors() {
        for bad in [
            "[acquisition]\nsampling_mhz = 600",
            "[acquisition]\nchannels = []",
            "[acquisition]\nchannels = [16]",
            "[sweep]\nv_min = -0.8",
            "[sweep]\nv_step = 0.0",
        ] {
            assert!(
                matches!(RunConfig::parse(bad), Err(ConfigError::Invalid(_))),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(
            RunConfig::parse("[sweep]\nv_min = \"low\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut config = RunConfig::default();
        config.pulser.transport = PulserTransport::Socket;
        config.sweep.v_step = 0.05;
        config.save(&path).unwrap();

        assert_eq!(RunConfig::load_from(&path).unwrap(), config);
        assert!(matches!(
            RunConfig::load_from(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
