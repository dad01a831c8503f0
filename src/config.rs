//! Run configuration.
//!
//! Everything that used to be process-wide (container poses, thresholds, endpoints) lives
//! in one [`RunConfig`], loaded once and passed into the controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assignment::SolverKind;
use crate::calibration::{CalibrationStore, CalibrationTable, ReferenceSlot, SlotSet};
use crate::error::{CoreError, Result};
use crate::facts::{Pixel, Pose6D};
use crate::similarity::DEFAULT_QUERY_TEMPLATE;

/// A TCP peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Socket behaviour shared by the worker and vision links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub worker: Endpoint,
    pub vision: Endpoint,
    /// Connect timeout; unset means the OS default.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Per send/receive timeout; unset means wait indefinitely.
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
    /// Pause after each acknowledged worker command.
    #[serde(default = "default_delay_ms")]
    pub command_delay_ms: u64,
    /// Pause after each vision-robot move.
    #[serde(default = "default_delay_ms")]
    pub vision_settle_ms: u64,
    /// Maximum bytes read for one acknowledgement.
    #[serde(default = "default_ack_buffer")]
    pub ack_buffer: usize,
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_ack_buffer() -> usize {
    1024
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn vision_settle(&self) -> Duration {
        Duration::from_millis(self.vision_settle_ms)
    }
}

/// Verification thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Bin-view confidence needed before a container is assigned to an object.
    #[serde(default = "default_bin_threshold")]
    pub bin_threshold: f32,
    /// Position/orientation tolerance used when auditing planner moves.
    #[serde(default = "default_pose_tolerance")]
    pub pose_tolerance: f32,
}

fn default_bin_threshold() -> f32 {
    0.1
}

fn default_pose_tolerance() -> f32 {
    0.5
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            bin_threshold: default_bin_threshold(),
            pose_tolerance: default_pose_tolerance(),
        }
    }
}

/// One container as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub pixel: [f32; 2],
    pub pose: [f32; 6],
}

impl From<&ContainerConfig> for ReferenceSlot {
    fn from(c: &ContainerConfig) -> Self {
        ReferenceSlot {
            name: c.name.clone(),
            pixel: Pixel::new(c.pixel[0], c.pixel[1]),
            pose: Pose6D::from_array(c.pose),
        }
    }
}

/// Where calibration data comes from. A populated store wins over the JSON files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSource {
    /// `{"u,v": [6 numbers]}` pixel→pose mapping.
    #[serde(default)]
    pub table: Option<PathBuf>,
    /// `{"Name": {"pixel": [u, v], "pose6d": [..]}}` container file.
    #[serde(default)]
    pub slots: Option<PathBuf>,
    /// Sled directory written by `sortbot import`.
    #[serde(default)]
    pub store: Option<PathBuf>,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub calibration: CalibrationSource,
    /// Containers in priority order; the first is the default.
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    /// Task-object names containing this word are treated as containers.
    #[serde(default = "default_container_keyword")]
    pub container_keyword: String,
    #[serde(default = "default_query_template")]
    pub query_template: String,
    #[serde(default)]
    pub solver: SolverKind,
}

fn default_container_keyword() -> String {
    "bin".to_string()
}

fn default_query_template() -> String {
    DEFAULT_QUERY_TEMPLATE.to_string()
}

impl RunConfig {
    /// Minimal configuration for the two endpoints; everything else defaulted.
    pub fn new(worker: Endpoint, vision: Endpoint) -> Self {
        Self {
            network: NetworkConfig {
                worker,
                vision,
                connect_timeout_ms: None,
                io_timeout_ms: None,
                command_delay_ms: default_delay_ms(),
                vision_settle_ms: default_delay_ms(),
                ack_buffer: default_ack_buffer(),
            },
            verification: VerificationConfig::default(),
            calibration: CalibrationSource::default(),
            containers: Vec::new(),
            container_keyword: default_container_keyword(),
            query_template: default_query_template(),
            solver: SolverKind::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.verification.bin_threshold) {
            return Err(CoreError::Config(format!(
                "bin_threshold must be within [0, 1], got {}",
                self.verification.bin_threshold
            )));
        }
        if self.network.ack_buffer == 0 {
            return Err(CoreError::Config("ack_buffer must be positive".to_string()));
        }
        if !self.query_template.contains("{name}") {
            return Err(CoreError::Config(
                "query_template must contain '{name}'".to_string(),
            ));
        }
        Ok(())
    }

    /// Container slots from the config file, else the store, else the slots JSON.
    pub fn load_slots(&self) -> Result<SlotSet> {
        if !self.containers.is_empty() {
            return SlotSet::new(self.containers.iter().map(ReferenceSlot::from).collect());
        }
        if let Some(store) = &self.calibration.store {
            if let Some(slots) = CalibrationStore::open(store)?.load_slots()? {
                return Ok(slots);
            }
        }
        match &self.calibration.slots {
            Some(path) => SlotSet::load_json(path),
            None => Err(CoreError::Config(
                "no containers configured and no slots file given".to_string(),
            )),
        }
    }

    /// Calibration table from the store when populated, else the JSON file.
    pub fn load_calibration(&self) -> Result<CalibrationTable> {
        if let Some(store) = &self.calibration.store {
            let table = CalibrationStore::open(store)?.load_table()?;
            if !table.is_empty() {
                return Ok(table);
            }
        }
        let table = match &self.calibration.table {
            Some(path) => CalibrationTable::load_json(path)?,
            None => {
                return Err(CoreError::Config(
                    "no calibration table or store configured".to_string(),
                ))
            }
        };
        if table.is_empty() {
            return Err(CoreError::Calibration("calibration table is empty".to_string()));
        }
        Ok(table)
    }
}
