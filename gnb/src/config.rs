//! Scenario Configuration
//!
//! A scenario bundles the scheduler setup with the simulated UE population.
//! Files are YAML or TOML, picked by extension, and every section has
//! defaults so a scenario only lists what it changes.

use anyhow::{bail, Context};
use common::types::Qci;
use layers::mac::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Main scenario structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    /// Scheduler under test
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Run control
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Simulated UEs
    #[serde(default = "default_ues")]
    pub ues: Vec<UeProfile>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Run control
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Slots to simulate
    #[serde(default = "default_slots")]
    pub slots: u64,
    /// Seed of the channel and decoding draws
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Pace slots at their air-interface duration
    #[serde(default)]
    pub realtime: bool,
    /// Slots between two CQI reports of a UE
    #[serde(default = "default_cqi_period")]
    pub cqi_period: u32,
}

fn default_slots() -> u64 {
    2000
}

fn default_seed() -> u64 {
    1
}

fn default_cqi_period() -> u32 {
    5
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            seed: default_seed(),
            realtime: false,
            cqi_period: default_cqi_period(),
        }
    }
}

/// One simulated UE
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UeProfile {
    pub rnti: u16,
    /// Mean SNR in dB
    #[serde(default = "default_snr_db")]
    pub snr_db: f64,
    /// Standard deviation of the per-RB fading in dB
    #[serde(default = "default_fading_std_db")]
    pub fading_std_db: f64,
    /// DL bytes arriving at RLC every slot
    #[serde(default = "default_dl_bytes")]
    pub dl_bytes_per_slot: u32,
    /// UL bytes arriving at the UE every slot
    #[serde(default = "default_ul_bytes")]
    pub ul_bytes_per_slot: u32,
    #[serde(default)]
    pub qci: Qci,
    /// Report CSI through the precoding matrix search
    #[serde(default)]
    pub mimo: bool,
}

fn default_snr_db() -> f64 {
    15.0
}

fn default_fading_std_db() -> f64 {
    2.0
}

fn default_dl_bytes() -> u32 {
    1500
}

fn default_ul_bytes() -> u32 {
    300
}

impl UeProfile {
    pub fn new(rnti: u16) -> Self {
        Self {
            rnti,
            snr_db: default_snr_db(),
            fading_std_db: default_fading_std_db(),
            dl_bytes_per_slot: default_dl_bytes(),
            ul_bytes_per_slot: default_ul_bytes(),
            qci: Qci::DEFAULT,
            mimo: false,
        }
    }
}

fn default_ues() -> Vec<UeProfile> {
    vec![UeProfile::new(1), UeProfile { snr_db: 5.0, ..UeProfile::new(2) }]
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            simulation: SimulationConfig::default(),
            ues: default_ues(),
            log: LogConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load a scenario, YAML for `.yaml`/`.yml` and TOML for `.toml`
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let config = match ext {
            "yaml" | "yml" => Self::from_yaml_str(&contents),
            "toml" => Self::from_toml_str(&contents),
            other => bail!("unsupported scenario extension '{}' for {}", other, path.display()),
        };
        config.with_context(|| format!("parsing scenario {}", path.display()))
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Refuse scenarios the simulator cannot run
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler.validate().context("scheduler configuration")?;
        if self.ues.is_empty() {
            bail!("scenario has no UE");
        }
        if self.simulation.cqi_period == 0 {
            bail!("CQI period must be at least one slot");
        }
        let mut seen = HashSet::new();
        for ue in &self.ues {
            if ue.rnti == 0 {
                bail!("RNTI 0 is reserved");
            }
            if !seen.insert(ue.rnti) {
                bail!("RNTI {} listed twice", ue.rnti);
            }
            if !ue.snr_db.is_finite() || !(ue.fading_std_db >= 0.0) {
                bail!("RNTI {} has an invalid channel profile", ue.rnti);
            }
        }
        Ok(())
    }
}
