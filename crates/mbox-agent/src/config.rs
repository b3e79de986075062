//! Agent-level configuration: one TOML document wrapping the reframer and
//! NIC scheduler config, plus the settings that are genuinely this binary's
//! own (queue count, channel depth). Grounded on `strata-bonding::config`'s
//! layered `BondingConfig` — a single deserializable struct composed of the
//! sub-crates' own config types rather than flattened, mirrored fields.

use mbox_nicsched::NicSchedulerConfig;
use mbox_sfmaker::SfMakerConfig;
use serde::Deserialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("queues must be nonzero")]
    ZeroQueues,
    #[error("channel_capacity must be nonzero")]
    ZeroChannelCapacity,
    #[error(transparent)]
    SfMaker(#[from] mbox_sfmaker::ConfigError),
    #[error(transparent)]
    NicScheduler(#[from] mbox_nicsched::ConfigError),
}

/// Top-level agent configuration, loaded from a single TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Number of worker threads, each owning its own flow table shard.
    pub queues: usize,
    /// Bounded channel depth between the NIC-facing thread and each worker.
    pub channel_capacity: usize,
    #[serde(rename = "sfmaker")]
    pub sfmaker: SfMakerConfig,
    #[serde(rename = "nicsched")]
    pub nicsched: NicSchedulerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            queues: 4,
            channel_capacity: 4096,
            sfmaker: SfMakerConfig::default(),
            nicsched: NicSchedulerConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: AgentConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues == 0 {
            return Err(ConfigError::ZeroQueues);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        self.sfmaker.validate()?;
        self.nicsched.validate()?;
        Ok(())
    }
}
