//! Configuration keys, grounded on `elements/flow/sfmaker.hh`'s element
//! arguments (spec §6.6).

use serde::Deserialize;

/// Which quantity breaks ties between ready flows when draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prio {
    /// Microseconds since the flow's slot first became active.
    FirstSeen,
    /// Negative of packets already sent from this slot — favors flows that
    /// haven't been served recently.
    Sent,
    /// Microseconds since the slot started waiting on its current batch.
    Delay,
}

/// Burst-detection model. `Second` treats a flow's first burst specially
/// (see `schedule_burst_from_flow`'s `MODEL_SECOND` handling upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    None,
    Second,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("delay_last_us ({delay_last_us}) must not exceed delay_us ({delay_us})")]
    DelayLastExceedsDelay { delay_us: u64, delay_last_us: u64 },
    #[error("max_tx_burst must be nonzero")]
    ZeroMaxTxBurst,
    #[error("min_tx_burst ({min_tx_burst}) must not exceed max_tx_burst ({max_tx_burst})")]
    MinExceedsMaxTxBurst { min_tx_burst: u32, max_tx_burst: u32 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SfMakerConfig {
    pub delay_us: u64,
    pub delay_last_us: u64,
    pub delay_hard_us: u64,
    pub prio: Prio,
    pub model: Model,
    pub max_burst: u32,
    pub max_tx_burst: u32,
    pub min_tx_burst: u32,
    pub max_tx_delay_us: u64,
    /// `None` means unbounded (the original's `MAX_CAP = -1`).
    pub max_cap: Option<usize>,
    pub proto_compress: bool,
    pub reorder: bool,
    pub bypass_syn: bool,
    pub bypass_after_fail: u32,
    pub alwaysup: bool,
}

impl Default for SfMakerConfig {
    fn default() -> Self {
        SfMakerConfig {
            delay_us: 100,
            delay_last_us: 50,
            delay_hard_us: 1_000,
            prio: Prio::Delay,
            model: Model::None,
            max_burst: 32,
            max_tx_burst: 32,
            min_tx_burst: 1,
            max_tx_delay_us: 50,
            max_cap: None,
            proto_compress: false,
            reorder: true,
            bypass_syn: false,
            bypass_after_fail: 3,
            alwaysup: false,
        }
    }
}

impl SfMakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay_last_us > self.delay_us {
            return Err(ConfigError::DelayLastExceedsDelay {
                delay_us: self.delay_us,
                delay_last_us: self.delay_last_us,
            });
        }
        if self.max_tx_burst == 0 {
            return Err(ConfigError::ZeroMaxTxBurst);
        }
        if self.min_tx_burst > self.max_tx_burst {
            return Err(ConfigError::MinExceedsMaxTxBurst {
                min_tx_burst: self.min_tx_burst,
                max_tx_burst: self.max_tx_burst,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SfMakerConfig::default().validate().is_ok());
    }

    #[test]
    fn delay_last_over_delay_is_rejected() {
        let mut cfg = SfMakerConfig::default();
        cfg.delay_last_us = cfg.delay_us + 1;
        assert!(cfg.validate().is_err());
    }
}
