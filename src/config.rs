use crate::error::ConfigError;
use crate::master::{check_tick_distance, PollerConfig};
use crate::node::DEFAULT_REPORT_INTERVAL;
use crate::scheduler::SchedulerConfig;
use crate::slave::SlaveConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to bring up a brain and its satellites. Missing fields
/// in a JSON file fall back to the MP2 defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub scheduler: SchedulerConfig,
    pub poller: PollerConfig,
    /// Template for every satellite; the address is replaced per device.
    pub slave: SlaveConfig,
    /// Ticks between counter reports to the host.
    pub report_interval: u16,
    /// Real-time length of one tick in the simulator, in microseconds.
    pub tick_us: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            poller: PollerConfig::mp2(),
            slave: SlaveConfig::default(),
            report_interval: DEFAULT_REPORT_INTERVAL,
            tick_us: 1000,
        }
    }
}

impl NodeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poller.validate()?;
        if self.slave.address > 0x7F {
            return Err(ConfigError::BadAddress(self.slave.address));
        }
        if self.report_interval == 0 {
            return Err(ConfigError::ZeroValue { field: "report_interval" });
        }
        if self.tick_us == 0 {
            return Err(ConfigError::ZeroValue { field: "tick_us" });
        }
        if self.scheduler.max_delay == 0 {
            return Err(ConfigError::ZeroValue { field: "scheduler.max_delay" });
        }
        check_tick_distance("scheduler.max_delay", self.scheduler.max_delay)?;
        check_tick_distance("slave.idle_timeout", self.slave.idle_timeout)
    }

    /// Slave configuration for the device at `address`.
    pub fn slave_for(&self, address: u8) -> SlaveConfig {
        SlaveConfig { address, ..self.slave }
    }
}
