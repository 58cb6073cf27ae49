//! TOML configuration for the flock daemon.

use std::path::Path;

use flock_cluster::GroupConfig;
use serde::Deserialize;

/// Group name used when neither the file nor the command line sets one.
pub const DEFAULT_GROUP: &str = "flock";

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Group membership, RPC and state-transfer settings.
    pub group: GroupConfig,
    /// In-process simulation settings.
    pub simulation: SimulationSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[simulation]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    /// Number of members started before the scenario runs.
    pub nodes: usize,
    /// Whether the simulated network brackets view changes with a flush.
    pub flush: bool,
    /// Prefix of the generated node names (`<prefix>-1`, `<prefix>-2`, ...).
    pub name_prefix: String,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            nodes: 3,
            flush: true,
            name_prefix: "node".to_string(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use the defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                toml::from_str::<CliConfig>(&content)?
            }
            None => Self::default(),
        };
        if config.group.group_name.trim().is_empty() {
            config.group.group_name = DEFAULT_GROUP.to_string();
        }
        Ok(config)
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Check the settings before anything is started.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.group.validate()?;
        if self.simulation.nodes == 0 {
            anyhow::bail!("simulation needs at least one node");
        }
        if self.simulation.name_prefix.is_empty() {
            anyhow::bail!("simulation name prefix must not be empty");
        }
        Ok(())
    }

    /// Name of the `index`-th simulated node, counting from 1.
    pub fn node_name(&self, index: usize) -> String {
        format!("{}-{index}", self.simulation.name_prefix)
    }
}
