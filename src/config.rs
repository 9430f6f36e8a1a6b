//! Configuration file parsing.
//!
//! A `serde`/`toml` document describing a list of switches plus a handful
//! of global knobs.

use std::fs;
use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

use crate::error::DaemonError;

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    pub name: String,
    pub serial: Option<String>,
    pub tcp_port_base: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(rename = "switch", default)]
    pub switches: Vec<SwitchConfig>,
    pub log_stream: Option<String>,
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout: u64,
    #[serde(default = "default_max_queued")]
    pub max_queued_messages: usize,
    pub persistent_dir: Option<PathBuf>,
}

fn default_tcp_timeout() -> u64 {
    60
}

fn default_max_queued() -> usize {
    64
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: DaemonConfig = toml::from_str(&text)
            .map_err(|e| DaemonError::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Every switch needs a name and a non-zero TCP port base, and only the last
    /// configured switch may omit a serial number (it becomes the fallback
    /// match for any device whose serial isn't otherwise recognized).
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.switches.is_empty() {
            return Err(DaemonError::Config("no switches defined".into()));
        }
        let last = self.switches.len() - 1;
        for (i, s) in self.switches.iter().enumerate() {
            if s.name.is_empty() {
                return Err(DaemonError::Config("every switch must have a name".into()));
            }
            if s.tcp_port_base == 0 {
                return Err(DaemonError::Config(format!(
                    "switch {:?} must have a non-zero tcp_port_base",
                    s.name
                )));
            }
            if s.serial.is_none() && i != last {
                return Err(DaemonError::Config(
                    "only the last switch may be defined with no serial number".into(),
                ));
            }
        }
        Ok(())
    }
}
