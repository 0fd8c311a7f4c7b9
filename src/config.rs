use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

const DEFAULT_CONFIG_FILE: &str = "grabscan.yaml";
const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub zgrab2_path: PathBuf,
    pub tmp_dir: PathBuf,
    pub timeout_secs: u64,
    pub sudo: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            zgrab2_path: PathBuf::from("zgrab2"),
            tmp_dir: std::env::temp_dir().join("grabscan"),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            sudo: false,
        }
    }
}

impl ScanConfig {
    /// Zero means "not set" and falls back to the default.
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Loads `path`, or `grabscan.yaml` from the working directory when no path
/// is given. A missing default file yields the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<ScanConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(ScanConfig::default()); }
        }
    };
    let text = fs::read_to_string(&path)?;
    ScanConfig::from_yaml(&text)
}
