//! DAQ engine configuration.
//!
//! A [`DaqConfig`] selects the playback mode and names the physical outputs. Channel names are
//! given relative to the device (`ao0`, `port0`, `port0/line3`) and are checked by pattern when
//! the engine is configured; the device itself is only required in hardware mode.
//!
//! ```
//! use expctrl_backend::*;
//!
//! let cfg = DaqConfig::from_json_str(r#"{"mode": "hardware", "device": "Dev1", "fs_hz": 48000,
//!     "audio_channels": ["ao0", "ao1"], "ttl_lines": {"1": "port0/line0"}}"#).unwrap();
//! assert_eq!(cfg.physical_channel("ao1"), Some("/Dev1/ao1".to_string()));
//! assert!(cfg.validate().is_ok());
//! ```

use std::fmt;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Hardware,
    #[default]
    DryRun,
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PlaybackMode::Hardware => "hardware",
                PlaybackMode::DryRun => "dry_run",
            }
        )
    }
}

fn default_audio_channels() -> Vec<String> {
    vec!["ao0".to_string()]
}

fn default_ttl_port() -> String {
    "port0".to_string()
}

fn default_ttl_port_width() -> u32 {
    8
}

fn default_timeout_s() -> f64 {
    10.
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaqConfig {
    #[serde(default)]
    pub mode: PlaybackMode,
    #[serde(default)]
    pub device: Option<String>,
    pub fs_hz: f64,
    /// Analog outputs, one per audio column of the sequence.
    #[serde(default = "default_audio_channels")]
    pub audio_channels: Vec<String>,
    /// Digital port receiving each TTL code as a bitmask, one port value per sample.
    #[serde(default = "default_ttl_port")]
    pub ttl_port: String,
    /// Number of lines of `ttl_port`; every code must fit in this many bits.
    #[serde(default = "default_ttl_port_width")]
    pub ttl_port_width: u32,
    /// TTL code to line name, reported alongside played events. Not used to route output.
    #[serde(default)]
    pub ttl_lines: IndexMap<u32, String>,
    /// Dry run only: sleep for the sequence duration instead of returning immediately.
    #[serde(default)]
    pub real_time: bool,
    /// Extra time granted to the hardware on top of the sequence duration.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
}

impl DaqConfig {
    pub fn dry_run(fs_hz: f64) -> Self {
        Self {
            mode: PlaybackMode::DryRun,
            device: None,
            fs_hz,
            audio_channels: default_audio_channels(),
            ttl_port: default_ttl_port(),
            ttl_port_width: default_ttl_port_width(),
            ttl_lines: IndexMap::new(),
            real_time: false,
            timeout_s: default_timeout_s(),
        }
    }

    pub fn hardware(device: &str, fs_hz: f64) -> Self {
        Self {
            mode: PlaybackMode::Hardware,
            device: Some(device.to_string()),
            ..Self::dry_run(fs_hz)
        }
    }

    pub fn with_real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    pub fn with_ttl_line(mut self, code: u32, line: &str) -> Self {
        self.ttl_lines.insert(code, line.to_string());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DaqError::InvalidConfig(vec![e.to_string()]))
    }

    /// Fully qualified name of a device-relative channel, e.g. `/Dev1/ao0`.
    pub fn physical_channel(&self, name: &str) -> Option<String> {
        self.device.as_ref().map(|dev| format!("/{}/{}", dev, name))
    }

    pub fn ttl_line(&self, code: u32) -> Option<&str> {
        self.ttl_lines.get(&code).map(|s| s.as_str())
    }

    /// Whether `code` can be written to `ttl_port` without dropping bits.
    pub fn ttl_code_fits(&self, code: u32) -> bool {
        self.ttl_port_width >= 32 || code < (1u32 << self.ttl_port_width)
    }

    /// Collects every problem of the configuration.
    pub fn validate(&self) -> Result<()> {
        let ao_re = Regex::new(r"^ao\d+$").unwrap();
        let port_re = Regex::new(r"^port\d+$").unwrap();
        let line_re = Regex::new(r"^port\d+/line\d+$").unwrap();

        let mut issues = Vec::new();
        if !(self.fs_hz > 0. && self.fs_hz.is_finite()) {
            issues.push(format!("fs_hz must be positive, got {}", self.fs_hz));
        }
        if self.mode == PlaybackMode::Hardware && self.device.as_deref().map_or(true, str::is_empty) {
            issues.push("hardware mode requires a device identifier".to_string());
        }
        if self.audio_channels.is_empty() {
            issues.push("audio_channels must name at least one output".to_string());
        }
        for chan in &self.audio_channels {
            if !ao_re.is_match(chan) {
                issues.push(format!("audio channel '{}' does not match ao<N>", chan));
            }
        }
        if !port_re.is_match(&self.ttl_port) {
            issues.push(format!("ttl_port '{}' does not match port<N>", self.ttl_port));
        }
        if !(1..=32).contains(&self.ttl_port_width) {
            issues.push(format!("ttl_port_width must be between 1 and 32, got {}", self.ttl_port_width));
        }
        for (code, line) in &self.ttl_lines {
            if !line_re.is_match(line) {
                issues.push(format!("ttl line '{}' for code {} does not match port<N>/line<M>", line, code));
            }
            if !self.ttl_code_fits(*code) {
                issues.push(format!("ttl code {} does not fit a {}-line port", code, self.ttl_port_width));
            }
        }
        if !(self.timeout_s > 0.) {
            issues.push(format!("timeout_s must be positive, got {}", self.timeout_s));
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(DaqError::InvalidConfig(issues))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_dry_run() {
        let cfg = DaqConfig::from_json_str(r#"{"fs_hz": 48000}"#).unwrap();
        assert_eq!(cfg.mode, PlaybackMode::DryRun);
        assert_eq!(cfg.audio_channels, vec!["ao0"]);
        assert!(!cfg.real_time);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn hardware_requires_device() {
        let mut cfg = DaqConfig::hardware("Dev1", 48000.);
        assert!(cfg.validate().is_ok());
        cfg.device = None;
        assert!(matches!(cfg.validate(), Err(DaqError::InvalidConfig(issues)) if issues.len() == 1));
    }

    #[test]
    fn channel_names_are_checked() {
        let mut cfg = DaqConfig::dry_run(48000.).with_ttl_line(1, "port0/lineX");
        cfg.audio_channels.push("a1".into());
        cfg.ttl_port = "p0".into();
        match cfg.validate() {
            Err(DaqError::InvalidConfig(issues)) => assert_eq!(issues.len(), 3),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn misspelled_keys_are_rejected() {
        let err = DaqConfig::from_json_str(r#"{"fs_hz": 48000, "audio_channel": ["ao1"]}"#).unwrap_err();
        assert!(matches!(err, DaqError::InvalidConfig(ref issues) if issues[0].contains("audio_channel")));
    }

    #[test]
    fn physical_channel_prefixes_device() {
        let cfg = DaqConfig::hardware("Dev2", 48000.);
        assert_eq!(cfg.physical_channel("port0"), Some("/Dev2/port0".to_string()));
        assert_eq!(cfg.physical_channel("ao/SampleClock"), Some("/Dev2/ao/SampleClock".to_string()));
        assert_eq!(DaqConfig::dry_run(48000.).physical_channel("ao0"), None);
    }

    #[test]
    fn ttl_codes_must_fit_port_width() {
        let mut cfg = DaqConfig::dry_run(48000.);
        assert!(cfg.ttl_code_fits(255));
        assert!(!cfg.ttl_code_fits(256));
        cfg.ttl_port_width = 32;
        assert!(cfg.ttl_code_fits(u32::MAX));

        let cfg = DaqConfig::dry_run(48000.).with_ttl_line(300, "port0/line0");
        assert!(matches!(cfg.validate(), Err(DaqError::InvalidConfig(issues)) if issues.len() == 1));
        let mut cfg = DaqConfig::dry_run(48000.);
        cfg.ttl_port_width = 0;
        assert!(cfg.validate().is_err());
    }
}
