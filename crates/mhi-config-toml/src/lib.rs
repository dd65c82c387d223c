// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML format for MHI controller configuration descriptors.

use std::path::Path;
use std::str::FromStr;

use mhi::config::{ChannelConfig, ControllerConfig, EventConfig};
use mhi::controller::ControllerResources;
use mhi::irq::IrqFlags;
use serde_derive::Deserialize;
use thiserror::Error;

/// A controller description: its configuration descriptor and, optionally,
/// the hardware resources to register it with.
#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub controller: Controller,

    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,

    #[serde(default, rename = "event")]
    pub events: Vec<EventConfig>,

    #[serde(default)]
    pub resources: Resources,
}

/// Controller-wide settings of the `[controller]` table.
#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Controller {
    pub max_channels: u32,
    pub timeout_ms: u32,
    pub ready_timeout_ms: u32,
    pub buf_len: usize,
    pub use_bounce_buf: bool,
    pub m2_no_db: bool,
}

/// Hardware resources of the `[resources]` table.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Resources {
    pub reg_len: usize,
    pub irqs: Vec<u32>,
    pub iova_start: u64,
    pub iova_stop: u64,
    /// Interrupt flag names, e.g. `["shared", "oneshot"]`
    pub irq_flags: Option<Vec<String>>,
    pub fbc_download: bool,
    pub rddm_size: usize,
    pub seg_len: usize,
    pub parent: Option<String>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            reg_len: 0x1000,
            irqs: vec![0, 1],
            iova_start: 0x10_0000,
            iova_stop: 0x1_0000_0000,
            irq_flags: None,
            fbc_download: false,
            rddm_size: 0,
            seg_len: 0,
            parent: None,
        }
    }
}

/// Errors which may be returned when parsing a controller description.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown interrupt flag {0:?}")]
    UnknownIrqFlag(String),
}

impl Config {
    /// The static configuration descriptor.
    pub fn controller_config(&self) -> ControllerConfig {
        let c = &self.controller;
        ControllerConfig {
            max_channels: c.max_channels,
            timeout_ms: c.timeout_ms,
            ready_timeout_ms: c.ready_timeout_ms,
            buf_len: c.buf_len,
            channels: self.channels.clone(),
            events: self.events.clone(),
            use_bounce_buf: c.use_bounce_buf,
            m2_no_db: c.m2_no_db,
        }
    }

    pub fn resources(&self) -> Result<ControllerResources, ParseError> {
        let r = &self.resources;
        let irq_flags = match r.irq_flags.as_ref() {
            Some(names) => Some(irq_flags_from_names(names)?),
            None => None,
        };
        Ok(ControllerResources {
            reg_len: r.reg_len,
            irqs: r.irqs.clone(),
            iova_start: r.iova_start,
            iova_stop: r.iova_stop,
            irq_flags,
            fbc_download: r.fbc_download,
            rddm_size: r.rddm_size,
            seg_len: r.seg_len,
            parent: r.parent.clone(),
        })
    }
}

fn irq_flags_from_names(names: &[String]) -> Result<IrqFlags, ParseError> {
    names.iter().try_fold(IrqFlags::empty(), |flags, name| {
        IrqFlags::from_name(&name.to_uppercase())
            .map(|f| flags | f)
            .ok_or_else(|| ParseError::UnknownIrqFlag(name.clone()))
    })
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str::<Config>(s)?)
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    use mhi::common::DmaDir;

    const LOOPBACK: &str = r#"
[controller]
max_channels = 2
timeout_ms = 500

[[channel]]
name = "LOOPBACK"
num = 0
num_elements = 64
event_ring = 0
dir = "to_device"
ee_mask = 4
doorbell = 2

[[channel]]
name = "LOOPBACK"
num = 1
num_elements = 64
event_ring = 0
dir = "from_device"
ee_mask = 4
doorbell = 2
wake_capable = true

[[event]]
num_elements = 32
irq_moderation_ms = 1
irq = 1
data_type = 0
mode = 2

[resources]
reg_len = 8192
irqs = [4, 5]
irq_flags = ["shared", "oneshot"]
rddm_size = 16384
parent = "0000:01:00.0"
"#;

    #[test]
    fn parse_loopback() {
        let cfg: Config = LOOPBACK.parse().unwrap();
        assert_eq!(cfg.controller.max_channels, 2);
        assert_eq!(cfg.controller.timeout_ms, 500);
        assert!(!cfg.controller.use_bounce_buf);

        let ctrl = cfg.controller_config();
        assert_eq!(ctrl.channels.len(), 2);
        assert_eq!(ctrl.channels[0].dir, DmaDir::ToDevice);
        assert_eq!(ctrl.channels[1].dir, DmaDir::FromDevice);
        assert!(ctrl.channels[1].wake_capable);
        assert_eq!(ctrl.events.len(), 1);
        assert_eq!(ctrl.events[0].irq_moderation_ms, 1);

        let res = cfg.resources().unwrap();
        assert_eq!(res.reg_len, 8192);
        assert_eq!(res.irqs, vec![4, 5]);
        assert_eq!(res.irq_flags, Some(IrqFlags::SHARED | IrqFlags::ONESHOT));
        assert_eq!(res.rddm_size, 16384);
        assert_eq!(res.parent.as_deref(), Some("0000:01:00.0"));
        // Unspecified keys keep their defaults
        assert_eq!(res.iova_start, Resources::default().iova_start);
    }

    #[test]
    fn parsed_config_is_valid() {
        let cfg: Config = LOOPBACK.parse().unwrap();
        let parsed = mhi::config::parse_config(&cfg.controller_config());
        assert!(parsed.is_ok());
    }

    #[test]
    fn empty_file_defaults() {
        let cfg: Config = "".parse().unwrap();
        assert_eq!(cfg.controller, Controller::default());
        assert!(cfg.channels.is_empty());
        assert_eq!(cfg.resources, Resources::default());
        assert_eq!(cfg.resources().unwrap().irq_flags, None);
    }

    #[test]
    fn unknown_irq_flag() {
        let cfg: Config = "[resources]\nirq_flags = [\"level\"]\n"
            .parse()
            .unwrap();
        match cfg.resources() {
            Err(ParseError::UnknownIrqFlag(name)) => assert_eq!(name, "level"),
            other => panic!("expected unknown flag, got {other:?}"),
        }
    }

    #[test]
    fn bad_direction() {
        let raw = "[[channel]]\nname = \"X\"\ndir = \"sideways\"\n";
        assert!(matches!(raw.parse::<Config>(), Err(ParseError::Toml(_))));
    }

    #[test]
    fn parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LOOPBACK.as_bytes()).unwrap();
        let cfg = parse(file.path()).unwrap();
        assert_eq!(cfg.channels.len(), 2);

        assert!(matches!(
            parse("/nonexistent/mhi.toml"),
            Err(ParseError::Io(_))
        ));
    }
}
