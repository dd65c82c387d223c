// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static controller configuration and its validation.

use serde::Deserialize;

use crate::bits::{BrstMode, EvType};
use crate::common::{DmaDir, MHI_MAX_MTU, MHI_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::pm::PmState;

/// Configuration of one channel.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    pub num: u32,
    pub num_elements: u32,
    /// Buffer-tracking ring size; zero means `num_elements`
    pub local_elements: u32,
    pub event_ring: u32,
    pub dir: DmaDir,
    /// Channel type code; zero means derive from `dir`
    #[serde(rename = "type")]
    pub chtype: u32,
    pub ee_mask: u32,
    pub pollcfg: u32,
    /// Raw doorbell burst mode, see [`BrstMode`]
    pub doorbell: u32,
    pub lpm_notify: bool,
    pub offload_channel: bool,
    pub doorbell_mode_switch: bool,
    pub pre_alloc: bool,
    pub wake_capable: bool,
}

/// Configuration of one event ring.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub num_elements: u32,
    pub irq_moderation_ms: u32,
    /// Index into the controller IRQ table
    pub irq: u32,
    /// Dedicated channel, if any
    pub channel: Option<u32>,
    pub priority: u32,
    /// Raw doorbell burst mode, see [`BrstMode`]
    pub mode: u32,
    /// Raw event data type, see [`EvType`]
    pub data_type: u32,
    pub hardware_event: bool,
    pub client_managed: bool,
    pub offload_channel: bool,
}

/// Static configuration descriptor for a controller.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_channels: u32,
    pub timeout_ms: u32,
    pub ready_timeout_ms: u32,
    pub buf_len: usize,
    #[serde(rename = "channel")]
    pub channels: Vec<ChannelConfig>,
    #[serde(rename = "event")]
    pub events: Vec<EventConfig>,
    pub use_bounce_buf: bool,
    pub m2_no_db: bool,
}

/// Validated channel parameters.
#[derive(Clone, Debug)]
pub struct ChanParams {
    pub name: String,
    pub num: u32,
    pub tre_elements: usize,
    pub buf_elements: usize,
    pub er_index: u32,
    pub dir: DmaDir,
    pub chtype: u32,
    pub ee_mask: u32,
    pub pollcfg: u32,
    pub brstmode: BrstMode,
    pub reset_req: bool,
    pub lpm_notify: bool,
    pub offload: bool,
    pub pre_alloc: bool,
    pub wake_capable: bool,
}

/// Validated event ring parameters.
#[derive(Clone, Debug)]
pub struct EventParams {
    pub index: u32,
    pub elements: usize,
    pub intmod: u32,
    pub irq: u32,
    pub chan: Option<u32>,
    pub priority: u32,
    pub brstmode: BrstMode,
    pub data_type: EvType,
    pub hw_ring: bool,
    pub client_managed: bool,
    pub offload: bool,
}

/// Output of [`parse_config`]: the tables a controller is built from.
#[derive(Clone, Debug)]
pub struct ParsedConfig {
    pub max_chan: u32,
    /// Indexed by channel number; `None` for unconfigured slots
    pub channels: Vec<Option<ChanParams>>,
    pub events: Vec<EventParams>,
    pub hw_ev_rings: u32,
    pub sw_ev_rings: u32,
    /// Channels wanting LPM notifications, in configuration order
    pub lpm_chans: Vec<u32>,
    pub timeout_ms: u32,
    pub ready_timeout_ms: u32,
    pub buffer_len: usize,
    pub db_access: PmState,
    pub bounce_buf: bool,
}

impl ParsedConfig {
    pub fn total_ev_rings(&self) -> u32 {
        self.events.len() as u32
    }
}

/// Event rings get the default, non-sleeping priority.
const MHI_ER_PRIORITY_DEFAULT_NOSLEEP: u32 = 1;

fn parse_brstmode(raw: u32) -> Option<BrstMode> {
    BrstMode::from_repr(raw)
}

fn parse_ev_cfg(
    config: &ControllerConfig,
    max_chan: u32,
) -> Result<(Vec<EventParams>, u32, u32)> {
    let mut events = Vec::with_capacity(config.events.len());
    let (mut hw, mut sw) = (0, 0);

    for (i, cfg) in config.events.iter().enumerate() {
        let index = i as u32;
        let elements = cfg.num_elements as usize;

        if let Some(chan) = cfg.channel {
            if chan >= max_chan {
                return Err(Error::invalid(format!(
                    "event ring {index}: channel {chan} out of range"
                )));
            }
        }
        let brstmode = parse_brstmode(cfg.mode).ok_or_else(|| {
            Error::invalid(format!(
                "event ring {index}: invalid burst mode {:#x}",
                cfg.mode
            ))
        })?;
        let data_type = EvType::from_repr(cfg.data_type).ok_or_else(|| {
            Error::invalid(format!(
                "event ring {index}: invalid data type {}",
                cfg.data_type
            ))
        })?;
        if !cfg.offload_channel && !elements.is_power_of_two() {
            return Err(Error::invalid(format!(
                "event ring {index}: {elements} elements is not a power of two"
            )));
        }
        if cfg.irq_moderation_ms > u32::from(u16::MAX) {
            return Err(Error::invalid(format!(
                "event ring {index}: moderation of {} ms too long",
                cfg.irq_moderation_ms
            )));
        }

        if cfg.hardware_event {
            hw += 1;
        } else {
            sw += 1;
        }

        events.push(EventParams {
            index,
            elements,
            intmod: cfg.irq_moderation_ms,
            irq: cfg.irq,
            chan: cfg.channel,
            priority: MHI_ER_PRIORITY_DEFAULT_NOSLEEP,
            brstmode,
            data_type,
            hw_ring: cfg.hardware_event,
            client_managed: cfg.client_managed,
            offload: cfg.offload_channel,
        });
    }
    Ok((events, hw, sw))
}

fn parse_ch_cfg(
    config: &ControllerConfig,
    max_chan: u32,
) -> Result<(Vec<Option<ChanParams>>, Vec<u32>)> {
    let mut channels: Vec<Option<ChanParams>> = vec![None; max_chan as usize];
    let mut lpm_chans = Vec::new();
    let num_events = config.events.len() as u32;

    for cfg in config.channels.iter() {
        let num = cfg.num;
        if num >= max_chan {
            return Err(Error::invalid(format!(
                "channel {num} exceeds max channels {max_chan}"
            )));
        }
        if channels[num as usize].is_some() {
            return Err(Error::invalid(format!(
                "channel {num} configured more than once"
            )));
        }

        let tre_elements = cfg.num_elements as usize;
        if tre_elements == 0 {
            return Err(Error::invalid(format!(
                "channel {num} ({}): number of elements cannot be zero",
                cfg.name
            )));
        }
        let buf_elements = match cfg.local_elements {
            0 => tre_elements,
            n => n as usize,
        };

        if cfg.pre_alloc && cfg.dir != DmaDir::FromDevice {
            return Err(Error::invalid(format!(
                "channel {num} ({}): pre-allocation requires a downlink \
                 channel",
                cfg.name
            )));
        }
        if cfg.dir.requires_offload() && !cfg.offload_channel {
            return Err(Error::invalid(format!(
                "channel {num} ({}): {:?} direction only valid for offload",
                cfg.name, cfg.dir
            )));
        }

        let brstmode = if cfg.offload_channel {
            BrstMode::default()
        } else {
            let mode = parse_brstmode(cfg.doorbell).ok_or_else(|| {
                Error::invalid(format!(
                    "channel {num} ({}): invalid doorbell mode {:#x}",
                    cfg.name, cfg.doorbell
                ))
            })?;
            if !tre_elements.is_power_of_two() {
                return Err(Error::invalid(format!(
                    "channel {num} ({}): {tre_elements} elements is not a \
                    power of two",
                    cfg.name
                )));
            }
            if cfg.event_ring >= num_events {
                return Err(Error::invalid(format!(
                    "channel {num} ({}): event ring {} out of range",
                    cfg.name, cfg.event_ring
                )));
            }
            mode
        };

        let chtype = match cfg.chtype {
            0 => cfg.dir as u32,
            t => t,
        };

        if cfg.lpm_notify {
            lpm_chans.push(num);
        }

        channels[num as usize] = Some(ChanParams {
            name: cfg.name.clone(),
            num,
            tre_elements,
            buf_elements,
            er_index: cfg.event_ring,
            dir: cfg.dir,
            chtype,
            ee_mask: cfg.ee_mask,
            pollcfg: cfg.pollcfg,
            brstmode,
            reset_req: cfg.doorbell_mode_switch,
            lpm_notify: cfg.lpm_notify,
            offload: cfg.offload_channel,
            pre_alloc: cfg.pre_alloc,
            wake_capable: cfg.wake_capable,
        });
    }
    Ok((channels, lpm_chans))
}

/// Validate `config`, producing the channel and event ring tables.
pub fn parse_config(config: &ControllerConfig) -> Result<ParsedConfig> {
    let max_chan = config.max_channels;
    let (channels, lpm_chans) = parse_ch_cfg(config, max_chan)?;
    let (events, hw_ev_rings, sw_ev_rings) = parse_ev_cfg(config, max_chan)?;

    let timeout_ms = match config.timeout_ms {
        0 => MHI_TIMEOUT_MS,
        t => t,
    };
    let ready_timeout_ms = match config.ready_timeout_ms {
        0 => timeout_ms,
        t => t,
    };
    let buffer_len = match config.buf_len {
        0 => MHI_MAX_MTU,
        l => l,
    };
    let mut db_access = PmState::M0 | PmState::M2;
    if config.m2_no_db {
        db_access.remove(PmState::M2);
    }

    Ok(ParsedConfig {
        max_chan,
        channels,
        events,
        hw_ev_rings,
        sw_ev_rings,
        lpm_chans,
        timeout_ms,
        ready_timeout_ms,
        buffer_len,
        db_access,
        bounce_buf: config.use_bounce_buf,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_util::minimal_config as minimal;

    fn assert_invalid(config: &ControllerConfig) {
        match parse_config(config) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[test]
    fn defaults_applied() {
        let parsed = parse_config(&minimal()).unwrap();
        assert_eq!(parsed.timeout_ms, MHI_TIMEOUT_MS);
        assert_eq!(parsed.ready_timeout_ms, MHI_TIMEOUT_MS);
        assert_eq!(parsed.buffer_len, MHI_MAX_MTU);
        assert_eq!(parsed.db_access, PmState::M0 | PmState::M2);
        assert_eq!((parsed.hw_ev_rings, parsed.sw_ev_rings), (0, 1));

        let chan = parsed.channels[0].as_ref().unwrap();
        assert_eq!(chan.buf_elements, 64);
        assert_eq!(chan.chtype, DmaDir::ToDevice as u32);
        assert_eq!(parsed.events[0].priority, 1);
    }

    #[test]
    fn explicit_values_kept() {
        let mut config = minimal();
        config.timeout_ms = 2000;
        config.buf_len = 0x2000;
        config.m2_no_db = true;
        config.channels[0].local_elements = 32;
        config.channels[0].chtype = 3;

        let parsed = parse_config(&config).unwrap();
        assert_eq!(parsed.timeout_ms, 2000);
        assert_eq!(parsed.ready_timeout_ms, 2000);
        assert_eq!(parsed.buffer_len, 0x2000);
        assert_eq!(parsed.db_access, PmState::M0);
        let chan = parsed.channels[0].as_ref().unwrap();
        assert_eq!(chan.buf_elements, 32);
        assert_eq!(chan.chtype, 3);
    }

    #[test]
    fn zero_elements_rejected() {
        let mut config = minimal();
        config.channels[0].num_elements = 0;
        assert_invalid(&config);
    }

    #[test]
    fn channel_out_of_range() {
        let mut config = minimal();
        config.channels[0].num = 1;
        assert_invalid(&config);
    }

    #[test]
    fn pre_alloc_requires_downlink() {
        let mut config = minimal();
        config.channels[0].pre_alloc = true;
        assert_invalid(&config);

        config.channels[0].dir = DmaDir::FromDevice;
        assert!(parse_config(&config).is_ok());
    }

    #[test]
    fn moderation_fits_context() {
        let mut config = minimal();
        config.events[0].irq_moderation_ms = u32::from(u16::MAX) + 1;
        assert_invalid(&config);

        config.events[0].irq_moderation_ms = u32::from(u16::MAX);
        assert!(parse_config(&config).is_ok());
    }

    #[test]
    fn bidirectional_requires_offload() {
        for dir in [DmaDir::Bidirectional, DmaDir::None] {
            let mut config = minimal();
            config.channels[0].dir = dir;
            assert_invalid(&config);

            config.channels[0].offload_channel = true;
            assert!(parse_config(&config).is_ok());
        }
    }

    #[test]
    fn burst_mode_validated() {
        let mut config = minimal();
        config.channels[0].doorbell = 1;
        assert_invalid(&config);

        // Offload channels carry no doorbell configuration
        config.channels[0].offload_channel = true;
        assert!(parse_config(&config).is_ok());

        let mut config = minimal();
        config.events[0].mode = 0;
        assert_invalid(&config);
    }

    #[test]
    fn event_checks() {
        let mut config = minimal();
        config.events[0].data_type = 2;
        assert_invalid(&config);

        let mut config = minimal();
        config.events[0].channel = Some(1);
        assert_invalid(&config);

        let mut config = minimal();
        config.events[0].channel = Some(0);
        config.events[0].hardware_event = true;
        let parsed = parse_config(&config).unwrap();
        assert_eq!(parsed.events[0].chan, Some(0));
        assert_eq!((parsed.hw_ev_rings, parsed.sw_ev_rings), (1, 0));
    }

    #[test]
    fn ring_sizes_must_be_powers_of_two() {
        let mut config = minimal();
        config.channels[0].num_elements = 48;
        assert_invalid(&config);

        let mut config = minimal();
        config.events[0].num_elements = 24;
        assert_invalid(&config);
    }

    #[test]
    fn event_ring_index_checked() {
        let mut config = minimal();
        config.channels[0].event_ring = 1;
        assert_invalid(&config);
    }

    #[test]
    fn lpm_list_in_order() {
        let mut config = minimal();
        config.max_channels = 4;
        for num in [3, 1, 2] {
            config.channels.push(ChannelConfig {
                name: format!("C{num}"),
                num,
                num_elements: 8,
                doorbell: BrstMode::Enable as u32,
                lpm_notify: num != 2,
                ..Default::default()
            });
        }
        let parsed = parse_config(&config).unwrap();
        assert_eq!(parsed.lpm_chans, vec![3, 1]);
        assert!(parsed.channels.iter().all(|c| c.is_some()));
    }

    #[test]
    fn duplicate_channel_rejected() {
        let mut config = minimal();
        let dup = config.channels[0].clone();
        config.channels.push(dup);
        assert_invalid(&config);
    }
}
