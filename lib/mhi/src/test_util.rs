// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use slog::{o, Drain, Logger};

use crate::bits::{BrstMode, EvType, MhiState};
use crate::bus::{ClientDriver, MhiBus, MhiDevice};
use crate::common::DmaDir;
use crate::config::{ChannelConfig, ControllerConfig, EventConfig};
use crate::controller::{Controller, ControllerResources, Transport};
use crate::dma::HeapDma;
use crate::error::{Error, Result};
use crate::event::EventProcessor;
use crate::pm::{ExecEnv, PmState};
use crate::sim::{CmdResponder, SimDevice, SimOps};

pub(crate) const IOVA_START: u64 = 0x10_0000;
pub(crate) const IOVA_STOP: u64 = 0x1_0000_0000;

pub(crate) fn test_logger() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

/// One uplink channel and one data event ring.
pub(crate) fn minimal_config() -> ControllerConfig {
    ControllerConfig {
        max_channels: 1,
        channels: vec![ChannelConfig {
            name: "TEST".to_string(),
            num: 0,
            num_elements: 64,
            dir: DmaDir::ToDevice,
            doorbell: BrstMode::Disable as u32,
            ..Default::default()
        }],
        events: vec![EventConfig {
            num_elements: 16,
            irq: 1,
            data_type: EvType::Data as u32,
            mode: BrstMode::Disable as u32,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn loopback_config() -> ControllerConfig {
    let chan = |num, dir| ChannelConfig {
        name: "LOOPBACK".to_string(),
        num,
        num_elements: 64,
        dir,
        ee_mask: ExecEnv::Amss.mask(),
        doorbell: BrstMode::Disable as u32,
        ..Default::default()
    };
    ControllerConfig {
        max_channels: 2,
        channels: vec![chan(0, DmaDir::ToDevice), chan(1, DmaDir::FromDevice)],
        events: vec![EventConfig {
            num_elements: 32,
            irq: 1,
            data_type: EvType::Data as u32,
            mode: BrstMode::Disable as u32,
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Event processor recording which rings it was asked to drain.
#[derive(Default)]
pub(crate) struct RecordingProcessor {
    calls: Mutex<Vec<(EvType, u32)>>,
}

impl RecordingProcessor {
    pub fn calls(&self) -> Vec<(EvType, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl EventProcessor for RecordingProcessor {
    fn process_data_events(&self, _ctrl: &Controller, er: u32) {
        self.calls.lock().unwrap().push((EvType::Data, er));
    }

    fn process_ctrl_events(&self, _ctrl: &Controller, er: u32) {
        self.calls.lock().unwrap().push((EvType::Ctrl, er));
    }
}

/// Client driver starting its channels at probe.
#[derive(Default)]
pub(crate) struct TestClient {
    probed: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl TestClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

impl ClientDriver for TestClient {
    fn probe(&self, dev: &Arc<MhiDevice>, _id: &str) -> Result<()> {
        let ctrl = dev
            .controller()
            .ok_or(Error::NotReady("controller is gone"))?;
        ctrl.prepare_for_transfer(dev)?;
        self.probed.lock().unwrap().push(dev.name().to_string());
        Ok(())
    }

    fn remove(&self, dev: &Arc<MhiDevice>) {
        self.removed.lock().unwrap().push(dev.name().to_string());
    }
}

/// A simulated device plus everything needed to register a controller
/// against it.  Adjust `config` and `res` before calling
/// [`Scaffold::register`].
pub(crate) struct Scaffold {
    pub config: ControllerConfig,
    pub res: ControllerResources,
    pub sim: Arc<SimDevice>,
    pub bus: Arc<MhiBus>,
    pub ops: Arc<SimOps>,
    pub responder: Arc<CmdResponder>,
    pub dma: Arc<HeapDma>,
    pub processor: Arc<RecordingProcessor>,
    pub log: Logger,
}

impl Scaffold {
    fn new(config: ControllerConfig) -> Self {
        let log = test_logger();
        let sim = SimDevice::new(IOVA_START, IOVA_STOP, &log).unwrap();
        let ops = Arc::new(SimOps::new(sim.clone(), &log));
        Self {
            config,
            res: ControllerResources {
                reg_len: 0x1000,
                irqs: vec![0, 1],
                iova_start: IOVA_START,
                iova_stop: IOVA_STOP,
                ..Default::default()
            },
            responder: sim.responder().clone(),
            dma: sim.dma.clone(),
            sim,
            bus: Arc::new(MhiBus::new()),
            ops,
            processor: Arc::new(RecordingProcessor::default()),
            log,
        }
    }

    pub fn minimal() -> Self {
        Self::new(minimal_config())
    }

    /// A LOOPBACK uplink/downlink pair available in mission mode.
    pub fn loopback() -> Self {
        Self::new(loopback_config())
    }

    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn register(&self) -> Result<Arc<Controller>> {
        let transport = Transport {
            ops: self.ops.clone(),
            dma: self.dma.clone(),
            irq_chip: self.sim.irq_chip.clone(),
            event_processor: Some(self.processor.clone()),
        };
        let ctrl = Controller::register(
            &self.bus,
            transport,
            self.res.clone(),
            &self.config,
            &self.log,
        )?;
        self.responder.attach(&ctrl);
        Ok(ctrl)
    }

    /// Bring a prepared controller to M0 in mission mode, the way the
    /// integrator's power-up sequence would.
    pub fn power_on(&self, ctrl: &Arc<Controller>) {
        self.sim.set_mhi_state(MhiState::M0);
        self.sim.set_exec_env(ExecEnv::Amss);
        ctrl.init_mmio().unwrap();
        ctrl.set_pm_state(PmState::POR).unwrap();
        ctrl.set_pm_state(PmState::M0).unwrap();
        ctrl.set_exec_env(ExecEnv::Amss);
        ctrl.set_dev_state(MhiState::M0);
        ctrl.enable_irqs();
    }

    /// Wait for queued state transitions and bottom halves.
    pub fn flush(&self, ctrl: &Arc<Controller>) {
        ctrl.flush_workers();
    }
}
