// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use mhi::bits::MhiState;
use mhi::bus::{ClientDriver, MhiBus, MhiDevice, MhiDriver};
use mhi::common::DmaDir;
use mhi::controller::{Controller, Transport};
use mhi::pm::{ExecEnv, PmState, StateTransition};
use mhi::sim::{SimDevice, SimOps};
use mhi::sysfs::Attr;
use mhi::usdt::register_probes;
use slog::{error, info, o, warn, Drain, Logger};

/// Channel name the loopback client binds to.
const LOOPBACK: &str = "LOOPBACK";

/// Used when no configuration file is given.
const DEFAULT_CONFIG: &str = r#"
[controller]
max_channels = 2

[[channel]]
name = "LOOPBACK"
num = 0
num_elements = 64
dir = "to_device"
ee_mask = 4
doorbell = 2

[[channel]]
name = "LOOPBACK"
num = 1
num_elements = 64
dir = "from_device"
ee_mask = 4
doorbell = 2

[[event]]
num_elements = 32
irq = 1
mode = 2
"#;

/// Client driver which starts its channels at probe and counts what comes
/// back.
struct LoopbackClient {
    log: Logger,
    returned: AtomicUsize,
}

impl ClientDriver for LoopbackClient {
    fn probe(&self, dev: &Arc<MhiDevice>, id: &str) -> mhi::Result<()> {
        let ctrl = dev
            .controller()
            .ok_or(mhi::Error::NotReady("controller is gone"))?;
        ctrl.prepare_for_transfer(dev)?;
        info!(self.log, "loopback bound"; "dev" => dev.name(), "id" => id);
        Ok(())
    }

    fn remove(&self, dev: &Arc<MhiDevice>) {
        info!(self.log, "loopback removed"; "dev" => dev.name(),
            "returned" => self.returned.load(Ordering::Relaxed));
    }
}

fn loopback_driver(client: &Arc<LoopbackClient>) -> Arc<MhiDriver> {
    let ul = client.clone();
    let dl = client.clone();
    let st = client.clone();
    Arc::new(
        MhiDriver::new("mhi-loopback", &[LOOPBACK], client.clone())
            .with_ul_xfer_cb(move |dev, res| {
                ul.returned.fetch_add(1, Ordering::Relaxed);
                info!(ul.log, "uplink buffer returned";
                    "dev" => dev.name(),
                    "bytes" => res.bytes_xferd,
                    "status" => ?res.status);
            })
            .with_dl_xfer_cb(move |dev, res| {
                info!(dl.log, "downlink buffer returned";
                    "dev" => dev.name(),
                    "bytes" => res.bytes_xferd,
                    "status" => ?res.status);
            })
            .with_status_cb(move |dev, cb| {
                info!(st.log, "status"; "dev" => dev.name(), "cb" => ?cb);
            }),
    )
}

/// Bring the simulated device to M0 in mission mode, creating client
/// devices on the way.
fn power_up(ctrl: &Arc<Controller>, sim: &SimDevice) -> anyhow::Result<()> {
    sim.set_mhi_state(MhiState::M0);
    sim.set_exec_env(ExecEnv::Amss);
    ctrl.init_mmio().context("failed to program MMIO")?;
    ctrl.set_pm_state(PmState::POR)?;
    ctrl.set_pm_state(PmState::M0)?;
    ctrl.set_dev_state(MhiState::M0);
    ctrl.enable_irqs();
    ctrl.queue_transition(StateTransition::MissionMode);
    ctrl.flush_workers();
    Ok(())
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

#[derive(clap::Parser)]
/// Drive an MHI controller against a simulated endpoint.
struct Args {
    /// Controller description (TOML); a loopback pair if omitted
    #[clap(value_name = "CONFIG", action)]
    config: Option<String>,

    /// Uplink buffers to queue on the loopback device
    #[clap(short, long, default_value_t = 4, action)]
    queue: usize,

    /// Size of each queued buffer
    #[clap(short, long, default_value_t = 512, action)]
    size: usize,
}

fn main() -> anyhow::Result<()> {
    let Args { config, queue, size } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();

    let cfg = match config.as_ref() {
        Some(path) => mhi_config_toml::parse(path)
            .with_context(|| format!("Failed to parse config {path}"))?,
        None => DEFAULT_CONFIG.parse()?,
    };
    let res = cfg.resources()?;

    let sim = SimDevice::new(res.iova_start, res.iova_stop, &log)
        .context("Failed to start simulated device")?;
    let ops = Arc::new(SimOps::new(sim.clone(), &log));
    let transport = Transport {
        ops: ops.clone(),
        dma: sim.dma.clone(),
        irq_chip: sim.irq_chip.clone(),
        event_processor: None,
    };

    let bus = MhiBus::global();
    let ctrl = Controller::register(
        &bus,
        transport,
        res,
        &cfg.controller_config(),
        &log,
    )
    .context("Failed to register controller")?;
    sim.responder().attach(&ctrl);

    let client = Arc::new(LoopbackClient {
        log: log.new(o!("component" => "loopback")),
        returned: AtomicUsize::new(0),
    });
    let drv = loopback_driver(&client);
    bus.driver_register(drv.clone())?;

    ctrl.prepare_for_power_up().context("Failed to prepare power-up")?;
    power_up(&ctrl, &sim)?;

    let ctrl_dev = ctrl.device();
    for attr in [Attr::SerialNumber, Attr::OemPkHash] {
        match ctrl_dev.attr_show(attr) {
            Ok(text) => print!("{text}"),
            Err(e) => warn!(log, "cannot show attribute";
                "attr" => attr.name(), "error" => %e),
        }
    }

    let dev_name = format!("{}_{LOOPBACK}", ctrl.name());
    let dev = bus
        .find_device(&dev_name)
        .ok_or_else(|| anyhow!("no {dev_name} device was created"))?;
    if dev.driver().is_none() {
        error!(log, "loopback driver did not bind"; "dev" => &dev_name);
    } else {
        for i in 0..queue {
            let buf = vec![i as u8; size];
            if let Err(e) = ctrl.queue_buf(&dev, DmaDir::ToDevice, buf, true) {
                warn!(log, "queue failed"; "index" => i, "error" => %e);
                break;
            }
        }
        info!(log, "buffers queued";
            "pending" => ctrl.pending_pkts(),
            "doorbells" => sim.doorbell_writes());
    }

    // Unbinding resets the channels, handing queued buffers back
    bus.driver_unregister(&drv);
    info!(log, "buffers returned";
        "count" => client.returned.load(Ordering::Relaxed));

    ctrl.queue_transition(StateTransition::Disable);
    ctrl.flush_workers();
    ctrl.unprepare_after_power_down();
    ctrl.unregister();

    info!(log, "done";
        "commands" => sim.responder().commands().len(),
        "callbacks" => ?ops.callbacks());
    Ok(())
}
