// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event rings and scheduling of their bottom halves.
//!
//! Draining an event ring is data-plane work supplied by the integrator
//! through [`EventProcessor`].  The core decides when a ring needs service
//! and runs the processor on the controller's bottom-half worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, error};

use crate::bits::{BrstMode, EvType, EventCtxt};
use crate::common::RING_ELEMENT_SIZE;
use crate::config::EventParams;
use crate::controller::Controller;
use crate::pm::Callback;
use crate::ring::Ring;

/// Data-plane event processing, run in bottom-half context.
pub trait EventProcessor: Send + Sync + 'static {
    /// Drain transfer completions from data event ring `er`.
    fn process_data_events(&self, ctrl: &Controller, er: u32);

    /// Drain state change and command completion events from control event
    /// ring `er`.
    fn process_ctrl_events(&self, ctrl: &Controller, er: u32);
}

pub struct EventRing {
    pub(crate) index: u32,
    pub(crate) intmod: u32,
    pub(crate) irq: u32,
    /// Dedicated channel
    pub(crate) chan: Option<u32>,
    pub(crate) priority: u32,
    pub(crate) brstmode: BrstMode,
    pub(crate) data_type: EvType,
    pub(crate) hw_ring: bool,
    pub(crate) client_managed: bool,
    pub(crate) offload: bool,
    pub(crate) ring: Mutex<Ring>,
    pub(crate) db_mode: AtomicBool,
    scheduled: AtomicBool,
}

impl EventRing {
    pub(crate) fn new(params: &EventParams) -> Self {
        Self {
            index: params.index,
            intmod: params.intmod,
            irq: params.irq,
            chan: params.chan,
            priority: params.priority,
            brstmode: params.brstmode,
            data_type: params.data_type,
            hw_ring: params.hw_ring,
            client_managed: params.client_managed,
            offload: params.offload,
            ring: Mutex::new(Ring::new(RING_ELEMENT_SIZE, params.elements)),
            db_mode: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn irq(&self) -> u32 {
        self.irq
    }
    pub fn data_type(&self) -> EvType {
        self.data_type
    }
    pub fn priority(&self) -> u32 {
        self.priority
    }
    pub fn is_hw_ring(&self) -> bool {
        self.hw_ring
    }
    pub fn is_offload(&self) -> bool {
        self.offload
    }
}

impl Controller {
    /// Interrupt service for event ring `er`.
    pub(crate) fn event_irq(self: &Arc<Self>, er: u32) {
        let Some(ev) = self.events.get(er as usize) else { return };
        let Some(dev_rp) = self.event_ctxt_rp(er) else { return };

        {
            let ring = ev.ring.lock().unwrap();
            if !ring.contains_dev_addr(dev_rp) {
                error!(self.log, "event ring rp points outside of the ring";
                    "er" => er, "rp" => format!("{dev_rp:#x}"));
                return;
            }
            if dev_rp == ring.dev_rp().0 {
                return;
            }
        }

        if ev.client_managed {
            let dev = ev
                .chan
                .and_then(|chan| self.channel(chan).ok())
                .and_then(|ch| ch.device());
            if let Some(dev) = dev {
                dev.notify(Callback::PendingData);
            }
            return;
        }
        self.schedule_bh(er);
    }

    /// Device read pointer of event ring `er`, from its context entry.
    fn event_ctxt_rp(&self, er: u32) -> Option<u64> {
        let ctxt = self.dev_ctxt.lock().unwrap();
        let er_ctxt = &ctxt.as_ref()?.er_ctxt;
        Some(er_ctxt.read_u64(er as usize * EventCtxt::SIZE + EventCtxt::RP))
    }

    /// Queue the bottom half of event ring `er`, unless already queued.
    pub fn schedule_bh(self: &Arc<Self>, er: u32) {
        let Some(ev) = self.events.get(er as usize) else { return };
        if ev.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(self);
        let queued = match self.bh_worker.lock().unwrap().as_ref() {
            Some(worker) => worker.queue(move || {
                if let Some(ctrl) = weak.upgrade() {
                    ctrl.run_bh(er);
                }
            }),
            None => false,
        };
        if !queued {
            ev.scheduled.store(false, Ordering::Release);
        }
    }

    fn run_bh(&self, er: u32) {
        let ev = &self.events[er as usize];
        ev.scheduled.store(false, Ordering::Release);
        let Some(processor) = self.event_processor.as_ref() else {
            debug!(self.log, "no event processor installed"; "er" => er);
            return;
        };
        match ev.data_type {
            EvType::Data => processor.process_data_events(self, er),
            EvType::Ctrl => processor.process_ctrl_events(self, er),
        }
    }
}
