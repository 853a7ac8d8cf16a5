// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queued Direct I/O adapter queue engine.
//!
//! The guest describes its queues in storage and hands buffers back and forth
//! with the adapter by flipping per-slot state bytes.  The device parses and
//! validates that geometry once at [QdioDevice::establish], goes live at
//! [QdioDevice::activate], and from then on services buffers from a worker
//! (see [QdioDevice::run_worker] and [QdioDevice::spawn_worker]) as doorbells
//! ([QdioDevice::siga]) arrive.  Guests which negotiated the lightweight
//! capability may also flip slot ownership directly with
//! [QdioDevice::sqbs] and [QdioDevice::eqbs].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use slog::{info, o, Logger};
use thiserror::Error;

use crate::common::Lifecycle;
use crate::port::PayloadPort;
use crate::tasks::TaskCtrl;
use crate::vmm::{AccessError, GuestMem};

pub mod bits;
pub mod bufstate;
pub mod doorbell;
pub mod establish;
pub mod notify;
pub mod state;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use bufstate::BsResult;
pub use doorbell::SigaFunction;
pub use establish::{Geometry, Indicators, QueueDesc, Span};
pub use notify::{IntrReason, Notice, NoticeFn, PendingIntr};
pub use state::{BufferState, Direction, Owner, StateCode};
pub use worker::PassReport;

pub use qdio_config::Generation;

#[usdt::provider(provider = "qdio")]
mod probes {
    fn qdio_siga(schid: u32, fc: u8, omask: u32, imask: u32) {}
    fn qdio_sqbs(schid: u32, qidx: u16, bidx: u16, count: u32, state: u8) {}
    fn qdio_eqbs(schid: u32, qidx: u16, bidx: u16, count: u32, state: u8) {}
    fn qdio_buf_complete(schid: u32, dir: u8, qnum: u8, bnum: u8, state: u8) {}
}

/// Errors establishing queues from a guest descriptor record
#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("descriptor access failed: {0}")]
    Access(#[from] AccessError),

    #[error("unsupported descriptor record format {0}")]
    UnsupportedFormat(u8),

    #[error("unsupported queue descriptor size of {0} words")]
    DescriptorSize(u8),

    #[error("queue counts in:{inputs} out:{outputs} outside supported range")]
    QueueCount { inputs: u8, outputs: u8 },

    #[error("queues are active")]
    Busy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActivateError {
    #[error("queues not established")]
    NotEstablished,

    #[error("queues already active")]
    AlreadyActive,

    #[error("queues not active")]
    NotActive,

    #[error("a worker is already servicing the queues")]
    WorkerRunning,
}

/// Program exception presented to the guest instead of a condition code
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Exception {
    #[error("specification exception")]
    Specification,
}

/// Condition code set by a guest-issued instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CondCode {
    /// Accepted, or fully processed
    Cc0 = 0,
    /// Device not queue-active, or partially processed
    Cc1 = 1,
    /// Subchannel invalid for buffer-state instructions
    Cc2 = 2,
    /// Subchannel not operational for queue operations
    Cc3 = 3,
}

/// Adapter behavior knobs
#[derive(Clone, Debug)]
pub struct DeviceOpts {
    pub generation: Generation,
    pub qebsm: bool,
    pub thin_interrupts: bool,
    pub max_input_queues: u8,
    pub max_output_queues: u8,
    pub poll_interval: Duration,
    pub output_batch: u8,
    pub notify_output: bool,
}

impl Default for DeviceOpts {
    fn default() -> Self {
        Self {
            generation: Generation::Enhanced,
            qebsm: true,
            thin_interrupts: true,
            max_input_queues: bits::QDIO_MAX_QUEUES_PER_DIR as u8,
            max_output_queues: bits::QDIO_MAX_QUEUES_PER_DIR as u8,
            poll_interval: Duration::from_millis(50),
            output_batch: 16,
            notify_output: true,
        }
    }
}

impl DeviceOpts {
    /// Pull every limit into the range the queue engine supports.
    fn clamped(self) -> Self {
        let max_queues = bits::QDIO_MAX_QUEUES_PER_DIR as u8;
        let max_batch = bits::QDIO_MAX_BUFFERS_PER_Q as u8;
        Self {
            max_input_queues: self.max_input_queues.clamp(1, max_queues),
            max_output_queues: self.max_output_queues.clamp(1, max_queues),
            output_batch: self.output_batch.clamp(1, max_batch),
            poll_interval: self.poll_interval.max(Duration::from_millis(1)),
            ..self
        }
    }
}

impl From<&qdio_config::Adapter> for DeviceOpts {
    fn from(cfg: &qdio_config::Adapter) -> Self {
        Self {
            generation: cfg.generation,
            qebsm: cfg.qebsm,
            thin_interrupts: cfg.thin_interrupts,
            max_input_queues: cfg.max_input_queues,
            max_output_queues: cfg.max_output_queues,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            output_batch: cfg.output_batch,
            notify_output: cfg.notify_output,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Established,
    Active,
}

/// Doorbell mask bit for a queue number, zero past the mask width
pub(crate) const fn queue_bit(q: usize) -> u32 {
    match 0x8000_0000u32.checked_shr(q as u32) {
        Some(bit) => bit,
        None => 0,
    }
}

/// Mask of the bits valid for `count` queues
pub(crate) fn queue_mask(count: usize) -> u32 {
    match count {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => !0u32 << (32 - n),
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct QueueScan {
    /// Next slot the worker will inspect
    bpos: u8,
    /// Doorbell arrived for the queue while it was already enabled
    kicked: bool,
}

#[derive(Debug, Default)]
struct DirScan {
    enabled: u32,
    next_queue: u8,
    queues: Vec<QueueScan>,
}

impl DirScan {
    fn reset(&mut self, count: usize) {
        self.enabled = 0;
        self.next_queue = 0;
        self.queues = vec![QueueScan::default(); count];
    }

    /// Merge `mask` into the enabled set, returning the newly enabled bits.
    fn enable(&mut self, mask: u32) -> u32 {
        let mask = mask & queue_mask(self.queues.len());
        let newly = mask & !self.enabled;
        for (q, scan) in self.queues.iter_mut().enumerate() {
            let bit = queue_bit(q);
            if newly & bit != 0 {
                *scan = QueueScan::default();
            } else if mask & bit != 0 {
                scan.kicked = true;
            }
        }
        self.enabled |= mask;
        newly
    }

    fn is_enabled(&self, q: usize) -> bool {
        self.enabled & queue_bit(q) != 0
    }

    fn disable(&mut self, q: usize) {
        self.enabled &= !queue_bit(q);
    }
}

struct State {
    phase: Phase,
    geometry: Option<Geometry>,
    /// Bumped on every establish
    generation: u32,
    input: DirScan,
    output: DirScan,
}

impl State {
    fn dir(&mut self, dir: Direction) -> &mut DirScan {
        match dir {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    fn teardown(&mut self) {
        self.phase = Phase::Idle;
        self.geometry = None;
        self.input.reset(0);
        self.output.reset(0);
    }
}

struct Worker {
    ctrl: TaskCtrl,
    thread: Option<JoinHandle<()>>,
}

/// An emulated QDIO adapter attached at one subchannel
pub struct QdioDevice {
    schid: u32,
    opts: DeviceOpts,
    mem: Arc<GuestMem>,
    port: Arc<dyn PayloadPort>,

    state: Mutex<State>,
    notifier: notify::Notifier,
    worker: Mutex<Option<Worker>>,
    /// Set while a halt waits for the worker to reach a slot boundary
    halting: AtomicBool,

    this: Weak<Self>,
    log: Logger,
}

impl QdioDevice {
    pub fn create(
        schid: u32,
        opts: DeviceOpts,
        mem: Arc<GuestMem>,
        port: Arc<dyn PayloadPort>,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!("component" => "qdio", "schid" => schid));
        let opts = opts.clamped();
        Arc::new_cyclic(|this| Self {
            schid,
            opts,
            mem,
            port,
            state: Mutex::new(State {
                phase: Phase::Idle,
                geometry: None,
                generation: 0,
                input: DirScan::default(),
                output: DirScan::default(),
            }),
            notifier: notify::Notifier::new(schid, log.clone()),
            worker: Mutex::new(None),
            halting: AtomicBool::new(false),
            this: this.clone(),
            log,
        })
    }

    pub fn subchannel(&self) -> u32 {
        self.schid
    }

    pub fn opts(&self) -> &DeviceOpts {
        &self.opts
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    pub(crate) fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    /// Subchannel token minted at establish, when the guest negotiated the
    /// lightweight buffer-state instructions.
    pub fn token(&self) -> Option<u64> {
        self.state.lock().unwrap().geometry.as_ref().and_then(|g| g.token)
    }

    /// Snapshot of the geometry captured at establish
    pub fn geometry(&self) -> Option<Geometry> {
        self.state.lock().unwrap().geometry.clone()
    }

    /// Install a callback for side-channel notices
    pub fn set_notice_fn(&self, f: Option<Arc<NoticeFn>>) {
        self.notifier.set_notice_fn(f);
    }

    /// Remove the oldest pending full interrupt
    pub fn take_interrupt(&self) -> Option<PendingIntr> {
        self.notifier.take()
    }

    pub fn interrupt_pending(&self) -> bool {
        self.notifier.is_pending()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Wake the worker, if one is running, to make a pass over the queues.
    fn wake_worker(&self) {
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            let _ = worker.ctrl.notify();
        }
    }

    fn worker_ctrl(&self) -> Option<TaskCtrl> {
        self.worker.lock().unwrap().as_ref().map(|w| w.ctrl.clone())
    }

    /// Drop all queue state without signaling the guest.
    fn teardown(&self) {
        self.halting.store(true, Ordering::Release);
        self.lock_state().teardown();
        self.halting.store(false, Ordering::Release);
    }
}

impl Lifecycle for QdioDevice {
    fn type_name(&self) -> &'static str {
        "qdio"
    }
    fn start(&self) -> anyhow::Result<()> {
        self.spawn_worker()?;
        Ok(())
    }
    fn pause(&self) {
        if let Some(mut ctrl) = self.worker_ctrl() {
            let _ = ctrl.hold();
        }
    }
    fn resume(&self) {
        if let Some(mut ctrl) = self.worker_ctrl() {
            let _ = ctrl.run();
        }
    }
    fn reset(&self) {
        self.teardown();
        self.notifier.clear();
        info!(self.log, "reset");
    }
    fn halt(&self) {
        self.stop_worker();
        self.teardown();
    }
}
