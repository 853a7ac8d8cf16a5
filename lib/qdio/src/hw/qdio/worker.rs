// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adapter-side queue servicing.
//!
//! Each pass drains the enabled output queues, then fills the enabled input
//! queues, visiting the queues of a direction round-robin.  Within a queue the
//! scan resumes at the slot following the last one inspected, so that every
//! slot is eventually considered under sustained load.  The device lock is
//! taken per slot: the state byte is read, the buffer serviced, and its new
//! state written without another party transitioning the slot in between.

use std::io;
use std::mem::size_of;
use std::sync::atomic::Ordering;

use slog::{debug, error, info, trace, warn};
use thiserror::Error;
use zerocopy::byteorder::big_endian::{U32, U64};

use super::bits::{
    Sbal, SbalEflags, QDIO_MAX_BUFFERS_PER_Q, QDIO_MAX_FRAME_LEN,
};
use super::establish::QueueDesc;
use super::notify::IntrReason;
use super::state::{BufferState, Direction};
use super::{probes, ActivateError, Phase, QdioDevice, Worker};
use crate::common::{GuestAddr, GuestRegion};
use crate::port::PortError;
use crate::tasks::{Event, TaskHdl};
use crate::vmm::{Access, AccessError};

/// Summary of one worker pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Buffers handed back to the guest as completed
    pub completed: usize,
    /// Buffers handed back to the guest in the error state
    pub errors: usize,
    /// Queues disabled because their state array became unreachable
    pub faulted: usize,
    /// A notification was owed, and signaled, at the end of the pass
    pub notified: bool,
}

#[derive(Debug, Error)]
enum SlotError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("frame of {len} bytes exceeds buffer capacity of {capacity}")]
    Oversized { len: usize, capacity: usize },

    #[error("no frame available")]
    NoFrame,
}

struct Completion {
    bytes: usize,
    pci: bool,
}

fn next_slot(bnum: u8) -> u8 {
    ((bnum as usize + 1) % QDIO_MAX_BUFFERS_PER_Q) as u8
}

impl QdioDevice {
    /// Make one pass over the active queues, then signal the guest if any
    /// completion owes it a notification.
    pub fn service(&self) -> PassReport {
        let mut report = PassReport::default();
        let mut owed = false;
        self.service_dir(Direction::Output, &mut report, &mut owed);
        self.service_dir(Direction::Input, &mut report, &mut owed);

        if owed {
            let thin = self
                .lock_state()
                .geometry
                .as_ref()
                .and_then(|g| g.thin);
            self.notifier.signal_completion(
                &self.mem,
                thin.as_ref(),
                report.errors != 0,
            );
            report.notified = true;
        }
        report
    }

    fn service_dir(
        &self,
        dir: Direction,
        report: &mut PassReport,
        owed: &mut bool,
    ) {
        let (count, start) = {
            let mut state = self.lock_state();
            if state.phase != Phase::Active {
                return;
            }
            let scan = state.dir(dir);
            let count = scan.queues.len();
            if count == 0 {
                return;
            }
            let start = scan.next_queue as usize % count;
            scan.next_queue = ((start + 1) % count) as u8;
            (count, start)
        };

        for step in 0..count {
            if self.halting.load(Ordering::Acquire) {
                return;
            }
            let qnum = ((start + step) % count) as u8;
            self.visit_queue(dir, qnum, report, owed);
        }
    }

    fn visit_queue(
        &self,
        dir: Direction,
        qnum: u8,
        report: &mut PassReport,
        owed: &mut bool,
    ) {
        let q = qnum as usize;
        let batch = match dir {
            Direction::Output => self.opts.output_batch as usize,
            Direction::Input => QDIO_MAX_BUFFERS_PER_Q,
        };
        let mut serviced = 0;
        let mut idle = 0;

        while serviced < batch {
            if self.halting.load(Ordering::Acquire) {
                break;
            }
            if dir == Direction::Input && !self.port.has_pending(qnum) {
                break;
            }

            let mut state = self.lock_state();
            if state.phase != Phase::Active {
                break;
            }
            let desc = match state.geometry.as_ref() {
                Some(g) => g.queues(dir)[q],
                None => break,
            };
            let scan = state.dir(dir);
            if !scan.is_enabled(q) {
                break;
            }
            if idle == QDIO_MAX_BUFFERS_PER_Q {
                // A full lap without work.  Output queues wait for the next
                // doorbell unless one arrived during the lap.
                if dir == Direction::Output && !scan.queues[q].kicked {
                    scan.disable(q);
                }
                scan.queues[q].kicked = false;
                break;
            }

            let bnum = scan.queues[q].bpos;
            let cur = match desc.read_state(&self.mem, bnum) {
                Ok(val) => BufferState::from_byte(val),
                Err(e) => {
                    error!(self.log, "buffer states unreachable, queue faulted";
                        "dir" => ?dir, "queue" => qnum, "error" => %e);
                    scan.disable(q);
                    report.faulted += 1;
                    break;
                }
            };
            scan.queues[q].bpos = next_slot(bnum);
            if !cur.adapter_ready(dir) {
                idle += 1;
                continue;
            }
            idle = 0;

            let outcome = match dir {
                Direction::Output => self.drain_output(&desc, qnum, bnum),
                Direction::Input => self.fill_input(&desc, qnum, bnum),
            };
            let next = match outcome {
                Ok(done) => {
                    trace!(self.log, "buffer complete";
                        "dir" => ?dir, "queue" => qnum, "bnum" => bnum,
                        "bytes" => done.bytes);
                    report.completed += 1;
                    if dir == Direction::Input
                        || done.pci
                        || self.opts.notify_output
                    {
                        *owed = true;
                    }
                    BufferState::completed(dir)
                }
                Err(SlotError::NoFrame) => {
                    // Port drained underneath us; leave the slot for later
                    state.dir(dir).queues[q].bpos = bnum;
                    break;
                }
                Err(e) => {
                    warn!(self.log, "buffer failed";
                        "dir" => ?dir, "queue" => qnum, "bnum" => bnum,
                        "error" => %e);
                    report.errors += 1;
                    *owed = true;
                    BufferState::error(dir)
                }
            };
            let val = next.to_byte();
            if let Err(e) = desc.write_state(&self.mem, bnum, val) {
                error!(self.log, "buffer state not stored, queue faulted";
                    "dir" => ?dir, "queue" => qnum, "bnum" => bnum,
                    "error" => %e);
                state.dir(dir).disable(q);
                report.faulted += 1;
                break;
            }
            probes::qdio_buf_complete!(|| (
                self.schid,
                dir.is_output() as u8,
                qnum,
                bnum,
                val
            ));
            serviced += 1;
        }
    }

    /// Fetch the storage-block-address list for slot `bnum`.
    fn resolve_sbal(
        &self,
        desc: &QueueDesc,
        bnum: u8,
    ) -> Result<(GuestAddr, Sbal), AccessError> {
        let entry: U64 = self.mem.read(desc.sl_entry(bnum), desc.sl.key)?;
        let addr = GuestAddr(entry.get());
        let sbal: Sbal = self.mem.read(addr, desc.buf_key)?;
        Ok((addr, sbal))
    }

    fn drain_output(
        &self,
        desc: &QueueDesc,
        qnum: u8,
        bnum: u8,
    ) -> Result<Completion, SlotError> {
        let (_addr, sbal) = self.resolve_sbal(desc, bnum)?;

        let total: usize =
            sbal.used().iter().map(|e| e.length.get() as usize).sum();
        if total > QDIO_MAX_FRAME_LEN {
            return Err(SlotError::Oversized {
                len: total,
                capacity: QDIO_MAX_FRAME_LEN,
            });
        }

        let mut frame = Vec::with_capacity(total);
        let mut pci = false;
        for sbale in sbal.used() {
            pci |= sbale.wants_pci();
            let len = sbale.length.get() as usize;
            if len == 0 {
                continue;
            }
            let addr = GuestAddr(sbale.addr.get());
            let region = GuestRegion(addr, len);
            self.mem.probe(region, desc.buf_key, Access::Fetch)?;
            let at = frame.len();
            frame.resize(at + len, 0);
            self.mem.read_bytes(addr, desc.buf_key, &mut frame[at..])?;
        }

        self.port.transmit(qnum, &frame)?;
        Ok(Completion { bytes: frame.len(), pci })
    }

    fn fill_input(
        &self,
        desc: &QueueDesc,
        qnum: u8,
        bnum: u8,
    ) -> Result<Completion, SlotError> {
        let (sbal_addr, mut sbal) = self.resolve_sbal(desc, bnum)?;
        self.mem.probe(
            GuestRegion(sbal_addr, size_of::<Sbal>()),
            desc.buf_key,
            Access::Store,
        )?;

        let used = sbal.used().len();
        let mut capacity = 0;
        for sbale in sbal.entries[..used].iter() {
            let len = sbale.length.get() as usize;
            let addr = GuestAddr(sbale.addr.get());
            let region = GuestRegion(addr, len);
            self.mem.probe(region, desc.buf_key, Access::Store)?;
            capacity += len;
        }

        // Everything is reachable: only now take a frame from the port
        let frame = self.port.receive(qnum)?.ok_or(SlotError::NoFrame)?;
        if frame.len() > capacity {
            return Err(SlotError::Oversized { len: frame.len(), capacity });
        }

        let mut off = 0;
        let mut last = 0;
        for (idx, sbale) in sbal.entries[..used].iter_mut().enumerate() {
            let take =
                std::cmp::min(sbale.length.get() as usize, frame.len() - off);
            if take != 0 {
                self.mem.write_bytes(
                    GuestAddr(sbale.addr.get()),
                    desc.buf_key,
                    &frame[off..off + take],
                )?;
            }
            sbale.length = U32::new(take as u32);
            off += take;
            last = idx;
            if off == frame.len() {
                break;
            }
        }
        sbal.entries[last].eflags |= SbalEflags::LAST_ENTRY.bits();
        self.mem.write(sbal_addr, desc.buf_key, &sbal)?;

        Ok(Completion { bytes: frame.len(), pci: false })
    }

    /// Stop scanning and drop the established queues, leaving every buffer
    /// state as it was.
    ///
    /// A slot being serviced is finished first.  When the queues were active,
    /// the end of the activation is signaled with a full interrupt.
    pub fn halt_queues(&self) {
        self.halting.store(true, Ordering::Release);
        let was_active = {
            let mut state = self.lock_state();
            let was_active = state.phase == Phase::Active;
            state.teardown();
            was_active
        };
        self.halting.store(false, Ordering::Release);

        info!(self.log, "queues halted"; "was_active" => was_active);
        self.wake_worker();
        if was_active {
            self.notifier.post(IntrReason::ActivateEnded);
        }
    }

    /// Notify the worker that the port has frames for the input queues.
    pub fn input_available(&self) {
        self.wake_worker();
    }

    /// Service the active queues on the calling thread until they are
    /// halted or the worker is stopped.
    pub fn run_worker(&self) -> Result<(), ActivateError> {
        if !self.is_active() {
            return Err(ActivateError::NotActive);
        }
        let hdl = self.install_worker().ok_or(ActivateError::WorkerRunning)?;
        self.worker_loop(&hdl, true);

        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().map(|w| hdl.is_controlled_by(&w.ctrl)) == Some(true)
        {
            *worker = None;
        }
        Ok(())
    }

    /// Service queues from a background thread until [Self::stop_worker].
    ///
    /// Does nothing when a worker is already running.
    pub fn spawn_worker(&self) -> io::Result<()> {
        let Some(this) = self.this.upgrade() else {
            return Err(io::Error::new(io::ErrorKind::Other, "device dropped"));
        };
        let Some(hdl) = self.install_worker() else {
            return Ok(());
        };
        let res = std::thread::Builder::new()
            .name(format!("qdio-{:x}", self.schid))
            .spawn(move || this.worker_loop(&hdl, false));
        let mut worker = self.worker.lock().unwrap();
        match res {
            Ok(thread) => {
                if let Some(w) = worker.as_mut() {
                    w.thread = Some(thread);
                }
                Ok(())
            }
            Err(e) => {
                *worker = None;
                Err(e)
            }
        }
    }

    /// Stop the worker, waiting for a background thread to exit.
    pub fn stop_worker(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(mut w) = worker {
            w.ctrl.exit();
            if let Some(thread) = w.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn install_worker(&self) -> Option<TaskHdl> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return None;
        }
        let (hdl, ctrl) = TaskHdl::new(None);
        *worker = Some(Worker { ctrl, thread: None });
        Some(hdl)
    }

    fn worker_loop(&self, hdl: &TaskHdl, until_halted: bool) {
        debug!(self.log, "worker started");
        loop {
            if until_halted && !self.is_active() {
                break;
            }
            let report = self.service();
            if report != PassReport::default() {
                trace!(self.log, "pass"; "report" => ?report);
            }
            match hdl.wait(self.opts.poll_interval) {
                Event::Exit => break,
                Event::Hold => {
                    hdl.hold();
                    if hdl.pending_event() == Some(Event::Exit) {
                        break;
                    }
                }
                Event::Work | Event::Timeout => {}
            }
        }
        debug!(self.log, "worker exited");
    }
}
