// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Set Queue Buffer State / Extract Queue Buffer State.
//!
//! Both instructions walk a run of consecutive slots which share the state of
//! the first slot examined, wrapping at the end of the queue, and stop at the
//! first slot whose state differs.  They act synchronously under the device
//! lock and never involve the worker.

use slog::{trace, warn};

use super::bits::QDIO_MAX_BUFFERS_PER_Q;
use super::state::BufferState;
use super::{probes, CondCode, Exception, Phase, QdioDevice};

/// Outcome of a buffer-state instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BsResult {
    pub cc: CondCode,
    /// Slot following the last one processed
    pub next: u16,
    /// Slots of the requested count left unprocessed
    pub remaining: u32,
    /// State byte found in the first slot examined
    pub state: u8,
}

impl BsResult {
    fn invalid(bidx: u16, count: u32) -> Self {
        Self { cc: CondCode::Cc2, next: bidx, remaining: count, state: 0 }
    }
}

#[derive(Clone, Copy, Debug)]
enum BsOp {
    Set(u8),
    Extract { auto_ack: bool },
}

impl QdioDevice {
    /// Set the state of up to `count` slots of queue `qidx`, starting at
    /// `bidx`, to `new_state`.
    pub fn sqbs(
        &self,
        qidx: u16,
        bidx: u16,
        count: u32,
        new_state: u8,
    ) -> Result<BsResult, Exception> {
        probes::qdio_sqbs!(|| (self.schid, qidx, bidx, count, new_state));
        self.buffer_state_op(qidx, bidx, count, BsOp::Set(new_state))
    }

    /// Extract the state of a run of up to `count` slots of queue `qidx`,
    /// starting at `bidx`.  With `auto_ack`, completed input slots are
    /// acknowledged as they are read.
    pub fn eqbs(
        &self,
        qidx: u16,
        bidx: u16,
        count: u32,
        auto_ack: bool,
    ) -> Result<BsResult, Exception> {
        let res =
            self.buffer_state_op(qidx, bidx, count, BsOp::Extract { auto_ack });
        if let Ok(res) = res.as_ref() {
            probes::qdio_eqbs!(|| (self.schid, qidx, bidx, count, res.state));
        }
        res
    }

    fn buffer_state_op(
        &self,
        qidx: u16,
        bidx: u16,
        count: u32,
        op: BsOp,
    ) -> Result<BsResult, Exception> {
        let state = self.lock_state();
        let geometry = match (state.phase, state.geometry.as_ref()) {
            (Phase::Active, Some(g)) if g.qebsm => g,
            _ => return Ok(BsResult::invalid(bidx, count)),
        };
        if bidx as usize >= QDIO_MAX_BUFFERS_PER_Q
            || count as usize > QDIO_MAX_BUFFERS_PER_Q
        {
            return Err(Exception::Specification);
        }
        let (dir, qnum, desc) =
            geometry.by_index(qidx as usize).ok_or(Exception::Specification)?;

        if count == 0 {
            return Ok(BsResult {
                cc: CondCode::Cc0,
                next: bidx,
                remaining: 0,
                state: 0,
            });
        }

        let mem = &self.mem;
        let start = bidx as u8;
        let first = match desc.read_state(mem, start) {
            Ok(val) => val,
            Err(e) => {
                warn!(self.log, "buffer states unreachable";
                    "dir" => ?dir, "queue" => qnum, "error" => %e);
                return Ok(BsResult::invalid(bidx, count));
            }
        };
        let run_state = BufferState::from_byte(first);

        let mut bnum = start;
        let mut done = 0u32;
        while done < count {
            if done != 0 {
                match desc.read_state(mem, bnum) {
                    Ok(cur) if BufferState::from_byte(cur) == run_state => {}
                    _ => break,
                }
            }
            let update = match op {
                BsOp::Set(val) => Some(val),
                BsOp::Extract { auto_ack: true }
                    if run_state == BufferState::INPUT_PRIMED =>
                {
                    Some(BufferState::INPUT_ACK.to_byte())
                }
                BsOp::Extract { .. } => None,
            };
            if let Some(val) = update {
                if let Err(e) = desc.write_state(mem, bnum, val) {
                    warn!(self.log, "buffer state not stored";
                        "dir" => ?dir, "queue" => qnum, "bnum" => bnum,
                        "error" => %e);
                    break;
                }
            }
            bnum = ((bnum as usize + 1) % QDIO_MAX_BUFFERS_PER_Q) as u8;
            done += 1;
        }
        drop(state);

        let remaining = count - done;
        trace!(self.log, "buffer state op";
            "op" => ?op, "dir" => ?dir, "queue" => qnum, "start" => start,
            "done" => done, "state" => first);
        Ok(BsResult {
            cc: if remaining == 0 { CondCode::Cc0 } else { CondCode::Cc1 },
            next: bnum as u16,
            remaining,
            state: first,
        })
    }
}
