// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::trace;
use strum::FromRepr;

use super::{probes, CondCode, Exception, Generation, Phase, QdioDevice};

/// Signal-adapter function codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum SigaFunction {
    Write = 0x00,
    Read = 0x01,
    Sync = 0x02,
    MultipleWrite = 0x03,
}

impl SigaFunction {
    pub fn supported_by(self, generation: Generation) -> bool {
        !matches!(
            (self, generation),
            (SigaFunction::MultipleWrite, Generation::Legacy)
        )
    }
}

impl QdioDevice {
    /// Signal the adapter about work on the queues selected by `out_mask`
    /// and `in_mask`, where queue 0 is the most significant bit.
    ///
    /// Only the masks are updated here; data moves when the worker next
    /// passes over the queues.  Queues newly enabled for scanning restart at
    /// slot 0.
    pub fn siga(
        &self,
        fc: u8,
        out_mask: u32,
        in_mask: u32,
    ) -> Result<CondCode, Exception> {
        probes::qdio_siga!(|| (self.schid, fc, out_mask, in_mask));

        let func = SigaFunction::from_repr(fc)
            .filter(|f| f.supported_by(self.opts.generation))
            .ok_or(Exception::Specification)?;

        let mut state = self.lock_state();
        match state.phase {
            Phase::Idle => return Ok(CondCode::Cc3),
            Phase::Established => return Ok(CondCode::Cc1),
            Phase::Active => {}
        }
        let (newly_in, newly_out) = match func {
            SigaFunction::Read => (state.input.enable(in_mask), 0),
            SigaFunction::Write | SigaFunction::MultipleWrite => {
                (0, state.output.enable(out_mask))
            }
            SigaFunction::Sync => {
                (state.input.enable(in_mask), state.output.enable(out_mask))
            }
        };
        drop(state);

        trace!(self.log, "siga";
            "func" => ?func,
            "newly_in" => format_args!("{newly_in:#010x}"),
            "newly_out" => format_args!("{newly_out:#010x}"),
        );
        self.wake_worker();
        Ok(CondCode::Cc0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::qdio::testutil::*;
    use crate::hw::qdio::{queue_bit, DeviceOpts};

    #[test]
    fn function_codes() {
        assert_eq!(SigaFunction::from_repr(0), Some(SigaFunction::Write));
        assert_eq!(SigaFunction::from_repr(1), Some(SigaFunction::Read));
        assert_eq!(SigaFunction::from_repr(2), Some(SigaFunction::Sync));
        assert_eq!(
            SigaFunction::from_repr(3),
            Some(SigaFunction::MultipleWrite)
        );
        assert_eq!(SigaFunction::from_repr(4), None);
        assert!(!SigaFunction::MultipleWrite.supported_by(Generation::Legacy));
        assert!(SigaFunction::MultipleWrite.supported_by(Generation::Enhanced));
    }

    #[test]
    fn condition_codes() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(Default::default());
        let all = u32::MAX;

        assert_eq!(dev.siga(0, all, 0), Ok(CondCode::Cc3));
        tg.establish(&dev).unwrap();
        assert_eq!(dev.siga(0, all, 0), Ok(CondCode::Cc1));
        dev.activate().unwrap();
        assert_eq!(dev.siga(0, all, 0), Ok(CondCode::Cc0));
        assert_eq!(dev.siga(2, all, all), Ok(CondCode::Cc0));
    }

    #[test]
    fn specification_exceptions() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(DeviceOpts {
            generation: Generation::Legacy,
            ..Default::default()
        });
        // Checked ahead of the device state
        assert_eq!(dev.siga(3, 0, 0), Err(Exception::Specification));
        assert_eq!(dev.siga(0x7f, 0, 0), Err(Exception::Specification));

        tg.establish(&dev).unwrap();
        dev.activate().unwrap();
        assert_eq!(dev.siga(3, u32::MAX, 0), Err(Exception::Specification));
        // The device remains usable
        assert_eq!(dev.siga(0, u32::MAX, 0), Ok(CondCode::Cc0));
    }

    #[test]
    fn masks_by_direction() {
        let tg = TestGuest::new(2, 3);
        let dev = tg.device(Default::default());
        tg.establish(&dev).unwrap();
        dev.activate().unwrap();

        {
            let state = dev.lock_state();
            assert_eq!(state.input.enabled, queue_bit(0) | queue_bit(1));
            assert_eq!(state.output.enabled, 0);
        }

        dev.siga(0, queue_bit(1) | queue_bit(7), queue_bit(0)).unwrap();
        assert_eq!(dev.lock_state().output.enabled, queue_bit(1));

        dev.siga(3, queue_bit(2), 0).unwrap();
        assert_eq!(
            dev.lock_state().output.enabled,
            queue_bit(1) | queue_bit(2)
        );
    }

    #[test]
    fn reenable_resets_position() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(Default::default());
        tg.establish(&dev).unwrap();
        dev.activate().unwrap();

        dev.siga(0, queue_bit(0), 0).unwrap();
        {
            let mut state = dev.lock_state();
            state.output.queues[0].bpos = 40;
        }
        // Already enabled: position kept, queue marked as kicked
        dev.siga(0, queue_bit(0), 0).unwrap();
        {
            let mut state = dev.lock_state();
            assert_eq!(state.output.queues[0].bpos, 40);
            assert!(state.output.queues[0].kicked);
            state.output.disable(0);
        }
        dev.siga(0, queue_bit(0), 0).unwrap();
        let state = dev.lock_state();
        assert_eq!(state.output.queues[0].bpos, 0);
        assert!(!state.output.queues[0].kicked);
    }
}
