// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{info, warn};
use zerocopy::byteorder::big_endian::U64;

use super::bits::*;
use super::notify::IntrReason;
use super::state::Direction;
use super::{ActivateError, EstablishError, Phase, QdioDevice};
use crate::common::{GuestAddr, GuestRegion};
use crate::vmm::{Access, AccessError, AccessKey, GuestMem};

/// A guest structure and the key it is accessed under
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub addr: GuestAddr,
    pub key: AccessKey,
}

impl Span {
    fn probe(
        &self,
        mem: &GuestMem,
        len: usize,
        access: Access,
    ) -> Result<(), AccessError> {
        mem.probe(GuestRegion(self.addr, len), self.key, access)
    }
}

/// Captured geometry of one queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueDesc {
    pub slib: Span,
    pub sl: Span,
    pub slsb: Span,
    /// Key for the buffers named by the storage list, and their fragments
    pub buf_key: AccessKey,
}

impl QueueDesc {
    fn from_raw(raw: &Qdes0) -> Self {
        Self {
            slib: Span {
                addr: GuestAddr(raw.sliba.get()),
                key: raw.slib_key(),
            },
            sl: Span { addr: GuestAddr(raw.sla.get()), key: raw.sl_key() },
            slsb: Span {
                addr: GuestAddr(raw.slsba.get()),
                key: raw.slsb_key(),
            },
            buf_key: raw.buf_key(),
        }
    }

    fn validate(&self, mem: &GuestMem) -> Result<(), AccessError> {
        self.slib.probe(mem, SLIB_LEN, Access::Fetch)?;
        self.sl.probe(mem, SL_LEN, Access::Fetch)?;
        self.slsb.probe(mem, SLSB_LEN, Access::Store)?;
        Ok(())
    }

    /// Address of the storage-list entry for slot `bnum`
    pub fn sl_entry(&self, bnum: u8) -> GuestAddr {
        self.sl.addr.offset::<U64>(bnum as usize)
    }

    /// Address of the state byte for slot `bnum`
    pub fn slsb_entry(&self, bnum: u8) -> GuestAddr {
        self.slsb.addr + bnum as usize
    }

    /// Current state byte of slot `bnum`
    pub fn read_state(
        &self,
        mem: &GuestMem,
        bnum: u8,
    ) -> Result<u8, AccessError> {
        mem.read::<u8>(self.slsb_entry(bnum), self.slsb.key)
    }

    pub fn write_state(
        &self,
        mem: &GuestMem,
        bnum: u8,
        val: u8,
    ) -> Result<(), AccessError> {
        mem.write(self.slsb_entry(bnum), self.slsb.key, &val)
    }
}

/// Thin-interrupt indicator bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Indicators {
    /// Adapter-local summary indicator
    pub alsi: Span,
    /// Device-state-change indicator
    pub dsci: Span,
    pub isc: u8,
}

impl Indicators {
    fn from_parm(parm: &ThinIntParm) -> Self {
        Self {
            alsi: Span {
                addr: GuestAddr(parm.alsi.get()),
                key: parm.alsi_key(),
            },
            dsci: Span {
                addr: GuestAddr(parm.dsci.get()),
                key: parm.dsci_key(),
            },
            isc: parm.isc,
        }
    }

    fn validate(&self, mem: &GuestMem) -> Result<(), AccessError> {
        self.alsi.probe(mem, 1, Access::Store)?;
        self.dsci.probe(mem, 1, Access::Store)?;
        Ok(())
    }
}

/// Queue geometry validated at establish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub inputs: Vec<QueueDesc>,
    pub outputs: Vec<QueueDesc>,
    pub qib: Span,
    /// Lightweight buffer-state instructions granted
    pub qebsm: bool,
    /// Thin indicators, when requested, allowed and reachable
    pub thin: Option<Indicators>,
    pub token: Option<u64>,
}

impl Geometry {
    pub fn queues(&self, dir: Direction) -> &[QueueDesc] {
        match dir {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    /// Resolve a queue index in the buffer-state instruction numbering:
    /// input queues first, then output queues.
    pub fn by_index(&self, qidx: usize) -> Option<(Direction, u8, QueueDesc)> {
        if qidx < self.inputs.len() {
            Some((Direction::Input, qidx as u8, self.inputs[qidx]))
        } else {
            let onum = qidx - self.inputs.len();
            self.outputs
                .get(onum)
                .map(|desc| (Direction::Output, onum as u8, *desc))
        }
    }
}

impl QdioDevice {
    /// Parse and validate the queue descriptor record at `qdr`, read under
    /// `key`.
    ///
    /// Nothing is committed unless every referenced structure passes its
    /// checks.  A previous, inactive establish is replaced.
    pub fn establish(
        &self,
        qdr: GuestAddr,
        key: AccessKey,
    ) -> Result<(), EstablishError> {
        let mut state = self.lock_state();
        if state.phase == Phase::Active {
            return Err(EstablishError::Busy);
        }

        let generation = state.generation.wrapping_add(1);
        let geometry = match self.parse_geometry(qdr, key, generation) {
            Ok(geometry) => geometry,
            Err(e) => {
                warn!(self.log, "establish failed";
                    "qdr" => %qdr, "error" => %e);
                return Err(e);
            }
        };

        if geometry.qebsm {
            let ac = geometry.qib.addr + QIB_AC_OFFSET;
            let old = self.mem.read::<u8>(ac, geometry.qib.key)?;
            let granted = old | QibAc::QEBSM_GRANTED.bits();
            self.mem.write(ac, geometry.qib.key, &granted)?;
        }

        info!(self.log, "queues established";
            "inputs" => geometry.inputs.len(),
            "outputs" => geometry.outputs.len(),
            "qebsm" => geometry.qebsm,
            "thin" => geometry.thin.is_some(),
        );

        state.generation = generation;
        state.input.reset(geometry.inputs.len());
        state.output.reset(geometry.outputs.len());
        state.geometry = Some(geometry);
        state.phase = Phase::Established;
        drop(state);

        self.notifier.post(IntrReason::EstablishComplete);
        Ok(())
    }

    fn parse_geometry(
        &self,
        qdr: GuestAddr,
        key: AccessKey,
        generation: u32,
    ) -> Result<Geometry, EstablishError> {
        let mem = &self.mem;
        let hdr: QdrHeader = mem.read(qdr, key)?;
        if hdr.qfmt != QDR_FORMAT_0 {
            return Err(EstablishError::UnsupportedFormat(hdr.qfmt));
        }
        for sz in [hdr.iqdsz, hdr.oqdsz] {
            if sz != QDES_SIZE_WORDS {
                return Err(EstablishError::DescriptorSize(sz));
            }
        }
        let (inputs, outputs) = (hdr.iqdcnt, hdr.oqdcnt);
        let limit = QDIO_MAX_QUEUES_PER_DIR as u8;
        let max_in = self.opts.max_input_queues.min(limit);
        let max_out = self.opts.max_output_queues.min(limit);
        if inputs > max_in
            || outputs > max_out
            || inputs as usize + outputs as usize == 0
        {
            return Err(EstablishError::QueueCount { inputs, outputs });
        }

        let qib_span =
            Span { addr: GuestAddr(hdr.qiba.get()), key: hdr.qib_key() };
        let qib: Qib = mem.read(qib_span.addr, qib_span.key)?;
        let requested = qib.flags();

        let mut descs = Vec::with_capacity(inputs as usize + outputs as usize);
        let base = qdr + std::mem::size_of::<QdrHeader>();
        for idx in 0..(inputs as usize + outputs as usize) {
            let raw: Qdes0 = mem.read(base.offset::<Qdes0>(idx), key)?;
            let desc = QueueDesc::from_raw(&raw);
            desc.validate(mem)?;
            descs.push(desc);
        }
        let outputs = descs.split_off(inputs as usize);
        let inputs = descs;

        let qebsm = requested.contains(QibFlags::QEBSM) && self.opts.qebsm;
        if qebsm {
            // The granted capability is reported back in the QIB
            qib_span.probe(mem, QIB_AC_OFFSET + 1, Access::Store)?;
        }

        let thin = if requested.contains(QibFlags::THIN_INTR)
            && self.opts.thin_interrupts
        {
            let ind = Indicators::from_parm(&qib.thin_parm());
            match ind.validate(mem) {
                Ok(()) => Some(ind),
                Err(e) => {
                    warn!(self.log, "thin indicators unusable";
                        "error" => %e);
                    None
                }
            }
        } else {
            None
        };

        let token = qebsm.then(|| mint_token(self.schid, generation));

        Ok(Geometry { inputs, outputs, qib: qib_span, qebsm, thin, token })
    }

    /// Put established queues into service.
    ///
    /// All input queues are enabled for scanning; output queues are enabled
    /// by write doorbells.
    pub fn activate(&self) -> Result<(), ActivateError> {
        let mut state = self.lock_state();
        match state.phase {
            Phase::Idle => return Err(ActivateError::NotEstablished),
            Phase::Active => return Err(ActivateError::AlreadyActive),
            Phase::Established => {}
        }
        let (inputs, outputs) = match state.geometry.as_ref() {
            Some(g) => (g.inputs.len(), g.outputs.len()),
            None => return Err(ActivateError::NotEstablished),
        };
        state.input.reset(inputs);
        state.output.reset(outputs);
        state.input.enable(u32::MAX);
        state.phase = Phase::Active;
        drop(state);

        info!(self.log, "queues active");
        self.wake_worker();
        Ok(())
    }
}

/// Subchannel token: unique per subchannel and establish generation.
fn mint_token(schid: u32, generation: u32) -> u64 {
    ((schid as u64) << 32) | generation as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::qdio::testutil::*;
    use crate::hw::qdio::DeviceOpts;
    use crate::vmm::StorageKey;

    #[test]
    fn geometry_captured() {
        let tg = TestGuest::new(2, 1);
        let dev = tg.device(Default::default());
        tg.establish(&dev).unwrap();

        let geom = dev.geometry().unwrap();
        assert_eq!(geom.inputs.len(), 2);
        assert_eq!(geom.outputs.len(), 1);
        assert_eq!(geom.inputs[1].sl.addr, tg.queue(Direction::Input, 1).sl);
        let out = tg.queue(Direction::Output, 0);
        assert_eq!(geom.outputs[0].slsb.addr, out.slsb);
        assert_eq!(geom.outputs[0].buf_key, TEST_KEY);
        assert!(geom.qebsm);
        assert!(geom.thin.is_some());
        assert_eq!(dev.phase(), Phase::Established);

        assert_eq!(
            dev.take_interrupt().map(|i| i.reason),
            Some(IntrReason::EstablishComplete)
        );
    }

    #[test]
    fn qebsm_reported_in_qib() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(Default::default());
        tg.establish(&dev).unwrap();
        assert_eq!(tg.qib().ac & QibAc::QEBSM_GRANTED.bits(), 0x80);
        let token = dev.token().unwrap();
        assert_eq!(token >> 32, TEST_SCHID as u64);

        // A fresh establish mints a fresh token
        tg.establish(&dev).unwrap();
        assert_ne!(dev.token().unwrap(), token);
    }

    #[test]
    fn capabilities_follow_opts() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(DeviceOpts {
            qebsm: false,
            thin_interrupts: false,
            ..Default::default()
        });
        tg.establish(&dev).unwrap();
        let geom = dev.geometry().unwrap();
        assert!(!geom.qebsm);
        assert!(geom.thin.is_none());
        assert_eq!(geom.token, None);
        assert_eq!(tg.qib().ac, 0);
    }

    #[test]
    fn bad_thin_indicators_fall_back() {
        let tg = TestGuest::new(1, 1);
        tg.set_indicators(GuestAddr(u64::MAX - 1), GuestAddr(0x2801));
        let dev = tg.device(Default::default());
        tg.establish(&dev).unwrap();
        assert!(dev.geometry().unwrap().thin.is_none());
    }

    #[test]
    fn failure_commits_nothing() {
        let tg = TestGuest::new(1, 2);
        let dev = tg.device(Default::default());

        // Storage list of the last output queue behind a foreign key
        let q = tg.queue(Direction::Output, 1);
        tg.mem
            .set_storage_key(
                q.sl,
                StorageKey::protected(AccessKey::new(9), true),
            )
            .unwrap();

        assert!(matches!(
            tg.establish(&dev),
            Err(EstablishError::Access(AccessError::Protection { .. }))
        ));
        assert_eq!(dev.phase(), Phase::Idle);
        assert!(dev.geometry().is_none());
        assert_eq!(tg.qib().ac, 0);
        assert!(!dev.interrupt_pending());
    }

    #[test]
    fn format_and_counts_checked() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(Default::default());

        tg.patch_qdr(|hdr| hdr.qfmt = 1);
        assert!(matches!(
            tg.establish(&dev),
            Err(EstablishError::UnsupportedFormat(1))
        ));

        tg.patch_qdr(|hdr| {
            hdr.qfmt = 0;
            hdr.oqdsz = 4;
        });
        assert!(matches!(
            tg.establish(&dev),
            Err(EstablishError::DescriptorSize(4))
        ));

        tg.patch_qdr(|hdr| {
            hdr.oqdsz = QDES_SIZE_WORDS;
            hdr.iqdcnt = 0;
            hdr.oqdcnt = 0;
        });
        assert!(matches!(
            tg.establish(&dev),
            Err(EstablishError::QueueCount { inputs: 0, outputs: 0 })
        ));

        tg.patch_qdr(|hdr| hdr.iqdcnt = 33);
        assert!(matches!(
            tg.establish(&dev),
            Err(EstablishError::QueueCount { inputs: 33, .. })
        ));
    }

    #[test]
    fn activate_transitions() {
        let tg = TestGuest::new(1, 1);
        let dev = tg.device(Default::default());
        assert_eq!(dev.activate(), Err(ActivateError::NotEstablished));

        tg.establish(&dev).unwrap();
        dev.activate().unwrap();
        assert_eq!(dev.phase(), Phase::Active);
        assert_eq!(dev.activate(), Err(ActivateError::AlreadyActive));
        assert!(matches!(tg.establish(&dev), Err(EstablishError::Busy)));
    }
}
