// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test utilities for laying out guest queue structures in a [`GuestMem`].
//!
//! [`TestGuest`] plays the part of a guest driver: it writes the queue
//! descriptor record, information block, and per-queue storage lists into
//! guest storage, and offers helpers to prime buffers and inspect what the
//! device under test did with them.
//!
//! Layout (all pages keyed with [`TEST_KEY`]):
//!
//! | Address               | Contents                                 |
//! |-----------------------|------------------------------------------|
//! | `0x1000`              | queue descriptor record                  |
//! | `0x2000`              | queue information block                  |
//! | `0x2800` / `0x2801`   | summary / device-state indicators        |
//! | `0x10000 * (n + 1)`   | queue `n` (inputs first): SLIB, SL, SLSB |
//! | `+ 0x1000`            | queue `n`: 128 buffers of 256 bytes      |
//! | `0x400000..`          | fragment pool                            |

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slog::{o, Drain, Logger};
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromZeros, IntoBytes};

use super::bits::*;
use super::state::Direction;
use super::{DeviceOpts, EstablishError, QdioDevice};
use crate::common::{GuestAddr, PAGE_SIZE};
use crate::port::{PayloadPort, PortError};
use crate::vmm::{AccessKey, GuestMem, StorageKey};

pub(crate) const TEST_KEY: AccessKey = AccessKey::new(3);
pub(crate) const TEST_SCHID: u32 = 0x0001_0010;

pub(crate) const MEM_SIZE: usize = 8 * 1024 * 1024;
pub(crate) const QDR_ADDR: GuestAddr = GuestAddr(0x1000);
pub(crate) const QIB_ADDR: GuestAddr = GuestAddr(0x2000);
pub(crate) const ALSI_ADDR: GuestAddr = GuestAddr(0x2800);
pub(crate) const DSCI_ADDR: GuestAddr = GuestAddr(0x2801);
const QUEUE_BASE: u64 = 0x10000;
const QUEUE_STRIDE: u64 = 0x10000;
const POOL_BASE: u64 = 0x40_0000;

pub(crate) fn test_logger() -> Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    Logger::root(drain, o!("component" => "qdio-test"))
}

/// Addresses of one queue's structures
#[derive(Clone, Copy, Debug)]
pub(crate) struct TestQueue {
    pub slib: GuestAddr,
    pub sl: GuestAddr,
    pub slsb: GuestAddr,
    pub sbals: GuestAddr,
}

impl TestQueue {
    pub fn sbal(&self, bnum: u8) -> GuestAddr {
        self.sbals.offset::<Sbal>(bnum as usize)
    }
}

/// Port recording output frames and serving queued input frames.
#[derive(Default)]
pub(crate) struct RecordingPort {
    sent: Mutex<Vec<(u8, Vec<u8>)>>,
    inbound: Mutex<BTreeMap<u8, VecDeque<Vec<u8>>>>,
    failing: AtomicBool,
}

impl RecordingPort {
    pub fn sent(&self) -> Vec<(u8, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
    pub fn inject(&self, queue: u8, frame: &[u8]) {
        self.inbound
            .lock()
            .unwrap()
            .entry(queue)
            .or_default()
            .push_back(frame.to_vec());
    }
    pub fn pending(&self, queue: u8) -> usize {
        self.inbound.lock().unwrap().get(&queue).map(|q| q.len()).unwrap_or(0)
    }
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl PayloadPort for RecordingPort {
    fn transmit(&self, queue: u8, frame: &[u8]) -> Result<(), PortError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PortError::Closed);
        }
        self.sent.lock().unwrap().push((queue, frame.to_vec()));
        Ok(())
    }
    fn has_pending(&self, queue: u8) -> bool {
        self.pending(queue) != 0
    }
    fn receive(&self, queue: u8) -> Result<Option<Vec<u8>>, PortError> {
        Ok(self
            .inbound
            .lock()
            .unwrap()
            .get_mut(&queue)
            .and_then(|q| q.pop_front()))
    }
}

pub(crate) struct TestGuest {
    pub mem: Arc<GuestMem>,
    pub port: Arc<RecordingPort>,
    pub log: Logger,
    inputs: u8,
    outputs: u8,
    pool_next: Mutex<u64>,
}

impl TestGuest {
    pub fn new(inputs: u8, outputs: u8) -> Self {
        let mem = Arc::new(GuestMem::new(MEM_SIZE));
        for page in 1..(MEM_SIZE / PAGE_SIZE) {
            mem.set_storage_key(
                GuestAddr((page * PAGE_SIZE) as u64),
                StorageKey::protected(TEST_KEY, false),
            )
            .unwrap();
        }

        let tg = Self {
            mem,
            port: Arc::new(RecordingPort::default()),
            log: slog::Logger::root(slog::Discard, o!()),
            inputs,
            outputs,
            pool_next: Mutex::new(POOL_BASE),
        };

        let mut hdr = QdrHeader::new_zeroed();
        hdr.qfmt = QDR_FORMAT_0;
        hdr.iqdcnt = inputs;
        hdr.oqdcnt = outputs;
        hdr.iqdsz = QDES_SIZE_WORDS;
        hdr.oqdsz = QDES_SIZE_WORDS;
        hdr.qiba = U64::new(QIB_ADDR.0);
        hdr.qkey = TEST_KEY.get() << 4;
        tg.put(QDR_ADDR, &hdr);

        let keys = (TEST_KEY.get() << 4) | TEST_KEY.get();
        let descs = QDR_ADDR + std::mem::size_of::<QdrHeader>();
        for idx in 0..(inputs as usize + outputs as usize) {
            let q = Self::layout(idx);
            let mut qdes = Qdes0::new_zeroed();
            qdes.sliba = U64::new(q.slib.0);
            qdes.sla = U64::new(q.sl.0);
            qdes.slsba = U64::new(q.slsb.0);
            qdes.keys_ab = keys;
            qdes.keys_cd = keys;
            tg.put(descs.offset::<Qdes0>(idx), &qdes);

            for bnum in 0..QDIO_MAX_BUFFERS_PER_Q {
                let sbal = q.sbal(bnum as u8);
                tg.put(q.sl.offset::<U64>(bnum), &U64::new(sbal.0));
            }
        }

        let mut qib = Qib::new_zeroed();
        qib.rflags = (QibFlags::QEBSM | QibFlags::THIN_INTR).bits();
        tg.put(QIB_ADDR, &qib);
        tg.set_indicators(ALSI_ADDR, DSCI_ADDR);

        tg
    }

    fn layout(idx: usize) -> TestQueue {
        let base = GuestAddr(QUEUE_BASE + QUEUE_STRIDE * idx as u64);
        TestQueue {
            slib: base,
            sl: base + 0x800,
            slsb: base + 0xc00,
            sbals: base + 0x1000,
        }
    }

    pub fn put<T: IntoBytes + zerocopy::Immutable>(
        &self,
        addr: GuestAddr,
        val: &T,
    ) {
        self.mem.write(addr, AccessKey::ZERO, val).unwrap();
    }

    pub fn device(&self, opts: DeviceOpts) -> Arc<QdioDevice> {
        QdioDevice::create(
            TEST_SCHID,
            opts,
            self.mem.clone(),
            self.port.clone(),
            &self.log,
        )
    }

    pub fn establish(&self, dev: &QdioDevice) -> Result<(), EstablishError> {
        dev.establish(QDR_ADDR, TEST_KEY)
    }

    /// Establish and activate a device with default options.
    pub fn active_device(&self) -> Arc<QdioDevice> {
        let dev = self.device(Default::default());
        self.establish(&dev).unwrap();
        dev.activate().unwrap();
        dev
    }

    pub fn queue(&self, dir: Direction, qnum: u8) -> TestQueue {
        match dir {
            Direction::Input => {
                assert!(qnum < self.inputs);
                Self::layout(qnum as usize)
            }
            Direction::Output => {
                assert!(qnum < self.outputs);
                Self::layout(self.inputs as usize + qnum as usize)
            }
        }
    }

    pub fn patch_qdr(&self, f: impl FnOnce(&mut QdrHeader)) {
        let mut hdr: QdrHeader =
            self.mem.read(QDR_ADDR, AccessKey::ZERO).unwrap();
        f(&mut hdr);
        self.put(QDR_ADDR, &hdr);
    }

    pub fn qib(&self) -> Qib {
        self.mem.read(QIB_ADDR, AccessKey::ZERO).unwrap()
    }

    pub fn set_indicators(&self, alsi: GuestAddr, dsci: GuestAddr) {
        let mut qib = self.qib();
        qib.parm[..8].copy_from_slice(&alsi.0.to_be_bytes());
        qib.parm[8..16].copy_from_slice(&dsci.0.to_be_bytes());
        qib.parm[16] = (TEST_KEY.get() << 4) | TEST_KEY.get();
        qib.parm[17] = 3;
        self.put(QIB_ADDR, &qib);
    }

    /// Current (summary, device-state) indicator bytes
    pub fn indicators(&self) -> (u8, u8) {
        (
            self.mem.read(ALSI_ADDR, AccessKey::ZERO).unwrap(),
            self.mem.read(DSCI_ADDR, AccessKey::ZERO).unwrap(),
        )
    }

    pub fn clear_indicators(&self) {
        self.put(ALSI_ADDR, &0u8);
        self.put(DSCI_ADDR, &0u8);
    }

    pub fn states(&self, q: &TestQueue) -> [u8; QDIO_MAX_BUFFERS_PER_Q] {
        self.mem.read(q.slsb, AccessKey::ZERO).unwrap()
    }

    pub fn set_states(&self, q: &TestQueue, start: u8, states: &[u8]) {
        for (i, val) in states.iter().enumerate() {
            let bnum = (start as usize + i) % QDIO_MAX_BUFFERS_PER_Q;
            self.put(q.slsb + bnum, val);
        }
    }

    /// Carve `len` bytes out of the fragment pool.
    pub fn alloc(&self, len: usize) -> GuestAddr {
        let mut next = self.pool_next.lock().unwrap();
        let addr = GuestAddr(*next);
        *next += ((len as u64) + 0xff) & !0xff;
        assert!(*next <= MEM_SIZE as u64);
        addr
    }

    pub fn sbal(&self, q: &TestQueue, bnum: u8) -> Sbal {
        self.mem.read(q.sbal(bnum), AccessKey::ZERO).unwrap()
    }

    /// Write a buffer whose fragments carry `frags`, without touching its
    /// state byte.
    pub fn fill_sbal(
        &self,
        q: &TestQueue,
        bnum: u8,
        frags: &[&[u8]],
        pci: bool,
    ) {
        let mut sbal = Sbal::new_zeroed();
        for (i, frag) in frags.iter().enumerate() {
            let addr = self.alloc(frag.len());
            self.mem.write_bytes(addr, AccessKey::ZERO, frag).unwrap();
            let ent = &mut sbal.entries[i];
            ent.addr = U64::new(addr.0);
            ent.length = U32::new(frag.len() as u32);
            if i + 1 == frags.len() {
                ent.eflags = SbalEflags::LAST_ENTRY.bits();
                if pci {
                    ent.sflags = SbalSflags::PCI_REQ.bits();
                }
            }
        }
        self.put(q.sbal(bnum), &sbal);
    }

    /// Fill output buffer `bnum` and hand it to the adapter.
    pub fn prime_output(&self, q: &TestQueue, bnum: u8, frags: &[&[u8]]) {
        self.fill_sbal(q, bnum, frags, false);
        self.set_states(q, bnum, &[0x62]);
    }

    /// Give input buffer `bnum` fragments of the listed sizes and hand it to
    /// the adapter.
    pub fn prime_input(&self, q: &TestQueue, bnum: u8, sizes: &[usize]) {
        let frags: Vec<Vec<u8>> =
            sizes.iter().map(|sz| vec![0u8; *sz]).collect();
        let refs: Vec<&[u8]> = frags.iter().map(|f| f.as_slice()).collect();
        self.fill_sbal(q, bnum, &refs, false);
        self.set_states(q, bnum, &[0x41]);
    }

    /// Gather the data the adapter placed in input buffer `bnum`.
    pub fn read_input(&self, q: &TestQueue, bnum: u8) -> Vec<u8> {
        let sbal = self.sbal(q, bnum);
        let mut data = Vec::new();
        for ent in sbal.used() {
            let mut frag = vec![0u8; ent.length.get() as usize];
            let addr = GuestAddr(ent.addr.get());
            self.mem.read_bytes(addr, AccessKey::ZERO, &mut frag).unwrap();
            data.extend_from_slice(&frag);
        }
        data
    }
}
