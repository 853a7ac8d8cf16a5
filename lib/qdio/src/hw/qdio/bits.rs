// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-resident queue structures.
//!
//! All multi-byte fields are big-endian.  Reserved fields are private; build
//! instances with [FromZeros::new_zeroed] and fill in the public fields.
//!
//! [FromZeros::new_zeroed]: zerocopy::FromZeros::new_zeroed

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::vmm::AccessKey;

/// Buffer slots in every queue
pub const QDIO_MAX_BUFFERS_PER_Q: usize = 128;

/// Queues per direction, bounded by the 32-bit doorbell masks
pub const QDIO_MAX_QUEUES_PER_DIR: usize = 32;

/// Scatter/gather entries in one storage-block-address list
pub const QDIO_MAX_ELEMENTS_PER_BUFFER: usize = 16;

/// Largest payload gathered from one output buffer: every element filling a
/// 4 KiB page
pub const QDIO_MAX_FRAME_LEN: usize = QDIO_MAX_ELEMENTS_PER_BUFFER * 4096;

/// The only supported queue-descriptor-record format
pub const QDR_FORMAT_0: u8 = 0;

/// Size of a format-0 queue descriptor, in 4-byte words
pub const QDES_SIZE_WORDS: u8 = 8;

/// Storage-list-information block: header plus one entry per buffer, padded
/// out to its alignment.
pub const SLIB_LEN: usize = 2048;
/// Storage list: one 8-byte buffer address per slot.
pub const SL_LEN: usize = QDIO_MAX_BUFFERS_PER_Q * size_of::<u64>();
/// Buffer-state array: one byte per slot.
pub const SLSB_LEN: usize = QDIO_MAX_BUFFERS_PER_Q;

/// Offset of the adapter-characteristics byte in the [Qib]
pub const QIB_AC_OFFSET: usize = 3;

/// Status bit OR'd into the thin-interrupt indicator bytes
pub const INDICATOR_STATUS: u8 = 0x01;

/// Queue descriptor record header.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct QdrHeader {
    pub qfmt: u8,
    pub pfmt: u8,
    res1: u8,
    pub ac: u8,
    res2: u8,
    /// Input queue count
    pub iqdcnt: u8,
    res3: u8,
    /// Output queue count
    pub oqdcnt: u8,
    res4: u8,
    /// Input descriptor size (words)
    pub iqdsz: u8,
    res5: u8,
    /// Output descriptor size (words)
    pub oqdsz: u8,
    res6: [u8; 36],
    /// Queue information block address
    pub qiba: U64,
    res7: [u8; 4],
    /// Queue information block key (high nibble)
    pub qkey: u8,
    res8: [u8; 3],
}
const _: () = assert!(size_of::<QdrHeader>() == 64);

impl QdrHeader {
    pub fn qib_key(&self) -> AccessKey {
        AccessKey::from_high_nibble(self.qkey)
    }
}

/// Format-0 queue descriptor, one per queue following the [QdrHeader]: all
/// input queues first, then all output queues.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct Qdes0 {
    /// Storage-list-information block address
    pub sliba: U64,
    /// Storage list address
    pub sla: U64,
    /// Buffer-state array address
    pub slsba: U64,
    res1: [u8; 4],
    /// High nibble: information block key, low nibble: storage list key
    pub keys_ab: u8,
    /// High nibble: buffer key, low nibble: buffer-state array key
    pub keys_cd: u8,
    res2: [u8; 2],
}
const _: () = assert!(size_of::<Qdes0>() == 32);

impl Qdes0 {
    pub fn slib_key(&self) -> AccessKey {
        AccessKey::from_high_nibble(self.keys_ab)
    }
    pub fn sl_key(&self) -> AccessKey {
        AccessKey::new(self.keys_ab)
    }
    pub fn buf_key(&self) -> AccessKey {
        AccessKey::from_high_nibble(self.keys_cd)
    }
    pub fn slsb_key(&self) -> AccessKey {
        AccessKey::new(self.keys_cd)
    }
}

bitflags! {
    /// Capabilities requested by the guest in [Qib::rflags]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QibFlags: u8 {
        /// Lightweight buffer-state instructions
        const QEBSM = 0x80;
        /// Thin-interrupt indicators
        const THIN_INTR = 0x40;
    }
}

bitflags! {
    /// Adapter characteristics reported back in [Qib::ac]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QibAc: u8 {
        const QEBSM_GRANTED = 0x80;
    }
}

/// Queue information block.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct Qib {
    pub qfmt: u8,
    pub pfmt: u8,
    /// Requested capabilities, see [QibFlags]
    pub rflags: u8,
    /// Adapter characteristics, see [QibAc]
    pub ac: u8,
    res1: [u8; 4],
    /// Input storage-list-information block address
    pub isliba: U64,
    /// Output storage-list-information block address
    pub osliba: U64,
    res2: [u8; 8],
    /// Adapter name, EBCDIC
    pub ebcnam: [u8; 8],
    res3: [u8; 88],
    /// Model-dependent parameter area
    pub parm: [u8; 128],
}
const _: () = assert!(size_of::<Qib>() == 256);

impl Qib {
    pub fn flags(&self) -> QibFlags {
        QibFlags::from_bits_truncate(self.rflags)
    }

    /// Thin-interrupt parameters at the head of the parameter area
    pub fn thin_parm(&self) -> ThinIntParm {
        let (parm, _rest) = ThinIntParm::read_from_prefix(&self.parm[..])
            .expect("parameter area holds thin-interrupt block");
        parm
    }
}

/// Thin-interrupt parameter block
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct ThinIntParm {
    /// Adapter-local-summary indicator address
    pub alsi: U64,
    /// Device-state-change indicator address
    pub dsci: U64,
    /// High nibble: summary key, low nibble: device-state key
    pub keys: u8,
    /// Interruption subclass
    pub isc: u8,
}
const _: () = assert!(size_of::<ThinIntParm>() == 18);

impl ThinIntParm {
    pub fn alsi_key(&self) -> AccessKey {
        AccessKey::from_high_nibble(self.keys)
    }
    pub fn dsci_key(&self) -> AccessKey {
        AccessKey::new(self.keys)
    }
}

bitflags! {
    /// Storage-block-address-list element flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SbalEflags: u8 {
        const LAST_ENTRY = 0x40;
    }
}

bitflags! {
    /// Storage-block-address-list storage flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SbalSflags: u8 {
        /// Guest requests a completion notification for this buffer
        const PCI_REQ = 0x40;
    }
}

/// One scatter/gather fragment of a buffer
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct Sbale {
    pub eflags: u8,
    res1: u8,
    pub sflags: u8,
    res2: u8,
    pub length: U32,
    pub addr: U64,
}
const _: () = assert!(size_of::<Sbale>() == 16);

impl Sbale {
    pub fn is_last(&self) -> bool {
        SbalEflags::from_bits_truncate(self.eflags)
            .contains(SbalEflags::LAST_ENTRY)
    }
    pub fn wants_pci(&self) -> bool {
        SbalSflags::from_bits_truncate(self.sflags)
            .contains(SbalSflags::PCI_REQ)
    }
}

/// Storage-block-address list: one queue buffer
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct Sbal {
    pub entries: [Sbale; QDIO_MAX_ELEMENTS_PER_BUFFER],
}
const _: () = assert!(size_of::<Sbal>() == 256);

impl Sbal {
    /// Entries making up the buffer: up to and including the first one
    /// flagged as last, or all of them if none is.
    pub fn used(&self) -> &[Sbale] {
        let end = self
            .entries
            .iter()
            .position(Sbale::is_last)
            .map(|idx| idx + 1)
            .unwrap_or(QDIO_MAX_ELEMENTS_PER_BUFFER);
        &self.entries[..end]
    }
}
