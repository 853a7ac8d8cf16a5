// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffer-state bytes.
//!
//! Each queue slot has one state byte in the guest-resident buffer-state
//! array, naming the owner of the slot, the queue direction, and a state
//! code.  Bit 4 is defined as a "valid" indicator but is ignored when decoding
//! and left clear when encoding.

use bitstruct::bitstruct;

bitstruct! {
    /// Raw layout of a buffer-state byte
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SlsbByte(pub u8) {
        pub code: StateCode = 0..4;
        pub valid: bool = 4;
        pub output: bool = 5;
        pub owner: Owner = 6..8;
    }
}

/// Party permitted to touch the buffer described by a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Guest,
    Adapter,
    Reserved(u8),
}

impl bitstruct::FromRaw<u8, Owner> for SlsbByte {
    fn from_raw(raw: u8) -> Owner {
        match raw {
            0b10 => Owner::Guest,
            0b01 => Owner::Adapter,
            0b00 | 0b11 => Owner::Reserved(raw),
            _ => unreachable!(),
        }
    }
}

impl bitstruct::IntoRaw<u8, Owner> for SlsbByte {
    fn into_raw(target: Owner) -> u8 {
        match target {
            Owner::Guest => 0b10,
            Owner::Adapter => 0b01,
            Owner::Reserved(raw) => raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateCode {
    Uninitialized,
    Empty,
    Primed,
    Pending,
    Halted,
    Error,
    Reserved(u8),
}

impl bitstruct::FromRaw<u8, StateCode> for SlsbByte {
    fn from_raw(raw: u8) -> StateCode {
        match raw {
            0x0 => StateCode::Uninitialized,
            0x1 => StateCode::Empty,
            0x2 => StateCode::Primed,
            0x3 => StateCode::Pending,
            0xe => StateCode::Halted,
            0xf => StateCode::Error,
            0x4..=0xd => StateCode::Reserved(raw),
            _ => unreachable!(),
        }
    }
}

impl bitstruct::IntoRaw<u8, StateCode> for SlsbByte {
    fn into_raw(target: StateCode) -> u8 {
        match target {
            StateCode::Uninitialized => 0x0,
            StateCode::Empty => 0x1,
            StateCode::Primed => 0x2,
            StateCode::Pending => 0x3,
            StateCode::Halted => 0xe,
            StateCode::Error => 0xf,
            StateCode::Reserved(raw) => raw,
        }
    }
}

/// Direction of a queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Output)
    }
}

/// Decoded buffer-state byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferState {
    pub owner: Owner,
    pub dir: Direction,
    pub state: StateCode,
}

impl BufferState {
    /// Input buffer handed to the adapter for filling (0x41)
    pub const INPUT_EMPTY: Self =
        Self::new(Owner::Adapter, Direction::Input, StateCode::Empty);
    /// Filled input buffer handed back to the guest (0x82)
    pub const INPUT_PRIMED: Self =
        Self::new(Owner::Guest, Direction::Input, StateCode::Primed);
    /// Input buffer acknowledged by the guest (0x81)
    pub const INPUT_ACK: Self =
        Self::new(Owner::Guest, Direction::Input, StateCode::Empty);
    pub const INPUT_HALTED: Self =
        Self::new(Owner::Guest, Direction::Input, StateCode::Halted);
    pub const INPUT_ERROR: Self =
        Self::new(Owner::Guest, Direction::Input, StateCode::Error);

    /// Output buffer handed to the adapter for draining (0x62)
    pub const OUTPUT_PRIMED: Self =
        Self::new(Owner::Adapter, Direction::Output, StateCode::Primed);
    /// Drained output buffer handed back to the guest (0xa1)
    pub const OUTPUT_EMPTY: Self =
        Self::new(Owner::Guest, Direction::Output, StateCode::Empty);
    pub const OUTPUT_HALTED: Self =
        Self::new(Owner::Guest, Direction::Output, StateCode::Halted);
    pub const OUTPUT_ERROR: Self =
        Self::new(Owner::Guest, Direction::Output, StateCode::Error);

    pub const fn new(owner: Owner, dir: Direction, state: StateCode) -> Self {
        Self { owner, dir, state }
    }

    pub fn from_byte(raw: u8) -> Self {
        let bits = SlsbByte(raw);
        Self {
            owner: bits.owner(),
            dir: match bits.output() {
                true => Direction::Output,
                false => Direction::Input,
            },
            state: bits.code(),
        }
    }

    pub fn to_byte(self) -> u8 {
        SlsbByte(0)
            .with_owner(self.owner)
            .with_output(self.dir.is_output())
            .with_code(self.state)
            .0
    }

    /// Is the slot owned by the adapter and waiting to be serviced in the
    /// given direction?
    pub fn adapter_ready(self, dir: Direction) -> bool {
        let want = match dir {
            Direction::Output => Self::OUTPUT_PRIMED,
            Direction::Input => Self::INPUT_EMPTY,
        };
        self == want
    }

    /// Terminal state for a slot whose servicing failed
    pub fn error(dir: Direction) -> Self {
        match dir {
            Direction::Output => Self::OUTPUT_ERROR,
            Direction::Input => Self::INPUT_ERROR,
        }
    }

    /// State handed back to the guest when a slot was serviced
    pub fn completed(dir: Direction) -> Self {
        match dir {
            Direction::Output => Self::OUTPUT_EMPTY,
            Direction::Input => Self::INPUT_PRIMED,
        }
    }
}

impl From<u8> for BufferState {
    fn from(raw: u8) -> Self {
        Self::from_byte(raw)
    }
}
impl From<BufferState> for u8 {
    fn from(value: BufferState) -> Self {
        value.to_byte()
    }
}
