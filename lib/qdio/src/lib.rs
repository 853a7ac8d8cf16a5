// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod common;
pub mod css;
pub mod hw;
pub mod lifecycle;
pub mod port;
pub mod tasks;
pub mod vmm;

pub use css::ChannelSubsystem;
pub use hw::qdio::QdioDevice;
