// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing of guest-issued queue instructions to attached adapters.
//!
//! Doorbells name their target by subchannel number, or by the token minted at
//! establish when the use-token flag is present in the function code.  The
//! buffer-state instructions always name their target by token, and pack the
//! queue index and starting slot into a single operand.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::{info, o, Logger};
use thiserror::Error;

use crate::hw::qdio::{BsResult, CondCode, DeviceOpts, Exception, QdioDevice};
use crate::port::PayloadPort;
use crate::vmm::GuestMem;

/// Function code flag: the target operand is a subchannel token.
pub const SIGA_USE_TOKEN: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CssError {
    #[error("subchannel {0:#x} already has a device attached")]
    Occupied(u32),

    #[error("no device attached at subchannel {0:#x}")]
    NotAttached(u32),
}

pub struct ChannelSubsystem {
    devs: Mutex<BTreeMap<u32, Arc<QdioDevice>>>,
    log: Logger,
}

impl ChannelSubsystem {
    pub fn new(log: &Logger) -> Self {
        Self {
            devs: Mutex::new(BTreeMap::new()),
            log: log.new(o!("component" => "css")),
        }
    }

    pub fn attach(&self, dev: Arc<QdioDevice>) -> Result<(), CssError> {
        let schid = dev.subchannel();
        let mut devs = self.devs.lock().unwrap();
        if devs.contains_key(&schid) {
            return Err(CssError::Occupied(schid));
        }
        devs.insert(schid, dev);
        info!(self.log, "device attached"; "schid" => schid);
        Ok(())
    }

    pub fn detach(&self, schid: u32) -> Result<Arc<QdioDevice>, CssError> {
        let dev = self
            .devs
            .lock()
            .unwrap()
            .remove(&schid)
            .ok_or(CssError::NotAttached(schid))?;
        info!(self.log, "device detached"; "schid" => schid);
        Ok(dev)
    }

    pub fn device(&self, schid: u32) -> Option<Arc<QdioDevice>> {
        self.devs.lock().unwrap().get(&schid).cloned()
    }

    /// Find the device whose current establish minted `token`.
    pub fn by_token(&self, token: u64) -> Option<Arc<QdioDevice>> {
        let devs = self.devs.lock().unwrap();
        let dev = devs.get(&((token >> 32) as u32))?;
        (dev.token() == Some(token)).then(|| dev.clone())
    }

    /// Create and attach a device for every adapter in `cfg`, each with a
    /// port supplied by `make_port`.
    pub fn attach_config<F>(
        &self,
        cfg: &qdio_config::Config,
        mem: &Arc<GuestMem>,
        mut make_port: F,
    ) -> Result<Vec<Arc<QdioDevice>>, CssError>
    where
        F: FnMut(&str, &qdio_config::Adapter) -> Arc<dyn PayloadPort>,
    {
        let mut attached = Vec::with_capacity(cfg.adapters.len());
        for (name, adapter) in cfg.adapters.iter() {
            let log = self.log.new(o!("adapter" => name.clone()));
            let dev = QdioDevice::create(
                adapter.subchannel,
                DeviceOpts::from(adapter),
                mem.clone(),
                make_port(name, adapter),
                &log,
            );
            self.attach(dev.clone())?;
            attached.push(dev);
        }
        Ok(attached)
    }

    /// Signal-adapter instruction.
    ///
    /// Unknown targets are not operational (cc3).
    pub fn siga(
        &self,
        fc: u8,
        target: u64,
        out_mask: u32,
        in_mask: u32,
    ) -> Result<CondCode, Exception> {
        let dev = if fc & SIGA_USE_TOKEN != 0 {
            self.by_token(target)
        } else {
            u32::try_from(target).ok().and_then(|schid| self.device(schid))
        };
        match dev {
            Some(dev) => dev.siga(fc & !SIGA_USE_TOKEN, out_mask, in_mask),
            None => Ok(CondCode::Cc3),
        }
    }

    /// Set Queue Buffer State, with `qb` carrying the queue index in its
    /// upper half and the starting slot in its lower half.
    pub fn sqbs(
        &self,
        token: u64,
        qb: u32,
        count: u32,
        state: u8,
    ) -> Result<BsResult, Exception> {
        let (qidx, bidx) = split_qb(qb);
        match self.by_token(token) {
            Some(dev) => dev.sqbs(qidx, bidx, count, state),
            None => Ok(invalid_token(bidx, count)),
        }
    }

    /// Extract Queue Buffer State; `qb` as for [Self::sqbs].
    pub fn eqbs(
        &self,
        token: u64,
        qb: u32,
        count: u32,
        auto_ack: bool,
    ) -> Result<BsResult, Exception> {
        let (qidx, bidx) = split_qb(qb);
        match self.by_token(token) {
            Some(dev) => dev.eqbs(qidx, bidx, count, auto_ack),
            None => Ok(invalid_token(bidx, count)),
        }
    }

    pub fn devices(&self) -> Vec<Arc<QdioDevice>> {
        self.devs.lock().unwrap().values().cloned().collect()
    }
}

fn split_qb(qb: u32) -> (u16, u16) {
    ((qb >> 16) as u16, qb as u16)
}

fn invalid_token(bidx: u16, count: u32) -> BsResult {
    BsResult { cc: CondCode::Cc2, next: bidx, remaining: count, state: 0 }
}
