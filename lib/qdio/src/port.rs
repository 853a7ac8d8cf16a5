// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload ports: where output frames go and input frames come from.
//!
//! The queue engine never interprets payload bytes.  A drained output buffer
//! is handed to the port as one gathered frame, and an input buffer is filled
//! with one frame taken from the port.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::tasks::NotifyFn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port has no room for frame")]
    Full,

    #[error("port is closed")]
    Closed,
}

/// Collaborator carrying payload frames to and from a [QdioDevice].
///
/// Methods are called from the device worker while it holds the device
/// lock; they must not issue instructions against the device.
///
/// [QdioDevice]: crate::hw::qdio::QdioDevice
pub trait PayloadPort: Send + Sync + 'static {
    /// Accept a frame drained from output queue `queue`.
    fn transmit(&self, queue: u8, frame: &[u8]) -> Result<(), PortError>;

    /// Is there a frame waiting for input queue `queue`?
    fn has_pending(&self, _queue: u8) -> bool {
        false
    }

    /// Take the next frame for input queue `queue`.
    fn receive(&self, _queue: u8) -> Result<Option<Vec<u8>>, PortError> {
        Ok(None)
    }
}

/// Drops all output, never produces input.
#[derive(Default)]
pub struct DiscardPort;

impl PayloadPort for DiscardPort {
    fn transmit(&self, _queue: u8, _frame: &[u8]) -> Result<(), PortError> {
        Ok(())
    }
}

/// Delivers every transmitted frame to input queue 0.
pub struct LoopbackPort {
    frames: Mutex<VecDeque<Vec<u8>>>,
    depth: usize,
    notify_fn: Mutex<Option<Arc<NotifyFn>>>,
}

impl LoopbackPort {
    pub fn new(depth: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            notify_fn: Mutex::new(None),
        })
    }

    /// Set the function called when a frame becomes available, typically
    /// [QdioDevice::input_available].
    ///
    /// [QdioDevice::input_available]: crate::QdioDevice::input_available
    pub fn set_notify_fn(&self, f: Option<Arc<NotifyFn>>) {
        *self.notify_fn.lock().unwrap() = f;
    }

    /// Queue a frame for input, as if it had arrived from outside.
    pub fn inject(&self, frame: Vec<u8>) -> Result<(), PortError> {
        {
            let mut frames = self.frames.lock().unwrap();
            if frames.len() >= self.depth {
                return Err(PortError::Full);
            }
            frames.push_back(frame);
        }
        let f = self.notify_fn.lock().unwrap().clone();
        if let Some(f) = f {
            f();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl PayloadPort for LoopbackPort {
    fn transmit(&self, _queue: u8, frame: &[u8]) -> Result<(), PortError> {
        self.inject(frame.to_vec())
    }
    fn has_pending(&self, queue: u8) -> bool {
        queue == 0 && !self.frames.lock().unwrap().is_empty()
    }
    fn receive(&self, queue: u8) -> Result<Option<Vec<u8>>, PortError> {
        if queue != 0 {
            return Ok(None);
        }
        Ok(self.frames.lock().unwrap().pop_front())
    }
}
