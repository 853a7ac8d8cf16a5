// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// General trait for emulated devices in the system.
///
/// As the machine goes through its lifecycle, the emulated devices which it
/// contains are driven through those phases via the event functions
/// (`start`, `pause`, `resume`, etc).
pub trait Lifecycle: Send + Sync + 'static {
    /// Unique name for devices for a given type
    fn type_name(&self) -> &'static str;

    /// Called when the machine is about to begin running.  After this
    /// returns, the callee device should be ready to do work on the guest's
    /// behalf.
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Directs this device to pause.  A paused device must stop producing
    /// work, but must accept (and hold onto) new requests from the guest.
    fn pause(&self) {}

    /// Directs this device to resume servicing the guest after pausing.
    fn resume(&self) {}

    /// Directs this device to reset itself to the state it would have on a
    /// cold start.
    fn reset(&self) {}

    /// Indicates that the device is stopping and will soon be discarded.
    fn halt(&self) {}
}
