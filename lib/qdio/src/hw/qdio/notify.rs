// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt and thin-interrupt signaling.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use slog::{debug, warn, Logger};

use super::bits::INDICATOR_STATUS;
use super::establish::Indicators;
use crate::vmm::{AccessError, GuestMem};

/// Side-channel notice delivered to the host when the guest should look at
/// the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notice {
    /// A full interrupt is pending for the subchannel.
    Device(u32),
    /// An adapter-local summary indicator went from clear to set.
    Adapter { isc: u8 },
}

pub type NoticeFn = dyn Fn(Notice) + Send + Sync + 'static;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrReason {
    EstablishComplete,
    ActivateEnded,
    QueueCompletion { error: bool },
}

/// Pending full interrupt record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingIntr {
    pub subchannel: u32,
    pub reason: IntrReason,
}

/// How a queue completion was signaled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signaled {
    /// Indicators were set; `summary_was_clear` notes whether the adapter
    /// notice fired.
    Thin { summary_was_clear: bool },
    Full,
}

pub(crate) struct Notifier {
    schid: u32,
    pending: Mutex<VecDeque<PendingIntr>>,
    notice_fn: Mutex<Option<Arc<NoticeFn>>>,
    log: Logger,
}

impl Notifier {
    pub fn new(schid: u32, log: Logger) -> Self {
        Self {
            schid,
            pending: Mutex::new(VecDeque::new()),
            notice_fn: Mutex::new(None),
            log,
        }
    }

    pub fn set_notice_fn(&self, f: Option<Arc<NoticeFn>>) {
        *self.notice_fn.lock().unwrap() = f;
    }

    fn notice(&self, notice: Notice) {
        let f = self.notice_fn.lock().unwrap().clone();
        if let Some(f) = f {
            f(notice);
        }
    }

    /// Queue a full interrupt for the subchannel.
    pub fn post(&self, reason: IntrReason) {
        self.pending
            .lock()
            .unwrap()
            .push_back(PendingIntr { subchannel: self.schid, reason });
        debug!(self.log, "interrupt pending"; "reason" => ?reason);
        self.notice(Notice::Device(self.schid));
    }

    /// Signal completed queue work, preferring the thin indicators when they
    /// were validated at establish time.
    pub fn signal_completion(
        &self,
        mem: &GuestMem,
        thin: Option<&Indicators>,
        error: bool,
    ) -> Signaled {
        if let Some(ind) = thin {
            match Self::set_indicators(mem, ind) {
                Ok(summary_was_clear) => {
                    if summary_was_clear {
                        self.notice(Notice::Adapter { isc: ind.isc });
                    }
                    return Signaled::Thin { summary_was_clear };
                }
                Err(e) => {
                    warn!(self.log, "thin indicators unreachable";
                        "error" => %e);
                }
            }
        }
        self.post(IntrReason::QueueCompletion { error });
        Signaled::Full
    }

    fn set_indicators(
        mem: &GuestMem,
        ind: &Indicators,
    ) -> Result<bool, AccessError> {
        mem.fetch_or(ind.dsci.addr, ind.dsci.key, INDICATOR_STATUS)?;
        let prior =
            mem.fetch_or(ind.alsi.addr, ind.alsi.key, INDICATOR_STATUS)?;
        Ok(prior & INDICATOR_STATUS == 0)
    }

    pub fn take(&self) -> Option<PendingIntr> {
        self.pending.lock().unwrap().pop_front()
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::GuestAddr;
    use crate::hw::qdio::establish::Span;
    use crate::vmm::{AccessKey, StorageKey};

    fn notifier() -> (Notifier, Arc<Mutex<Vec<Notice>>>) {
        let log = Logger::root(slog::Discard, slog::o!());
        let n = Notifier::new(0x42, log);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        n.set_notice_fn(Some(Arc::new(move |notice| {
            inner.lock().unwrap().push(notice)
        })));
        (n, seen)
    }

    fn indicators(key: AccessKey) -> Indicators {
        Indicators {
            alsi: Span { addr: GuestAddr(0x800), key },
            dsci: Span { addr: GuestAddr(0x801), key },
            isc: 3,
        }
    }

    #[test]
    fn full_interrupt_queued() {
        let (n, seen) = notifier();
        let mem = GuestMem::new(0x1000);
        assert!(!n.is_pending());

        assert_eq!(n.signal_completion(&mem, None, true), Signaled::Full);
        assert!(n.is_pending());
        assert_eq!(
            n.take(),
            Some(PendingIntr {
                subchannel: 0x42,
                reason: IntrReason::QueueCompletion { error: true }
            })
        );
        assert_eq!(n.take(), None);
        assert_eq!(*seen.lock().unwrap(), vec![Notice::Device(0x42)]);
    }

    #[test]
    fn thin_sets_both_indicators() {
        let (n, seen) = notifier();
        let mem = GuestMem::new(0x1000);
        let ind = indicators(AccessKey::ZERO);

        assert_eq!(
            n.signal_completion(&mem, Some(&ind), false),
            Signaled::Thin { summary_was_clear: true }
        );
        assert_eq!(
            n.signal_completion(&mem, Some(&ind), false),
            Signaled::Thin { summary_was_clear: false }
        );
        let byte = |addr| mem.read::<u8>(GuestAddr(addr), AccessKey::ZERO);
        assert_eq!(byte(0x800).unwrap(), 1);
        assert_eq!(byte(0x801).unwrap(), 1);
        assert!(!n.is_pending());
        assert_eq!(*seen.lock().unwrap(), vec![Notice::Adapter { isc: 3 }]);
    }

    #[test]
    fn thin_falls_back_when_unreachable() {
        let (n, _seen) = notifier();
        let mem = GuestMem::new(0x1000);
        mem.set_storage_key(
            GuestAddr(0),
            StorageKey::protected(AccessKey::new(2), false),
        )
        .unwrap();
        let ind = indicators(AccessKey::new(9));

        assert_eq!(
            n.signal_completion(&mem, Some(&ind), false),
            Signaled::Full
        );
        assert!(n.is_pending());
    }
}
