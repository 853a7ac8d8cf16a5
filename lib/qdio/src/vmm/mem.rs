// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key-checked access to guest storage.
//!
//! Guest storage is a flat, page-granular byte array.  Every 4 KiB page
//! carries a [StorageKey], and every access names the [AccessKey] it is made
//! under along with its [Access] intent.  Accesses are checked against the
//! storage limit and the key-controlled protection rules before any byte is
//! touched, so a failing access never leaves partial effects behind.

use std::mem::size_of;
use std::ops::Range;
use std::sync::Mutex;

use bitstruct::bitstruct;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::common::{round_up_p2, GuestAddr, GuestRegion, PAGE_SIZE};

bitstruct! {
    /// The storage key associated with a 4 KiB page of guest storage.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StorageKey(pub u8) {
        reserved: bool = 0;

        /// Set by the first store into the page.
        pub change: bool = 1;

        /// Set by the first access of any kind to the page.
        pub reference: bool = 2;

        /// Fetches must match the access-control bits as well as stores.
        pub fetch_protect: bool = 3;

        /// Access-control bits.
        pub acc: u8 = 4..8;
    }
}

impl StorageKey {
    /// Key with the given access-control value and fetch-protection setting,
    /// reference and change bits clear.
    pub fn protected(acc: AccessKey, fetch_protect: bool) -> Self {
        StorageKey(0).with_acc(acc.0).with_fetch_protect(fetch_protect)
    }
}

/// The 4-bit key an access is performed under.
///
/// Key 0 is the master key and is never refused by key-controlled
/// protection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessKey(u8);

impl AccessKey {
    pub const ZERO: AccessKey = AccessKey(0);

    /// Builds a key from the low nibble of `raw`.
    pub const fn new(raw: u8) -> Self {
        Self(raw & 0xf)
    }
    /// Builds a key from the high nibble of `raw`.
    pub const fn from_high_nibble(raw: u8) -> Self {
        Self(raw >> 4)
    }
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intent of a storage access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Fetch,
    Store,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("{access:?} of {len:#x} bytes at {addr} exceeds storage limit")]
    Addressing { addr: GuestAddr, len: usize, access: Access },

    #[error("{access:?} at {addr} refused under key {key}")]
    Protection { addr: GuestAddr, key: AccessKey, access: Access },
}

impl AccessError {
    pub fn addr(&self) -> GuestAddr {
        match self {
            AccessError::Addressing { addr, .. } => *addr,
            AccessError::Protection { addr, .. } => *addr,
        }
    }
}

struct Inner {
    bytes: Vec<u8>,
    keys: Vec<StorageKey>,
}

impl Inner {
    /// Check an access of `len` bytes at `addr`, returning the byte range
    /// within storage it covers.
    ///
    /// Each page touched by the access is subject to the protection check.
    fn check(
        &self,
        addr: GuestAddr,
        len: usize,
        key: AccessKey,
        access: Access,
    ) -> Result<Range<usize>, AccessError> {
        let end = GuestRegion(addr, len)
            .end()
            .filter(|end| *end <= self.bytes.len() as u64)
            .ok_or(AccessError::Addressing { addr, len, access })?;
        let range = addr.0 as usize..end as usize;
        if range.is_empty() || key == AccessKey::ZERO {
            return Ok(range);
        }

        let first = range.start / PAGE_SIZE;
        let last = (range.end - 1) / PAGE_SIZE;
        for page in first..=last {
            let skey = self.keys[page];
            let matches = skey.acc() == key.0;
            let permitted = match access {
                Access::Store => matches,
                Access::Fetch => matches || !skey.fetch_protect(),
            };
            if !permitted {
                // Report the first byte of the offending page which falls
                // within the access.
                let fault = std::cmp::max(range.start, page * PAGE_SIZE);
                return Err(AccessError::Protection {
                    addr: GuestAddr(fault as u64),
                    key,
                    access,
                });
            }
        }
        Ok(range)
    }

    /// Record reference (and for stores, change) on the pages in `range`.
    fn mark(&mut self, range: &Range<usize>, access: Access) {
        if range.is_empty() {
            return;
        }
        let first = range.start / PAGE_SIZE;
        let last = (range.end - 1) / PAGE_SIZE;
        for skey in self.keys[first..=last].iter_mut() {
            skey.set_reference(true);
            if access == Access::Store {
                skey.set_change(true);
            }
        }
    }
}

/// Guest main storage.
pub struct GuestMem {
    inner: Mutex<Inner>,
    size: usize,
}

impl GuestMem {
    /// Allocate `size` bytes of zeroed storage (rounded up to a whole page),
    /// with every page under storage key 0.
    pub fn new(size: usize) -> Self {
        assert!(size != 0);
        let size = round_up_p2(size, PAGE_SIZE);
        let pages = size / PAGE_SIZE;
        Self {
            inner: Mutex::new(Inner {
                bytes: vec![0u8; size],
                keys: vec![StorageKey::default(); pages],
            }),
            size,
        }
    }

    /// Size of storage in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Replace the storage key of the page containing `addr`.
    pub fn set_storage_key(
        &self,
        addr: GuestAddr,
        skey: StorageKey,
    ) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let page = addr.page();
        let slot = inner.keys.get_mut(page).ok_or(AccessError::Addressing {
            addr,
            len: 0,
            access: Access::Store,
        })?;
        *slot = skey;
        Ok(())
    }

    /// Current storage key of the page containing `addr`.
    pub fn storage_key(
        &self,
        addr: GuestAddr,
    ) -> Result<StorageKey, AccessError> {
        let inner = self.inner.lock().unwrap();
        inner.keys.get(addr.page()).copied().ok_or(AccessError::Addressing {
            addr,
            len: 0,
            access: Access::Fetch,
        })
    }

    /// Check whether an access could be performed, without performing it.
    pub fn probe(
        &self,
        region: GuestRegion,
        key: AccessKey,
        access: Access,
    ) -> Result<(), AccessError> {
        let inner = self.inner.lock().unwrap();
        inner.check(region.0, region.1, key, access).map(|_| ())
    }

    /// Reads a generic value from a specified guest address.
    pub fn read<T: FromBytes>(
        &self,
        addr: GuestAddr,
        key: AccessKey,
    ) -> Result<T, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let range = inner.check(addr, size_of::<T>(), key, Access::Fetch)?;
        inner.mark(&range, Access::Fetch);
        let val = T::read_from_bytes(&inner.bytes[range])
            .ok()
            .expect("checked range is sized to T");
        Ok(val)
    }

    /// Reads `buf.len()` bytes from guest storage.
    pub fn read_bytes(
        &self,
        addr: GuestAddr,
        key: AccessKey,
        buf: &mut [u8],
    ) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let range = inner.check(addr, buf.len(), key, Access::Fetch)?;
        inner.mark(&range, Access::Fetch);
        buf.copy_from_slice(&inner.bytes[range]);
        Ok(())
    }

    /// Writes a value to guest storage.
    pub fn write<T: IntoBytes + Immutable>(
        &self,
        addr: GuestAddr,
        key: AccessKey,
        val: &T,
    ) -> Result<(), AccessError> {
        self.write_bytes(addr, key, val.as_bytes())
    }

    /// Writes the contents of `buf` to guest storage.
    pub fn write_bytes(
        &self,
        addr: GuestAddr,
        key: AccessKey,
        buf: &[u8],
    ) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let range = inner.check(addr, buf.len(), key, Access::Store)?;
        inner.mark(&range, Access::Store);
        inner.bytes[range].copy_from_slice(buf);
        Ok(())
    }

    /// Atomically OR `bits` into the byte at `addr`, returning its prior
    /// value.
    ///
    /// The access is checked as a store, the intent of the update.
    pub fn fetch_or(
        &self,
        addr: GuestAddr,
        key: AccessKey,
        bits: u8,
    ) -> Result<u8, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        let range = inner.check(addr, 1, key, Access::Store)?;
        inner.mark(&range, Access::Store);
        let old = inner.bytes[range.start];
        inner.bytes[range.start] = old | bits;
        Ok(old)
    }
}
