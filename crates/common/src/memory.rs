//! Requester address space and locked buffers
//!
//! Transfer requests carry raw addresses into the requester's memory. Those
//! addresses are only meaningful while the request is being preprocessed in
//! caller context, where they are validated and locked. A [`LockedBuffer`] keeps
//! its region pinned for as long as any handle to it is alive, so the data
//! stays reachable across an asynchronous completion boundary.

use protocol::{UsbError, UsbResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// First address handed out by [`AddressSpace::map`]
const MAP_BASE: u64 = 0x1000_0000;
/// Regions are spaced on this boundary so neighbours never touch
const MAP_ALIGN: u64 = 0x1000;

/// Access a buffer is locked for, from the redirector's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockAccess {
    /// The redirector reads the buffer (host-to-device data)
    Read,
    /// The redirector writes the buffer (device-to-host data)
    Write,
}

struct Region {
    base: u64,
    writable: bool,
    data: Mutex<Vec<u8>>,
    locks: AtomicUsize,
}

impl Region {
    fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn contains(&self, address: u64, len: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        let offset = usize::try_from(offset).ok()?;
        let end = offset.checked_add(len)?;
        (end <= self.len()).then_some(offset)
    }
}

#[derive(Default)]
struct SpaceInner {
    regions: BTreeMap<u64, Arc<Region>>,
    next: u64,
}

/// Memory of one requester, addressed the way its transfer requests are
#[derive(Clone, Default)]
pub struct AddressSpace {
    inner: Arc<Mutex<SpaceInner>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a writable region and return its base address
    pub fn map(&self, data: Vec<u8>) -> u64 {
        self.map_region(data, true)
    }

    /// Map a region the requester only granted read access to
    pub fn map_read_only(&self, data: Vec<u8>) -> u64 {
        self.map_region(data, false)
    }

    fn map_region(&self, data: Vec<u8>, writable: bool) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let base = inner.next.max(MAP_BASE);
        let span = (data.len() as u64).max(1).div_ceil(MAP_ALIGN) * MAP_ALIGN;
        inner.next = base + span + MAP_ALIGN;
        inner.regions.insert(
            base,
            Arc::new(Region {
                base,
                writable,
                data: Mutex::new(data),
                locks: AtomicUsize::new(0),
            }),
        );
        base
    }

    fn find(&self, address: u64, len: usize) -> UsbResult<(Arc<Region>, usize)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, region) = inner
            .regions
            .range(..=address)
            .next_back()
            .ok_or(UsbError::AccessViolation)?;
        let offset = region
            .contains(address, len)
            .ok_or(UsbError::AccessViolation)?;
        Ok((Arc::clone(region), offset))
    }

    /// Copy `len` bytes out of requester memory
    ///
    /// An address range that is not entirely mapped faults with
    /// `AccessViolation` instead of reading anything.
    pub fn read(&self, address: u64, len: usize) -> UsbResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (region, offset) = self.find(address, len)?;
        let data = region.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data[offset..offset + len].to_vec())
    }

    /// Copy bytes into requester memory
    pub fn write(&self, address: u64, bytes: &[u8]) -> UsbResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (region, offset) = self.find(address, bytes.len())?;
        let mut data = region.data.lock().unwrap_or_else(PoisonError::into_inner);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Validate and lock `len` bytes at `address`
    ///
    /// Zero-length locks always succeed and pin nothing. Locking a read-only
    /// region for write faults like an unmapped one.
    pub fn lock(&self, address: u64, len: usize, access: LockAccess) -> UsbResult<LockedBuffer> {
        if len == 0 {
            return Ok(LockedBuffer {
                region: None,
                address,
                offset: 0,
                len: 0,
                access,
            });
        }
        let (region, offset) = self.find(address, len)?;
        if access == LockAccess::Write && !region.writable {
            return Err(UsbError::AccessViolation);
        }
        region.locks.fetch_add(1, Ordering::AcqRel);
        Ok(LockedBuffer {
            region: Some(region),
            address,
            offset,
            len,
            access,
        })
    }

    /// Number of live locks on the region containing `address`
    pub fn lock_count(&self, address: u64) -> usize {
        self.find(address, 1)
            .map(|(region, _)| region.locks.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AddressSpace")
            .field("regions", &inner.regions.len())
            .finish()
    }
}

/// A validated, pinned range of requester memory
///
/// Every handle counts as one lock on the region; the lock is released when
/// the handle is dropped.
pub struct LockedBuffer {
    region: Option<Arc<Region>>,
    address: u64,
    offset: usize,
    len: usize,
    access: LockAccess,
}

impl LockedBuffer {
    /// Requester address the buffer was locked at
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> LockAccess {
        self.access
    }

    /// Copy `len` bytes starting at `offset` within the buffer
    pub fn read_at(&self, offset: usize, len: usize) -> UsbResult<Vec<u8>> {
        let end = offset.checked_add(len).ok_or(UsbError::InvalidParameter)?;
        if end > self.len {
            return Err(UsbError::InvalidParameter);
        }
        match &self.region {
            Some(region) => {
                let data = region.data.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(data[self.offset + offset..self.offset + end].to_vec())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Copy the whole buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.read_at(0, self.len).unwrap_or_default()
    }

    /// Store `bytes` at `offset` within a buffer locked for write
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> UsbResult<()> {
        if self.access != LockAccess::Write {
            return Err(UsbError::AccessDenied);
        }
        let end = offset
            .checked_add(bytes.len())
            .ok_or(UsbError::InvalidParameter)?;
        if end > self.len {
            return Err(UsbError::BufferTooSmall { needed: end });
        }
        if let Some(region) = &self.region {
            let mut data = region.data.lock().unwrap_or_else(PoisonError::into_inner);
            data[self.offset + offset..self.offset + end].copy_from_slice(bytes);
        }
        Ok(())
    }
}

impl Clone for LockedBuffer {
    fn clone(&self) -> Self {
        if let Some(region) = &self.region {
            region.locks.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            region: self.region.clone(),
            address: self.address,
            offset: self.offset,
            len: self.len,
            access: self.access,
        }
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        if let Some(region) = &self.region {
            region.locks.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}
