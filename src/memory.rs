//! Memory region registry: protection domains and registered regions.
//!
//! Regions are exclusively owned by the connection that registered them and
//! must outlive any in-flight operation referencing them. In-flight
//! references are tracked with pins; deregistration fails with `RegionBusy`
//! while any pin is held.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{RdmaError, Result};
use crate::wire::RemoteBufferDescriptor;

/// Emulated device limit on registrations per protection domain.
const MAX_REGIONS_PER_PD: usize = 128;

/// Synthetic virtual-address base; each region gets a disjoint window.
const VA_BASE: u64 = 0x4000_0000_0000;
const VA_WINDOW: u64 = 1 << 28;

/// The two access combinations the protocol uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessRights {
    /// Local write only; no remote capability is minted.
    LocalWrite,
    /// Local write plus remote read and remote write.
    RemoteReadWrite,
}

impl AccessRights {
    pub fn allows_remote_write(self) -> bool {
        matches!(self, AccessRights::RemoteReadWrite)
    }
}

pub(crate) struct RegionState {
    pub(crate) addr: u64,
    pub(crate) access: AccessRights,
    pub(crate) buf: Mutex<Vec<u8>>,
    len: usize,
    in_flight: AtomicUsize,
}

impl RegionState {
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Isolation boundary for registered regions; one per connection.
#[derive(Clone)]
pub struct ProtectionDomain {
    inner: Arc<PdInner>,
}

struct PdInner {
    regions: DashMap<u32, Arc<RegionState>>,
    next_key: AtomicU32,
}

impl ProtectionDomain {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PdInner {
                regions: DashMap::new(),
                next_key: AtomicU32::new(0x1000),
            }),
        }
    }

    /// Registers `buffer` for the given access rights. Synchronous; the
    /// region is addressable the moment this returns.
    pub fn register(&self, buffer: Vec<u8>, access: AccessRights) -> Result<MemoryRegion> {
        if buffer.is_empty() {
            return Err(RdmaError::Registration(
                "cannot register a zero-length buffer".into(),
            ));
        }
        if self.inner.regions.len() >= MAX_REGIONS_PER_PD {
            return Err(RdmaError::Registration(format!(
                "protection domain is at its {MAX_REGIONS_PER_PD}-region limit"
            )));
        }

        let lkey = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        let addr = VA_BASE + u64::from(lkey) * VA_WINDOW;
        let len = buffer.len();
        let state = Arc::new(RegionState {
            addr,
            access,
            len,
            buf: Mutex::new(buffer),
            in_flight: AtomicUsize::new(0),
        });
        self.inner.regions.insert(lkey, Arc::clone(&state));

        tracing::debug!(lkey, addr, len, ?access, "registered memory region");
        Ok(MemoryRegion {
            pd: Arc::clone(&self.inner),
            state,
            lkey,
        })
    }

    /// Resolves a remote key to its region, for inbound one-sided writes.
    pub(crate) fn lookup(&self, rkey: u32) -> Option<Arc<RegionState>> {
        self.inner.regions.get(&rkey).map(|r| Arc::clone(&r))
    }

    /// Number of currently registered regions.
    pub fn region_count(&self) -> usize {
        self.inner.regions.len()
    }
}

impl Default for ProtectionDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered memory region. The handle is the exclusive owner; dropping
/// it deregisters best-effort once no operation references the region.
pub struct MemoryRegion {
    pd: Arc<PdInner>,
    state: Arc<RegionState>,
    lkey: u32,
}

impl MemoryRegion {
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Remote access key; only minted for remotely accessible regions.
    pub fn rkey(&self) -> Option<u32> {
        self.state.access.allows_remote_write().then_some(self.lkey)
    }

    pub fn addr(&self) -> u64 {
        self.state.addr
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.len() == 0
    }

    /// Builds the capability token a peer needs to target this region.
    pub fn descriptor(&self) -> Result<RemoteBufferDescriptor> {
        let rkey = self.rkey().ok_or_else(|| {
            RdmaError::Registration(format!(
                "region {:#x} was not registered for remote access",
                self.lkey
            ))
        })?;
        Ok(RemoteBufferDescriptor {
            addr: self.state.addr,
            rkey,
        })
    }

    /// Local write into the region.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut buf = self.state.buf.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                RdmaError::Registration(format!(
                    "write of {} bytes at offset {offset} exceeds region length {}",
                    data.len(),
                    buf.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copies the current region contents out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.buf.lock().clone()
    }

    /// Copies the first `len` bytes out.
    pub(crate) fn read_prefix(&self, len: usize) -> Vec<u8> {
        let buf = self.state.buf.lock();
        buf[..len.min(buf.len())].to_vec()
    }

    /// Number of operations currently referencing this region.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Deregisters the region and hands its buffer back.
    ///
    /// Fails with `RegionBusy` while any posted work request or active
    /// write-notify cycle still references it. The handle comes back with
    /// the error so the caller can retry once the operation finishes, as
    /// with `ibv_dereg_mr` returning `EBUSY`.
    pub fn deregister(self) -> std::result::Result<Vec<u8>, (MemoryRegion, RdmaError)> {
        let in_flight = self.state.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            let lkey = self.lkey;
            return Err((self, RdmaError::RegionBusy { lkey, in_flight }));
        }
        self.pd.regions.remove(&self.lkey);
        tracing::debug!(lkey = self.lkey, "deregistered memory region");
        Ok(std::mem::take(&mut *self.state.buf.lock()))
    }

    /// Marks the region as referenced by an in-flight operation.
    pub(crate) fn pin(&self) -> RegionPin {
        RegionPin::new(Arc::clone(&self.state))
    }

    pub(crate) fn state_arc(&self) -> Arc<RegionState> {
        Arc::clone(&self.state)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("lkey", &self.lkey)
            .field("addr", &self.state.addr)
            .field("len", &self.state.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // Busy regions stay in the domain table so the fabric side keeps a
        // valid target; the pins hold the state alive.
        if self.state.in_flight.load(Ordering::SeqCst) == 0 {
            self.pd.regions.remove(&self.lkey);
        } else {
            tracing::warn!(
                lkey = self.lkey,
                "region handle dropped with in-flight operations"
            );
        }
    }
}

/// Refcount guard for one in-flight reference to a region.
pub(crate) struct RegionPin {
    state: Arc<RegionState>,
}

impl RegionPin {
    pub(crate) fn new(state: Arc<RegionState>) -> Self {
        state.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for RegionPin {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
