//! Memory device abstraction
//!
//! A [`MemoryDevice`] owns raw allocations on one memory space: the host, or
//! a single accelerator. Allocations are identified by their address so the
//! same `u64` values flow unchanged into the pointer tables consumed by the
//! attention kernels.
//!
//! [`SystemMemory`] is the process-memory implementation used for the host
//! pool and for device ranks when no accelerator is present; copies through
//! it are bitwise-faithful, which is what makes the swap round-trip law
//! checkable in tests. The CUDA implementation lives behind the `cuda`
//! feature (see [`crate::cuda`]).

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which memory space an allocation, block, or pool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLocation {
    /// Host (CPU) memory.
    Host,
    /// Accelerator memory, by tensor-parallel rank.
    Device(usize),
}

impl MemoryLocation {
    /// Whether this location is a device rank.
    #[must_use]
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

/// Free and total byte counts for one memory space.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// Bytes currently available.
    pub free: usize,
    /// Total bytes in the space.
    pub total: usize,
}

/// Capability interface over one memory space.
///
/// Block allocators and the block manager are written against this trait so
/// the same bookkeeping drives host memory, simulated devices, and real
/// accelerators.
pub trait MemoryDevice: Send + Sync {
    /// The memory space this device manages.
    fn location(&self) -> MemoryLocation;

    /// Bind the underlying driver context to the calling thread.
    ///
    /// Must be called before any other operation on a device; callers that
    /// may run on arbitrary threads re-bind before every batch of work.
    ///
    /// # Errors
    /// Returns an error if the driver rejects the binding.
    fn bind(&self) -> Result<()> {
        Ok(())
    }

    /// Allocate `bytes` of zeroed memory, returning its address.
    ///
    /// # Errors
    /// Returns `OutOfDeviceMemory` (device) or `InsufficientHostMemory`
    /// (host) when the space is exhausted.
    fn allocate(&self, bytes: usize) -> Result<u64>;

    /// Release an allocation previously returned by [`Self::allocate`].
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `addr` is not a live allocation base.
    fn release(&self, addr: u64) -> Result<()>;

    /// Copy host bytes into device memory at `dst`.
    ///
    /// `dst` may point anywhere inside a live allocation as long as
    /// `src.len()` bytes fit before its end.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the range is not covered by a live
    /// allocation, or `Device` when the copy itself fails.
    fn copy_in(&self, dst: u64, src: &[u8]) -> Result<()>;

    /// Copy device bytes at `src` out into a host buffer.
    ///
    /// # Errors
    /// Same conditions as [`Self::copy_in`].
    fn copy_out(&self, src: u64, dst: &mut [u8]) -> Result<()>;

    /// Free and total memory of the space.
    ///
    /// # Errors
    /// Returns an error if the driver query fails.
    fn memory_info(&self) -> Result<MemoryInfo>;

    /// Wait for all outstanding asynchronous work on this device.
    ///
    /// # Errors
    /// Returns an error if a queued operation failed.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

/// One live allocation inside a [`SystemMemory`].
struct Region {
    data: Box<[u8]>,
}

struct SystemState {
    /// Live allocations keyed by base address.
    regions: BTreeMap<u64, Region>,
    free: usize,
    total: usize,
}

/// Process-memory implementation of [`MemoryDevice`].
///
/// Plays the host role in every deployment, and the device role in tests and
/// CPU-only runs. Reported capacity can be capped at construction so
/// capacity-sizing arithmetic is exercisable without an accelerator.
pub struct SystemMemory {
    location: MemoryLocation,
    state: Mutex<SystemState>,
}

impl SystemMemory {
    /// Effectively unbounded capacity for pools that are not under test.
    const UNBOUNDED: usize = usize::MAX / 2;

    /// Create a system memory space with unbounded reported capacity.
    #[must_use]
    pub fn new(location: MemoryLocation) -> Self {
        Self::with_capacity(location, Self::UNBOUNDED)
    }

    /// Create a system memory space that reports `total` bytes of capacity
    /// and fails allocations beyond it.
    #[must_use]
    pub fn with_capacity(location: MemoryLocation, total: usize) -> Self {
        Self {
            location,
            state: Mutex::new(SystemState {
                regions: BTreeMap::new(),
                free: total,
                total,
            }),
        }
    }

    fn exhausted(&self, bytes: usize) -> Error {
        match self.location {
            MemoryLocation::Host => Error::InsufficientHostMemory(format!(
                "cannot allocate {bytes} bytes of host memory"
            )),
            MemoryLocation::Device(rank) => Error::OutOfDeviceMemory(format!(
                "cannot allocate {bytes} bytes on device {rank}"
            )),
        }
    }

    /// Locate the allocation covering `[addr, addr + len)` and run `f` on it.
    fn with_region<T>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock().expect("system memory mutex poisoned");
        let (base, region) = state
            .regions
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| Error::InvalidArgument(format!("address {addr:#x} is not mapped")))?;
        let offset = usize::try_from(addr - base)
            .map_err(|_| Error::InvalidArgument(format!("address {addr:#x} out of range")))?;
        if offset + len > region.data.len() {
            return Err(Error::InvalidArgument(format!(
                "range {addr:#x}+{len} escapes its allocation"
            )));
        }
        Ok(f(&mut region.data[offset..offset + len]))
    }
}

impl MemoryDevice for SystemMemory {
    fn location(&self) -> MemoryLocation {
        self.location
    }

    fn allocate(&self, bytes: usize) -> Result<u64> {
        if bytes == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate zero bytes".into(),
            ));
        }
        let mut state = self.state.lock().expect("system memory mutex poisoned");
        if state.free < bytes {
            return Err(self.exhausted(bytes));
        }
        let data = vec![0u8; bytes].into_boxed_slice();
        let addr = data.as_ptr() as u64;
        state.free -= bytes;
        state.regions.insert(addr, Region { data });
        Ok(addr)
    }

    fn release(&self, addr: u64) -> Result<()> {
        let mut state = self.state.lock().expect("system memory mutex poisoned");
        let region = state
            .regions
            .remove(&addr)
            .ok_or_else(|| Error::InvalidArgument(format!("address {addr:#x} is not mapped")))?;
        state.free += region.data.len();
        Ok(())
    }

    fn copy_in(&self, dst: u64, src: &[u8]) -> Result<()> {
        self.with_region(dst, src.len(), |region| region.copy_from_slice(src))
    }

    fn copy_out(&self, src: u64, dst: &mut [u8]) -> Result<()> {
        self.with_region(src, dst.len(), |region| dst.copy_from_slice(region))
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        let state = self.state.lock().expect("system memory mutex poisoned");
        Ok(MemoryInfo {
            free: state.free,
            total: state.total,
        })
    }
}
