//! CUDA implementation of the memory device abstraction
//!
//! Each [`CudaMemory`] wraps one `CudaDevice`. Allocations are zeroed
//! `CudaSlice<u8>` buffers kept alive in a map keyed by their device
//! pointer, so the same `u64` addresses flow into kernel pointer tables.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr};

use crate::error::{Error, Result};
use crate::memory::{MemoryDevice, MemoryInfo, MemoryLocation};

/// One GPU's memory space.
pub struct CudaMemory {
    device: Arc<CudaDevice>,
    rank: usize,
    allocations: Mutex<BTreeMap<u64, CudaSlice<u8>>>,
}

impl CudaMemory {
    /// Open the CUDA device with ordinal `rank`.
    ///
    /// # Errors
    /// Returns an error if the driver cannot initialize the device.
    pub fn new(rank: usize) -> Result<Self> {
        let device = CudaDevice::new(rank)?;
        Ok(Self {
            device,
            rank,
            allocations: Mutex::new(BTreeMap::new()),
        })
    }

    /// The underlying cudarc device handle.
    #[must_use]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Find the allocation covering `[addr, addr + len)` and return its base
    /// and the offset of `addr` within it.
    fn resolve(
        allocations: &BTreeMap<u64, CudaSlice<u8>>,
        addr: u64,
        len: usize,
    ) -> Result<(u64, usize)> {
        let (&base, slice) = allocations
            .range(..=addr)
            .next_back()
            .ok_or_else(|| Error::InvalidArgument(format!("address {addr:#x} is not mapped")))?;
        let offset = usize::try_from(addr - base)
            .map_err(|_| Error::InvalidArgument(format!("address {addr:#x} out of range")))?;
        if offset + len > slice.len() {
            return Err(Error::InvalidArgument(format!(
                "range {addr:#x}+{len} escapes its allocation"
            )));
        }
        Ok((base, offset))
    }
}

impl MemoryDevice for CudaMemory {
    fn location(&self) -> MemoryLocation {
        MemoryLocation::Device(self.rank)
    }

    fn bind(&self) -> Result<()> {
        self.device.bind_to_thread()?;
        Ok(())
    }

    fn allocate(&self, bytes: usize) -> Result<u64> {
        let slice = self
            .device
            .alloc_zeros::<u8>(bytes)
            .map_err(|e| Error::OutOfDeviceMemory(format!("device {}: {e}", self.rank)))?;
        let addr = *slice.device_ptr();
        self.allocations
            .lock()
            .expect("cuda allocation mutex poisoned")
            .insert(addr, slice);
        Ok(addr)
    }

    fn release(&self, addr: u64) -> Result<()> {
        self.allocations
            .lock()
            .expect("cuda allocation mutex poisoned")
            .remove(&addr)
            .map(drop)
            .ok_or_else(|| Error::InvalidArgument(format!("address {addr:#x} is not mapped")))
    }

    fn copy_in(&self, dst: u64, src: &[u8]) -> Result<()> {
        let mut allocations = self
            .allocations
            .lock()
            .expect("cuda allocation mutex poisoned");
        let (base, offset) = Self::resolve(&allocations, dst, src.len())?;
        let slice = allocations.get_mut(&base).expect("base resolved above");
        let mut view = slice
            .try_slice_mut(offset..offset + src.len())
            .ok_or_else(|| Error::InvalidArgument(format!("range {dst:#x} not sliceable")))?;
        self.device.htod_sync_copy_into(src, &mut view)?;
        Ok(())
    }

    fn copy_out(&self, src: u64, dst: &mut [u8]) -> Result<()> {
        let allocations = self
            .allocations
            .lock()
            .expect("cuda allocation mutex poisoned");
        let (base, offset) = Self::resolve(&allocations, src, dst.len())?;
        let slice = allocations.get(&base).expect("base resolved above");
        let view = slice
            .try_slice(offset..offset + dst.len())
            .ok_or_else(|| Error::InvalidArgument(format!("range {src:#x} not sliceable")))?;
        self.device.dtoh_sync_copy_into(&view, dst)?;
        Ok(())
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        let (free, total) = cudarc::driver::result::mem_get_info()?;
        Ok(MemoryInfo { free, total })
    }

    fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
