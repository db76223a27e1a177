//! Block manager: one host pool plus one device pool per rank
//!
//! The facade every other component allocates KV memory through. Device
//! operations take an explicit rank and re-bind the device before touching
//! it, so callers may run on any thread.
//!
//! Swapping copies whole blocks between a rank's pool and the host pool.
//! The source blocks are freed only after the copies have completed on the
//! rank's compute path: the manager synchronizes the device between issuing
//! the copies and releasing the sources, so a recycled block can never be
//! overwritten while a DMA is still reading it.

use std::sync::Arc;

use crate::config::BlockManagerConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::memory::block_allocator::{BlockAllocator, BlockId};
use crate::memory::MemoryLocation;

/// Sizing granularity for the block pool arithmetic.
const ALIGNMENT_BYTES: usize = 8;

/// Facade over the host allocator and all per-rank device allocators.
pub struct BlockManager {
    config: BlockManagerConfig,
    context: Arc<Context>,
    host_allocator: BlockAllocator,
    device_allocators: Vec<BlockAllocator>,
}

impl BlockManager {
    /// Build the host pool and one device pool per tensor-parallel rank.
    ///
    /// Pools start empty; call [`Self::pre_allocate_blocks`] to use the
    /// configured counts or [`Self::reset_preallocated_blocks`] to size from
    /// live memory.
    ///
    /// # Errors
    /// Returns `InvalidArgument` on config violations.
    pub fn new(config: BlockManagerConfig, context: Arc<Context>) -> Result<Self> {
        config.validate()?;

        let host_allocator = BlockAllocator::new(
            config.host_allocator.clone(),
            Arc::clone(context.host()),
        )?;

        let mut device_allocators = Vec::with_capacity(context.tensor_parallel_size());
        for rank in 0..context.tensor_parallel_size() {
            let mut allocator_config = config.device_allocator.clone();
            allocator_config.location = MemoryLocation::Device(rank);
            device_allocators.push(BlockAllocator::new(
                allocator_config,
                Arc::clone(context.device(rank)?),
            )?);
        }

        Ok(Self {
            config,
            context,
            host_allocator,
            device_allocators,
        })
    }

    /// Populate every pool with its configured `blocks_num`.
    ///
    /// # Errors
    /// Returns the backing allocation error on failure.
    pub fn pre_allocate_blocks(&self) -> Result<()> {
        self.host_allocator
            .reset_preallocated_blocks(self.config.host_allocator.blocks_num)?;
        for allocator in &self.device_allocators {
            allocator.reset_preallocated_blocks(self.config.device_allocator.blocks_num)?;
        }
        Ok(())
    }

    /// Resize every pool from live memory statistics.
    ///
    /// # Errors
    /// Propagates sizing failures, including `InsufficientHostMemory`.
    pub fn reset_preallocated_blocks(&self) -> Result<()> {
        let (device_blocks_num, host_blocks_num) = self.calculate_block_number()?;
        tracing::info!(device_blocks_num, host_blocks_num, "reset block pools");

        self.host_allocator
            .reset_preallocated_blocks(host_blocks_num)?;
        for allocator in &self.device_allocators {
            allocator.reset_preallocated_blocks(device_blocks_num)?;
        }
        Ok(())
    }

    /// Derive `(device_blocks_num, host_blocks_num)` from free memory.
    ///
    /// When `block_device_memory_ratio >= 0`, that fraction of total device
    /// memory backs the pool; otherwise all free memory minus the configured
    /// reserve does. The host pool is the device pool scaled by
    /// `block_host_memory_factor`.
    ///
    /// # Errors
    /// Returns `InsufficientHostMemory` when the host pool would not fit in
    /// free host memory.
    pub fn calculate_block_number(&self) -> Result<(usize, usize)> {
        let allocator = self.bind_device(0)?;
        let device_info = allocator.device().memory_info()?;
        let host_info = self.context.host().memory_info()?;

        tracing::info!(
            host_total = host_info.total,
            host_free = host_info.free,
            device_total = device_info.total,
            device_free = device_info.free,
            "memory info"
        );

        let block_memory_bytes = if self.config.block_device_memory_ratio >= 0.0 {
            align_down(
                fraction(device_info.total, self.config.block_device_memory_ratio),
                ALIGNMENT_BYTES,
            )
        } else {
            let reserved = align_up(
                fraction(device_info.total, self.config.reserved_device_memory_ratio),
                ALIGNMENT_BYTES,
            );
            align_down(
                device_info.free.saturating_sub(reserved),
                ALIGNMENT_BYTES,
            )
        };

        let device_blocks_num = block_memory_bytes / self.config.device_allocator.block_size;
        let host_blocks_num =
            fraction(device_blocks_num, self.config.block_host_memory_factor);

        let host_bytes = host_blocks_num * self.config.host_allocator.block_size;
        if host_bytes >= host_info.free {
            return Err(Error::InsufficientHostMemory(format!(
                "host pool needs {host_bytes} bytes, {} free",
                host_info.free
            )));
        }

        Ok((device_blocks_num, host_blocks_num))
    }

    /// Allocate `num` device blocks on `rank`, all-or-nothing.
    ///
    /// # Errors
    /// Returns `OutOfDeviceMemory` when the rank's pool cannot cover `num`.
    pub fn allocate_blocks(&self, rank: usize, num: usize) -> Result<Vec<BlockId>> {
        self.bind_device(rank)?.allocate_blocks(num)
    }

    /// Free device blocks on `rank`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for ids not in use.
    pub fn free_blocks(&self, rank: usize, ids: &[BlockId]) -> Result<()> {
        self.bind_device(rank)?.free_blocks(ids)
    }

    /// Allocate a contiguous scratch region on `rank`.
    ///
    /// # Errors
    /// Returns `OutOfDeviceMemory` when the device is exhausted.
    pub fn allocate_contiguous(&self, rank: usize, bytes: usize) -> Result<BlockId> {
        self.bind_device(rank)?.allocate_contiguous(bytes)
    }

    /// Free a contiguous region on `rank`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn free_contiguous(&self, rank: usize, id: BlockId) -> Result<()> {
        self.bind_device(rank)?.free_contiguous(id)
    }

    /// Base addresses of device blocks on `rank`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn get_block_ptrs(&self, rank: usize, ids: &[BlockId]) -> Result<Vec<u64>> {
        self.bind_device(rank)?.get_block_ptrs(ids)
    }

    /// Base address of a contiguous region on `rank`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn get_contiguous_ptr(&self, rank: usize, id: BlockId) -> Result<u64> {
        self.bind_device(rank)?.get_contiguous_ptr(id)
    }

    /// Free blocks on one rank's device pool.
    #[must_use]
    pub fn free_block_num(&self, rank: usize) -> usize {
        self.device_allocators
            .get(rank)
            .map_or(0, BlockAllocator::free_block_num)
    }

    /// In-use blocks on one rank's device pool.
    #[must_use]
    pub fn used_block_num(&self, rank: usize) -> usize {
        self.device_allocators
            .get(rank)
            .map_or(0, BlockAllocator::used_block_num)
    }

    /// Total pool size (free plus used) of one rank's device pool.
    #[must_use]
    pub fn total_block_num(&self, rank: usize) -> usize {
        self.device_allocators
            .get(rank)
            .map_or(0, BlockAllocator::total_block_num)
    }

    /// Free blocks in the host pool.
    #[must_use]
    pub fn host_free_block_num(&self) -> usize {
        self.host_allocator.free_block_num()
    }

    /// In-use blocks in the host pool.
    #[must_use]
    pub fn host_used_block_num(&self) -> usize {
        self.host_allocator.used_block_num()
    }

    /// Allocate host blocks (swap targets), all-or-nothing.
    ///
    /// # Errors
    /// Returns `OutOfDeviceMemory` when the host pool cannot cover `num`.
    pub fn allocate_host_blocks(&self, num: usize) -> Result<Vec<BlockId>> {
        self.host_allocator.allocate_blocks(num)
    }

    /// Free host blocks.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for ids not in use.
    pub fn free_host_blocks(&self, ids: &[BlockId]) -> Result<()> {
        self.host_allocator.free_blocks(ids)
    }

    /// Base addresses of host blocks.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn get_host_block_ptrs(&self, ids: &[BlockId]) -> Result<Vec<u64>> {
        self.host_allocator.get_block_ptrs(ids)
    }

    /// Move device blocks to freshly allocated host blocks.
    ///
    /// Copies run on the rank's compute path; the device blocks are freed
    /// only after the copies complete.
    ///
    /// # Errors
    /// Returns `Unimplemented` in concurrent CONTEXT+DECODE mode,
    /// `OutOfDeviceMemory` when the host pool is exhausted, and any copy
    /// failure.
    pub fn swap_out(&self, rank: usize, device_ids: &[BlockId]) -> Result<Vec<BlockId>> {
        if !self.context.is_serial_execution() {
            return Err(Error::Unimplemented(
                "swap with concurrent context/decode execution",
            ));
        }

        let device_allocator = self.bind_device(rank)?;
        let host_ids = self.host_allocator.allocate_blocks(device_ids.len())?;

        let host_addrs = self.host_allocator.get_block_ptrs(&host_ids)?;
        let device_addrs = device_allocator.get_block_ptrs(device_ids)?;

        let block_size = self.block_size();
        let device = device_allocator.device();
        let host = self.context.host();
        let mut staging = vec![0u8; block_size];
        for (device_addr, host_addr) in device_addrs.iter().zip(&host_addrs) {
            device.copy_out(*device_addr, &mut staging)?;
            host.copy_in(*host_addr, &staging)?;
        }

        // The copies must land before the source blocks can be recycled.
        device.synchronize()?;
        device_allocator.free_blocks(device_ids)?;

        tracing::debug!(rank, blocks = device_ids.len(), "swapped out");
        Ok(host_ids)
    }

    /// Move host blocks back to freshly allocated device blocks on `rank`.
    ///
    /// # Errors
    /// Same conditions as [`Self::swap_out`], with `OutOfDeviceMemory`
    /// raised when the rank's pool is exhausted.
    pub fn swap_in(&self, rank: usize, host_ids: &[BlockId]) -> Result<Vec<BlockId>> {
        if !self.context.is_serial_execution() {
            return Err(Error::Unimplemented(
                "swap with concurrent context/decode execution",
            ));
        }

        let device_allocator = self.bind_device(rank)?;
        let device_ids = device_allocator.allocate_blocks(host_ids.len())?;

        let device_addrs = device_allocator.get_block_ptrs(&device_ids)?;
        let host_addrs = self.host_allocator.get_block_ptrs(host_ids)?;

        let block_size = self.block_size();
        let device = device_allocator.device();
        let host = self.context.host();
        let mut staging = vec![0u8; block_size];
        for (host_addr, device_addr) in host_addrs.iter().zip(&device_addrs) {
            host.copy_out(*host_addr, &mut staging)?;
            device.copy_in(*device_addr, &staging)?;
        }

        device.synchronize()?;
        self.host_allocator.free_blocks(host_ids)?;

        tracing::debug!(rank, blocks = host_ids.len(), "swapped in");
        Ok(device_ids)
    }

    /// Discard host blocks without copying. Used for aborted requests.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for ids not in use.
    pub fn swap_drop(&self, host_ids: &[BlockId]) -> Result<()> {
        self.host_allocator.free_blocks(host_ids)
    }

    /// Bytes per block, identical across host and devices.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.config.device_allocator.block_size
    }

    /// Tokens of KV data per block.
    #[must_use]
    pub fn block_token_num(&self) -> usize {
        self.config.device_allocator.block_token_num
    }

    /// The shared process context.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Resolve a rank's allocator and re-bind its device to this thread.
    fn bind_device(&self, rank: usize) -> Result<&BlockAllocator> {
        let allocator = self.device_allocators.get(rank).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "rank {rank} out of range ({} devices)",
                self.device_allocators.len()
            ))
        })?;
        allocator.bind_device()?;
        Ok(allocator)
    }
}

fn fraction(value: usize, ratio: f64) -> usize {
    // Ratios are validated non-negative wherever this is called from.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    {
        (value as f64 * ratio) as usize
    }
}

fn align_down(bytes: usize, alignment: usize) -> usize {
    bytes / alignment * alignment
}

fn align_up(bytes: usize, alignment: usize) -> usize {
    bytes.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::memory::{MemoryDevice, SystemMemory};

    const BLOCK_SIZE: usize = 256;

    fn make_config(device_blocks: usize, host_blocks: usize) -> BlockManagerConfig {
        BlockManagerConfig {
            host_allocator: AllocatorConfig {
                block_size: BLOCK_SIZE,
                blocks_num: host_blocks,
                block_token_num: 4,
                location: MemoryLocation::Host,
            },
            device_allocator: AllocatorConfig {
                block_size: BLOCK_SIZE,
                blocks_num: device_blocks,
                block_token_num: 4,
                location: MemoryLocation::Device(0),
            },
            reserved_device_memory_ratio: 0.01,
            block_device_memory_ratio: -1.0,
            block_host_memory_factor: 2.0,
            lora_host_memory_factor: 2.0,
        }
    }

    fn make_manager(tp: usize, device_blocks: usize, host_blocks: usize) -> BlockManager {
        let context = Arc::new(Context::for_testing(tp));
        let manager = BlockManager::new(make_config(device_blocks, host_blocks), context).unwrap();
        manager.pre_allocate_blocks().unwrap();
        manager
    }

    #[test]
    fn pools_are_populated_per_rank() {
        let manager = make_manager(2, 4, 8);
        assert_eq!(manager.free_block_num(0), 4);
        assert_eq!(manager.free_block_num(1), 4);
        assert_eq!(manager.host_free_block_num(), 8);
    }

    #[test]
    fn swap_round_trip_preserves_bytes() {
        let manager = make_manager(1, 4, 8);

        let device_ids = manager.allocate_blocks(0, 2).unwrap();
        let device_addrs = manager.get_block_ptrs(0, &device_ids).unwrap();

        // Fill each block with a distinct pattern.
        let device = manager.context().device(0).unwrap();
        let patterns: Vec<Vec<u8>> = (0..2)
            .map(|i| (0..BLOCK_SIZE).map(|b| ((b + i * 7) % 251) as u8).collect())
            .collect();
        for (addr, pattern) in device_addrs.iter().zip(&patterns) {
            device.copy_in(*addr, pattern).unwrap();
        }

        let host_ids = manager.swap_out(0, &device_ids).unwrap();
        assert_eq!(manager.free_block_num(0), 4);
        assert_eq!(manager.host_free_block_num(), 6);

        let restored_ids = manager.swap_in(0, &host_ids).unwrap();
        assert_eq!(manager.host_free_block_num(), 8);

        let restored_addrs = manager.get_block_ptrs(0, &restored_ids).unwrap();
        let mut readback = vec![0u8; BLOCK_SIZE];
        for (addr, pattern) in restored_addrs.iter().zip(&patterns) {
            device.copy_out(*addr, &mut readback).unwrap();
            assert_eq!(&readback, pattern, "KV bytes changed across swap");
        }
    }

    #[test]
    fn swap_out_fails_when_host_pool_exhausted() {
        let manager = make_manager(1, 4, 1);
        let device_ids = manager.allocate_blocks(0, 2).unwrap();

        let err = manager.swap_out(0, &device_ids).unwrap_err();
        assert!(matches!(err, Error::OutOfDeviceMemory(_)));
        // Device blocks must be untouched after the failed swap.
        assert_eq!(manager.used_block_num(0), 2);
    }

    #[test]
    fn swap_rejected_in_concurrent_mode() {
        let context = Arc::new(Context::for_testing_concurrent(1));
        let manager = BlockManager::new(make_config(4, 8), context).unwrap();
        manager.pre_allocate_blocks().unwrap();

        let device_ids = manager.allocate_blocks(0, 1).unwrap();
        assert!(matches!(
            manager.swap_out(0, &device_ids),
            Err(Error::Unimplemented(_))
        ));
    }

    #[test]
    fn swap_drop_frees_host_blocks() {
        let manager = make_manager(1, 4, 8);
        let device_ids = manager.allocate_blocks(0, 2).unwrap();
        let host_ids = manager.swap_out(0, &device_ids).unwrap();
        assert_eq!(manager.host_free_block_num(), 6);

        manager.swap_drop(&host_ids).unwrap();
        assert_eq!(manager.host_free_block_num(), 8);
    }

    #[test]
    fn sizing_uses_free_minus_reserve() {
        let device_total = 100 * BLOCK_SIZE;
        let context = Arc::new(Context::with_devices(
            Arc::new(SystemMemory::new(MemoryLocation::Host)),
            vec![Arc::new(SystemMemory::with_capacity(
                MemoryLocation::Device(0),
                device_total,
            ))],
            true,
        ));
        let manager = BlockManager::new(make_config(0, 0), context).unwrap();

        let (device_blocks, host_blocks) = manager.calculate_block_number().unwrap();
        // reserve = 1% of total, aligned up; the rest backs blocks.
        assert!(device_blocks > 90 && device_blocks < 100);
        assert_eq!(host_blocks, device_blocks * 2);
    }

    #[test]
    fn sizing_fails_without_host_headroom() {
        let context = Arc::new(Context::with_devices(
            Arc::new(SystemMemory::with_capacity(
                MemoryLocation::Host,
                BLOCK_SIZE,
            )),
            vec![Arc::new(SystemMemory::with_capacity(
                MemoryLocation::Device(0),
                100 * BLOCK_SIZE,
            ))],
            true,
        ));
        let manager = BlockManager::new(make_config(0, 0), context).unwrap();

        assert!(matches!(
            manager.calculate_block_number(),
            Err(Error::InsufficientHostMemory(_))
        ));
    }

    #[test]
    fn unknown_rank_is_invalid() {
        let manager = make_manager(1, 2, 4);
        assert!(matches!(
            manager.allocate_blocks(3, 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}
