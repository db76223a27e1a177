//! Block allocator for the paged KV cache
//!
//! Manages a pool of fixed-size blocks on one memory space. Every block is
//! either in the free map or the used map; variable-size contiguous
//! allocations (scratch tensors, logits buffers) bypass the pool and are
//! tracked separately so they never fragment it.
//!
//! Block traffic and contiguous traffic take separate mutexes and do not
//! contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::memory::{MemoryDevice, MemoryLocation};

/// Identifier of a block inside one allocator.
pub type BlockId = usize;

/// A fixed-size block (or contiguous region) of host or device memory.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    /// Allocator-local identifier.
    pub id: BlockId,
    /// Size in bytes.
    pub size: usize,
    /// Number of owners. Blocks return to the free pool at zero.
    pub ref_count: usize,
    /// Base address in the owning memory space.
    pub address: u64,
    /// Which memory space the block lives on.
    pub location: MemoryLocation,
}

struct PoolState {
    free: HashMap<BlockId, MemoryBlock>,
    used: HashMap<BlockId, MemoryBlock>,
    next_id: BlockId,
}

struct ContiguousState {
    used: HashMap<BlockId, MemoryBlock>,
    next_id: BlockId,
}

/// Fixed-size block pool over one [`MemoryDevice`].
pub struct BlockAllocator {
    config: AllocatorConfig,
    device: Arc<dyn MemoryDevice>,
    pool: Mutex<PoolState>,
    contiguous: Mutex<ContiguousState>,
}

impl BlockAllocator {
    /// Create an empty allocator; call [`Self::reset_preallocated_blocks`]
    /// to populate the pool.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the config is inconsistent.
    pub fn new(config: AllocatorConfig, device: Arc<dyn MemoryDevice>) -> Result<Self> {
        config.validate()?;
        if config.location != device.location() {
            return Err(Error::InvalidArgument(format!(
                "allocator location {:?} does not match device {:?}",
                config.location,
                device.location()
            )));
        }
        Ok(Self {
            config,
            device,
            pool: Mutex::new(PoolState {
                free: HashMap::new(),
                used: HashMap::new(),
                next_id: 0,
            }),
            contiguous: Mutex::new(ContiguousState {
                used: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    /// Bind this allocator's device to the calling thread.
    ///
    /// # Errors
    /// Returns an error if the driver rejects the binding.
    pub fn bind_device(&self) -> Result<()> {
        self.device.bind()
    }

    /// Grow or shrink the free pool to exactly `target` blocks.
    ///
    /// Blocks currently handed out are untouched; the target applies only to
    /// blocks not in use. Shrinking releases surplus free blocks back to the
    /// device.
    ///
    /// # Errors
    /// Returns the device error if backing allocations fail. Already-created
    /// blocks stay in the pool on failure.
    pub fn reset_preallocated_blocks(&self, target: usize) -> Result<()> {
        self.device.bind()?;
        let mut pool = self.lock_pool();

        while pool.free.len() < target {
            let address = self.device.allocate(self.config.block_size)?;
            let id = pool.next_id;
            pool.next_id += 1;
            pool.free.insert(
                id,
                MemoryBlock {
                    id,
                    size: self.config.block_size,
                    ref_count: 0,
                    address,
                    location: self.config.location,
                },
            );
        }

        while pool.free.len() > target {
            let id = *pool
                .free
                .keys()
                .next()
                .expect("free map non-empty while shrinking");
            let block = pool.free.remove(&id).expect("id taken from free map");
            self.device.release(block.address)?;
        }

        tracing::debug!(
            location = ?self.config.location,
            free = pool.free.len(),
            used = pool.used.len(),
            "reset pre-allocated blocks"
        );
        Ok(())
    }

    /// Allocate `num` blocks, all-or-nothing.
    ///
    /// # Errors
    /// Returns `OutOfDeviceMemory` when fewer than `num` blocks are free;
    /// no block is taken in that case.
    pub fn allocate_blocks(&self, num: usize) -> Result<Vec<BlockId>> {
        let mut pool = self.lock_pool();
        if pool.free.len() < num {
            return Err(Error::OutOfDeviceMemory(format!(
                "requested {num} blocks, {} free on {:?}",
                pool.free.len(),
                self.config.location
            )));
        }

        let ids: Vec<BlockId> = pool.free.keys().take(num).copied().collect();
        for id in &ids {
            let mut block = pool.free.remove(id).expect("id taken from free map");
            block.ref_count = 1;
            pool.used.insert(*id, block);
        }
        Ok(ids)
    }

    /// Drop one reference from each block; blocks reaching zero return to
    /// the free pool.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if any id is not currently in use; in that
    /// case no reference count is touched.
    pub fn free_blocks(&self, ids: &[BlockId]) -> Result<()> {
        let mut pool = self.lock_pool();
        if let Some(id) = ids.iter().find(|id| !pool.used.contains_key(*id)) {
            return Err(Error::InvalidArgument(format!(
                "block {id} is not in use on {:?}",
                self.config.location
            )));
        }

        for id in ids {
            let block = pool.used.get_mut(id).expect("presence checked above");
            block.ref_count -= 1;
            if block.ref_count == 0 {
                let block = pool.used.remove(id).expect("id present");
                pool.free.insert(*id, block);
            }
        }
        Ok(())
    }

    /// Look up the base addresses of blocks, free or in use.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if any id is unknown to this allocator.
    pub fn get_block_ptrs(&self, ids: &[BlockId]) -> Result<Vec<u64>> {
        let pool = self.lock_pool();
        ids.iter()
            .map(|id| {
                pool.used
                    .get(id)
                    .or_else(|| pool.free.get(id))
                    .map(|block| block.address)
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "unknown block {id} on {:?}",
                            self.config.location
                        ))
                    })
            })
            .collect()
    }

    /// Allocate a bespoke contiguous region outside the block pool.
    ///
    /// # Errors
    /// Returns the device's exhaustion error when memory runs out.
    pub fn allocate_contiguous(&self, bytes: usize) -> Result<BlockId> {
        self.device.bind()?;
        let address = self.device.allocate(bytes)?;
        let mut contiguous = self.lock_contiguous();
        let id = contiguous.next_id;
        contiguous.next_id += 1;
        contiguous.used.insert(
            id,
            MemoryBlock {
                id,
                size: bytes,
                ref_count: 1,
                address,
                location: self.config.location,
            },
        );
        Ok(id)
    }

    /// Release a contiguous region.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn free_contiguous(&self, id: BlockId) -> Result<()> {
        let block = {
            let mut contiguous = self.lock_contiguous();
            contiguous.used.remove(&id).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown contiguous region {id} on {:?}",
                    self.config.location
                ))
            })?
        };
        self.device.release(block.address)
    }

    /// Base address of a contiguous region.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn get_contiguous_ptr(&self, id: BlockId) -> Result<u64> {
        let contiguous = self.lock_contiguous();
        contiguous
            .used
            .get(&id)
            .map(|block| block.address)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown contiguous region {id} on {:?}",
                    self.config.location
                ))
            })
    }

    /// Number of free blocks. Unsynchronized with concurrent mutation; fine
    /// for metrics and planning.
    #[must_use]
    pub fn free_block_num(&self) -> usize {
        self.lock_pool().free.len()
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn used_block_num(&self) -> usize {
        self.lock_pool().used.len()
    }

    /// Total blocks in the pool (free plus used).
    #[must_use]
    pub fn total_block_num(&self) -> usize {
        let pool = self.lock_pool();
        pool.free.len() + pool.used.len()
    }

    /// Bytes per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Tokens of KV data per block.
    #[must_use]
    pub fn block_token_num(&self) -> usize {
        self.config.block_token_num
    }

    /// The memory device backing this pool.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.pool.lock().expect("block pool mutex poisoned")
    }

    fn lock_contiguous(&self) -> std::sync::MutexGuard<'_, ContiguousState> {
        self.contiguous.lock().expect("contiguous mutex poisoned")
    }
}
