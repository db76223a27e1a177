//! KV block layout
//!
//! A block stores the key/value data of `block_token_num` tokens for every
//! layer of one tensor-parallel partition. Within a block at address `p`,
//! layer `L` owns `[p + L*per_layer, p + (L+1)*per_layer)` with the K half
//! first and the V half second, where `per_layer = block_size / num_layers`.
//! Attention kernels index this layout through a flat pointer table, so it
//! must be reproduced bit-exactly.

use crate::error::{Error, Result};

/// Byte layout of one KV block across layers.
#[derive(Debug, Clone, Copy)]
pub struct KvLayout {
    num_layers: usize,
    block_size: usize,
}

impl KvLayout {
    /// Describe the layout for a model with `num_layers` layers.
    ///
    /// # Errors
    /// Returns `InvalidArgument` unless the block splits evenly into
    /// per-layer K and V halves.
    pub fn new(num_layers: usize, block_size: usize) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::InvalidArgument("num_layers must be > 0".into()));
        }
        if block_size % (num_layers * 2) != 0 {
            return Err(Error::InvalidArgument(format!(
                "block_size {block_size} does not split into {num_layers} layers of K and V"
            )));
        }
        Ok(Self {
            num_layers,
            block_size,
        })
    }

    /// Number of layers sharing one block.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Bytes per layer within one block.
    #[must_use]
    pub fn per_layer_bytes(&self) -> usize {
        self.block_size / self.num_layers
    }

    /// Offset of layer `layer`'s K region from the block base.
    #[must_use]
    pub fn k_offset(&self, layer: usize) -> usize {
        layer * self.per_layer_bytes()
    }

    /// Offset of layer `layer`'s V region from the block base.
    #[must_use]
    pub fn v_offset(&self, layer: usize) -> usize {
        self.k_offset(layer) + self.per_layer_bytes() / 2
    }

    /// Build the flat pointer table the attention kernels consume.
    ///
    /// `block_ptrs` holds each request's block base addresses in sequence
    /// order. The result has shape `[num_layers, 2 * total_block_num]`: per
    /// layer, every request's K pointers in batch order, then every
    /// request's V pointers.
    #[must_use]
    pub fn build_pointer_table(&self, block_ptrs: &[Vec<u64>]) -> Vec<u64> {
        let total_block_num: usize = block_ptrs.iter().map(Vec::len).sum();
        let mut table = Vec::with_capacity(self.num_layers * total_block_num * 2);

        for layer in 0..self.num_layers {
            let k_offset = self.k_offset(layer) as u64;
            let v_offset = self.v_offset(layer) as u64;
            for request_blocks in block_ptrs {
                for &base in request_blocks {
                    table.push(base + k_offset);
                }
            }
            for request_blocks in block_ptrs {
                for &base in request_blocks {
                    table.push(base + v_offset);
                }
            }
        }
        table
    }
}
