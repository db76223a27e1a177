//! Fornax: paged KV-cache core for LLM inference serving
//!
//! This crate provides the resource layer under a batching inference
//! runtime: the memory device abstraction, fixed-size block pools with
//! host/device swap, the KV block layout contract shared with attention
//! kernels, and the process-wide execution [`Context`].
//!
//! # Features
//!
//! - `cuda` - Enable CUDA GPU support (requires CUDA toolkit)

pub mod config;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod error;
pub mod memory;

pub use config::{AllocatorConfig, BlockManagerConfig, EngineConfig, SchedulerConfig};
pub use context::{Context, StreamHandle, StreamKind};
#[cfg(feature = "cuda")]
pub use cuda::CudaMemory;
pub use error::{Error, Result};
pub use memory::{
    BlockAllocator, BlockId, BlockManager, KvLayout, MemoryBlock, MemoryDevice, MemoryInfo,
    MemoryLocation, SystemMemory,
};
