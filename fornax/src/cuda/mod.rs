//! CUDA backing for the memory abstraction
//!
//! Enabled with the `cuda` feature. Provides [`CudaMemory`], a
//! [`MemoryDevice`](crate::memory::MemoryDevice) over one GPU via `cudarc`.

mod memory;

pub use memory::CudaMemory;
