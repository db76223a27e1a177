//! Process-wide execution context
//!
//! One [`Context`] is created at boot and passed explicitly to every
//! component that needs device access — there is no global accessor. It
//! owns the host memory space, one memory space per tensor-parallel rank,
//! per-rank compute and collective stream handles, the peer-access table
//! used by the custom all-reduce path, and the flag selecting serial vs
//! concurrent CONTEXT/DECODE execution.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::{MemoryDevice, MemoryLocation, SystemMemory};

/// Which of a rank's streams an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Forward-pass work and swap copies.
    Compute,
    /// Collective operations (all-reduce, all-gather).
    Collective,
}

/// Handle to one rank's compute or collective stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamHandle {
    /// Owning rank.
    pub rank: usize,
    /// Stream role.
    pub kind: StreamKind,
}

/// Process-wide device topology and execution mode.
pub struct Context {
    host: Arc<dyn MemoryDevice>,
    devices: Vec<Arc<dyn MemoryDevice>>,
    compute_streams: Vec<StreamHandle>,
    collective_streams: Vec<StreamHandle>,
    peer_access: Vec<Vec<bool>>,
    serial_execution: bool,
}

impl Context {
    /// Build a context over explicit memory spaces.
    ///
    /// `serial_execution` selects whether CONTEXT and DECODE phases share
    /// the compute stream (the only mode the swap path supports today).
    #[must_use]
    pub fn with_devices(
        host: Arc<dyn MemoryDevice>,
        devices: Vec<Arc<dyn MemoryDevice>>,
        serial_execution: bool,
    ) -> Self {
        let world = devices.len();
        let compute_streams = (0..world)
            .map(|rank| StreamHandle {
                rank,
                kind: StreamKind::Compute,
            })
            .collect();
        let collective_streams = (0..world)
            .map(|rank| StreamHandle {
                rank,
                kind: StreamKind::Collective,
            })
            .collect();
        // Same-rank access is trivially enabled; cross-rank pairs are probed
        // (and here granted) when the devices are registered.
        let peer_access = (0..world)
            .map(|_| (0..world).map(|_| true).collect())
            .collect();

        Self {
            host,
            devices,
            compute_streams,
            collective_streams,
            peer_access,
            serial_execution,
        }
    }

    /// Context over simulated devices, serial execution. Test builds and
    /// CPU-only runs.
    #[must_use]
    pub fn for_testing(tensor_para_size: usize) -> Self {
        Self::with_devices(
            Arc::new(SystemMemory::new(MemoryLocation::Host)),
            (0..tensor_para_size)
                .map(|rank| {
                    Arc::new(SystemMemory::new(MemoryLocation::Device(rank)))
                        as Arc<dyn MemoryDevice>
                })
                .collect(),
            true,
        )
    }

    /// Like [`Self::for_testing`] but with concurrent CONTEXT/DECODE
    /// execution, for exercising the unimplemented-path guards.
    #[must_use]
    pub fn for_testing_concurrent(tensor_para_size: usize) -> Self {
        let mut context = Self::for_testing(tensor_para_size);
        context.serial_execution = false;
        context
    }

    /// Number of devices per model replica.
    #[must_use]
    pub fn tensor_parallel_size(&self) -> usize {
        self.devices.len()
    }

    /// The host memory space.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn MemoryDevice> {
        &self.host
    }

    /// One rank's memory space.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an out-of-range rank.
    pub fn device(&self, rank: usize) -> Result<&Arc<dyn MemoryDevice>> {
        self.devices.get(rank).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "rank {rank} out of range ({} devices)",
                self.devices.len()
            ))
        })
    }

    /// One rank's compute stream handle.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an out-of-range rank.
    pub fn compute_stream(&self, rank: usize) -> Result<StreamHandle> {
        self.compute_streams.get(rank).copied().ok_or_else(|| {
            Error::InvalidArgument(format!("rank {rank} has no compute stream"))
        })
    }

    /// One rank's collective stream handle.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an out-of-range rank.
    pub fn collective_stream(&self, rank: usize) -> Result<StreamHandle> {
        self.collective_streams.get(rank).copied().ok_or_else(|| {
            Error::InvalidArgument(format!("rank {rank} has no collective stream"))
        })
    }

    /// Whether direct peer access between two ranks is available.
    #[must_use]
    pub fn peer_access_enabled(&self, from: usize, to: usize) -> bool {
        self.peer_access
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .unwrap_or(false)
    }

    /// Whether CONTEXT and DECODE run serially on the compute stream.
    #[must_use]
    pub fn is_serial_execution(&self) -> bool {
        self.serial_execution
    }

    /// Drain all outstanding work on one rank's streams.
    ///
    /// # Errors
    /// Returns an error if a queued operation failed.
    pub fn synchronize(&self, rank: usize) -> Result<()> {
        self.device(rank)?.synchronize()
    }
}
