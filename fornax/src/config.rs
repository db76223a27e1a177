//! Configuration for the block pools and the batch scheduler.
//!
//! All structs are plain serde-deserializable values so a deployment can be
//! described by a single JSON document (see [`EngineConfig::from_json_file`]).
//! Every struct has a `validate()` that enforces the cross-field constraints;
//! constructors of the components call it so a bad config fails at startup
//! rather than mid-generation.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryLocation;

/// Configuration for one block allocator (host, or one device rank).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Bytes per block. Must equal `block_token_num` times the per-token
    /// KV footprint, and must be identical across host and all devices.
    pub block_size: usize,
    /// Number of pre-allocated blocks in the pool.
    pub blocks_num: usize,
    /// Tokens of KV data stored per block.
    pub block_token_num: usize,
    /// Where the pool's memory lives.
    pub location: MemoryLocation,
}

impl AllocatorConfig {
    /// Check the allocator geometry.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `block_size` or `block_token_num` is zero
    /// or the block size is not a multiple of the token count.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidArgument("block_size must be > 0".into()));
        }
        if self.block_token_num == 0 {
            return Err(Error::InvalidArgument(
                "block_token_num must be > 0".into(),
            ));
        }
        if self.block_size % self.block_token_num != 0 {
            return Err(Error::InvalidArgument(format!(
                "block_size {} is not a multiple of block_token_num {}",
                self.block_size, self.block_token_num
            )));
        }
        Ok(())
    }
}

/// Configuration for the block manager: one host pool plus one device pool
/// per tensor-parallel rank, and the capacity-sizing ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockManagerConfig {
    /// Host-side (swap target) pool.
    pub host_allocator: AllocatorConfig,
    /// Device-side pool, replicated per rank.
    pub device_allocator: AllocatorConfig,
    /// Fraction of device memory never given to the block pool. Must be > 0.
    pub reserved_device_memory_ratio: f64,
    /// Fraction of total device memory used for blocks when >= 0; when < 0,
    /// all free memory minus the reserve is used.
    pub block_device_memory_ratio: f64,
    /// Host pool size as a multiple of the device pool size. Must be > 1.
    pub block_host_memory_factor: f64,
    /// Host memory headroom multiplier kept for adapter weights. Must be > 1.
    pub lora_host_memory_factor: f64,
}

impl BlockManagerConfig {
    /// Check pool geometry and sizing ratios.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the host and device block sizes differ
    /// or a ratio is outside its allowed range.
    pub fn validate(&self) -> Result<()> {
        self.host_allocator.validate()?;
        self.device_allocator.validate()?;
        if self.host_allocator.block_size != self.device_allocator.block_size {
            return Err(Error::InvalidArgument(
                "host and device block_size must be equal".into(),
            ));
        }
        if self.host_allocator.block_token_num != self.device_allocator.block_token_num {
            return Err(Error::InvalidArgument(
                "host and device block_token_num must be equal".into(),
            ));
        }
        if self.reserved_device_memory_ratio <= 0.0 {
            return Err(Error::InvalidArgument(
                "reserved_device_memory_ratio must be > 0.0".into(),
            ));
        }
        if self.block_host_memory_factor <= 1.0 {
            return Err(Error::InvalidArgument(
                "block_host_memory_factor must be > 1.0".into(),
            ));
        }
        if self.lora_host_memory_factor <= 1.0 {
            return Err(Error::InvalidArgument(
                "lora_host_memory_factor must be > 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the batch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard cap on concurrently running requests.
    pub max_batch_size: usize,
    /// Maximum prompt length accepted at enqueue.
    pub max_token_len: usize,
    /// Total tokens one forward step may consume (prompt tokens for CONTEXT
    /// requests, one per DECODE request).
    pub max_step_tokens: usize,
    /// Backpressure threshold for the waiting queue.
    pub max_waiting_queue_len: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_token_len: 2048,
            max_step_tokens: 4096,
            max_waiting_queue_len: 256,
        }
    }
}

impl SchedulerConfig {
    /// Check scheduler limits.
    ///
    /// # Errors
    /// Returns `InvalidArgument` unless `max_step_tokens > max_token_len`
    /// (otherwise no prompt at the length limit could ever be scheduled)
    /// and the batch and queue caps are non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_step_tokens <= self.max_token_len {
            return Err(Error::InvalidArgument(format!(
                "max_step_tokens must be larger than max_token_len, {} vs {}",
                self.max_step_tokens, self.max_token_len
            )));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidArgument("max_batch_size must be > 0".into()));
        }
        if self.max_waiting_queue_len == 0 {
            return Err(Error::InvalidArgument(
                "max_waiting_queue_len must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of devices per model replica.
    pub tensor_para_size: usize,
    /// Whether CONTEXT and DECODE phases run serially on the compute stream.
    #[serde(default = "default_serial_execution")]
    pub serial_execution: bool,
    /// Block pool configuration.
    pub block_manager: BlockManagerConfig,
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
}

fn default_serial_execution() -> bool {
    true
}

impl EngineConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the JSON does not parse,
    /// or validation fails.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration tree.
    ///
    /// # Errors
    /// Returns `InvalidArgument` on any violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.tensor_para_size == 0 {
            return Err(Error::InvalidArgument(
                "tensor_para_size must be > 0".into(),
            ));
        }
        self.block_manager.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_allocator() -> AllocatorConfig {
        AllocatorConfig {
            block_size: 1024,
            blocks_num: 64,
            block_token_num: 16,
            location: MemoryLocation::Device(0),
        }
    }

    fn host_allocator() -> AllocatorConfig {
        AllocatorConfig {
            location: MemoryLocation::Host,
            ..device_allocator()
        }
    }

    fn block_manager_config() -> BlockManagerConfig {
        BlockManagerConfig {
            host_allocator: host_allocator(),
            device_allocator: device_allocator(),
            reserved_device_memory_ratio: 0.05,
            block_device_memory_ratio: -1.0,
            block_host_memory_factor: 2.0,
            lora_host_memory_factor: 2.0,
        }
    }

    #[test]
    fn valid_config_passes() {
        block_manager_config().validate().unwrap();
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn mismatched_block_sizes_rejected() {
        let mut config = block_manager_config();
        config.host_allocator.block_size = 2048;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn block_size_must_divide_by_token_num() {
        let mut config = device_allocator();
        config.block_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reserved_ratio_must_be_positive() {
        let mut config = block_manager_config();
        config.reserved_device_memory_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_factor_must_exceed_one() {
        let mut config = block_manager_config();
        config.block_host_memory_factor = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_config_json_round_trip() {
        let config = EngineConfig {
            tensor_para_size: 2,
            serial_execution: true,
            block_manager: block_manager_config(),
            scheduler: SchedulerConfig::default(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.tensor_para_size, 2);
        assert_eq!(
            parsed.block_manager.device_allocator.block_size,
            config.block_manager.device_allocator.block_size
        );
    }

    #[test]
    fn step_tokens_must_exceed_token_len() {
        let config = SchedulerConfig {
            max_token_len: 4096,
            max_step_tokens: 4096,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
