//! Step driver
//!
//! Turns a scheduled batch into the device tensors a paged-attention
//! forward pass consumes, runs the pass on every rank in lock-step, and
//! scatters per-request logits. CONTEXT and DECODE requests are marshalled
//! as separate sub-batches; within a step each rank's work is FIFO on its
//! compute stream and the scoped-thread join is the cross-rank barrier.
//!
//! The transformer itself is external: implementations of [`ForwardPass`]
//! receive a [`StepInputs`] per rank and return last-token logits rows.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::sync::Arc;
use std::thread;

use fornax::memory::block_allocator::BlockId;
use fornax::{BlockManager, Context, Error, KvLayout, Result, SchedulerConfig};

use crate::request::{InferRequest, InferStage, SamplingConfig};

/// Model dimensions the driver needs for marshalling.
#[derive(Debug, Clone, Copy)]
pub struct ModelShape {
    /// Number of transformer layers sharing each KV block.
    pub num_layers: usize,
    /// Vocabulary size; one logits row is this many floats.
    pub vocab_size: usize,
}

/// Snapshot of one running request, taken under the queue mutex so no
/// request state is shared with the scheduler during the forward pass.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Request id.
    pub req_id: u64,
    /// Phase this step executes for the request.
    pub stage: InferStage,
    /// Tokens fed this step: the whole prompt for CONTEXT, the last
    /// generated token for DECODE.
    pub tokens: Vec<i32>,
    /// Sequence length including every token fed so far.
    pub seq_len: usize,
    /// Device KV block ids per rank.
    pub kv_block_ids: Vec<Vec<BlockId>>,
    /// Per-rank logits buffer base addresses.
    pub logits_buf: Vec<u64>,
    /// Row offset into the logits buffer.
    pub logits_offset: usize,
    /// Sampling parameters, for the between-steps token selection.
    pub sampling: SamplingConfig,
}

impl StepRequest {
    /// Snapshot a queued request for the next step.
    #[must_use]
    pub fn snapshot(req: &InferRequest) -> Self {
        let tokens = match req.stage {
            InferStage::Context => req.output_tokens.clone(),
            InferStage::Decode => req.output_tokens.last().copied().into_iter().collect(),
        };
        Self {
            req_id: req.req_id,
            stage: req.stage,
            tokens,
            seq_len: req.output_tokens.len(),
            kv_block_ids: req.kv_cache_blocks.clone(),
            logits_buf: req.logits_buf.clone(),
            logits_offset: req.logits_offset,
            sampling: req.sampling.clone(),
        }
    }
}

/// Device addresses of the uploaded input tables for one rank.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTables {
    /// `input_ids`, i32.
    pub input_ids: u64,
    /// `input_offsets` as i32, length `batch + 1`.
    pub input_offsets_i32: u64,
    /// `input_offsets` as u64, length `batch + 1`.
    pub input_offsets_u64: u64,
    /// Per-request sequence lengths (DECODE only), i32.
    pub seq_lengths: u64,
    /// Rotary positions, i64.
    pub rotary_positions: u64,
    /// Flat KV pointer table, u64.
    pub kv_list: u64,
    /// Per-request block-count prefix sums, i32.
    pub kv_cache_offsets: u64,
}

/// Everything one rank's forward pass reads for one sub-batch.
#[derive(Debug, Clone)]
pub struct StepInputs {
    /// Phase of every request in this sub-batch.
    pub stage: InferStage,
    /// Number of requests.
    pub batch_size: usize,
    /// Flattened input token ids.
    pub input_ids: Vec<i32>,
    /// Start offset of each request's tokens, plus a trailing end.
    pub input_offsets_i32: Vec<i32>,
    /// Same offsets in u64.
    pub input_offsets_u64: Vec<u64>,
    /// Current sequence length per request (DECODE only; empty for CONTEXT).
    pub seq_lengths: Vec<i32>,
    /// Rotary position of every fed token.
    pub rotary_positions: Vec<i64>,
    /// KV pointer table, shape `[num_layers, 2 * total_block_num]`.
    pub kv_list: Vec<u64>,
    /// Prefix sums of per-request block counts, with a leading zero.
    pub kv_cache_offsets: Vec<i32>,
    /// Total blocks across the sub-batch.
    pub total_block_num: usize,
    /// Longest sequence in the sub-batch.
    pub max_tokens: usize,
    /// Where the tables were uploaded on this rank.
    pub tables: DeviceTables,
}

/// The transformer seam. One implementation per model; the driver calls it
/// once per rank per sub-batch and expects one `vocab_size`-float logits
/// row per request (the last-token row, after the final all-gather).
pub trait ForwardPass: Send + Sync {
    /// Model dimensions.
    fn shape(&self) -> ModelShape;

    /// Run the forward pass for one rank.
    ///
    /// # Errors
    /// Any failure aborts the whole step; the runtime fails every request
    /// in the batch.
    fn forward(&self, rank: usize, inputs: &StepInputs) -> Result<Vec<f32>>;
}

/// Pre-allocated per-rank upload buffers, sized once from the config.
struct RankScratch {
    input_ids: Scratch,
    input_offsets_i32: Scratch,
    input_offsets_u64: Scratch,
    seq_lengths: Scratch,
    rotary_positions: Scratch,
    kv_list: Scratch,
    kv_cache_offsets: Scratch,
}

struct Scratch {
    id: BlockId,
    addr: u64,
    capacity: usize,
}

/// Marshals scheduled batches and drives the forward pass on every rank.
pub struct StepDriver<F: ForwardPass> {
    context: Arc<Context>,
    block_manager: Arc<BlockManager>,
    model: Arc<F>,
    shape: ModelShape,
    layout: KvLayout,
    max_batch_size: usize,
    max_step_tokens: usize,
    scratch: Vec<RankScratch>,
}

impl<F: ForwardPass> StepDriver<F> {
    /// Build the driver and allocate per-rank scratch buffers.
    ///
    /// # Errors
    /// Returns an error if the KV layout is inconsistent with the block
    /// size or scratch allocation fails.
    pub fn new(
        block_manager: Arc<BlockManager>,
        model: Arc<F>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let context = Arc::clone(block_manager.context());
        let shape = model.shape();
        let layout = KvLayout::new(shape.num_layers, block_manager.block_size())?;

        let max_blocks = block_manager
            .total_block_num(0)
            .max(config.max_step_tokens / block_manager.block_token_num());
        let mut scratch = Vec::with_capacity(context.tensor_parallel_size());
        for rank in 0..context.tensor_parallel_size() {
            scratch.push(RankScratch::allocate(
                &block_manager,
                rank,
                config,
                shape.num_layers,
                max_blocks,
            )?);
        }

        Ok(Self {
            context,
            block_manager,
            model,
            shape,
            layout,
            max_batch_size: config.max_batch_size,
            max_step_tokens: config.max_step_tokens,
            scratch,
        })
    }

    /// The model dimensions this driver was built against.
    #[must_use]
    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    /// Execute one step over the scheduled batch.
    ///
    /// CONTEXT requests run first, then DECODE requests, each as one
    /// sub-batch across all ranks. Every rank synchronizes its stream at
    /// the sub-batch boundary; joining the workers is the cross-rank
    /// barrier the scheduler relies on before mutating request state.
    ///
    /// # Errors
    /// Returns the first rank failure; the caller fails the whole batch.
    pub fn step(&self, batch: &[StepRequest]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > self.max_batch_size {
            return Err(Error::InvalidArgument(format!(
                "batch of {} exceeds max_batch_size {}",
                batch.len(),
                self.max_batch_size
            )));
        }
        if !self.context.is_serial_execution() {
            return Err(Error::Unimplemented(
                "concurrent context/decode execution",
            ));
        }

        let context_reqs: Vec<&StepRequest> = batch
            .iter()
            .filter(|r| r.stage == InferStage::Context)
            .collect();
        let decode_reqs: Vec<&StepRequest> = batch
            .iter()
            .filter(|r| r.stage == InferStage::Decode)
            .collect();

        for (stage, reqs) in [
            (InferStage::Context, context_reqs),
            (InferStage::Decode, decode_reqs),
        ] {
            if reqs.is_empty() {
                continue;
            }
            tracing::debug!(?stage, batch = reqs.len(), "run sub-batch");
            self.run_sub_batch(stage, &reqs)?;
        }
        Ok(())
    }

    /// Run one sub-batch on every rank in parallel, one worker per rank.
    fn run_sub_batch(&self, stage: InferStage, reqs: &[&StepRequest]) -> Result<()> {
        let world = self.context.tensor_parallel_size();
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..world)
                .map(|rank| scope.spawn(move || self.rank_step(rank, stage, reqs)))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().expect("rank worker panicked"))
                .collect()
        });

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Marshal, upload, forward, and scatter for one rank.
    fn rank_step(&self, rank: usize, stage: InferStage, reqs: &[&StepRequest]) -> Result<()> {
        let device = self.context.device(rank)?;
        device.bind()?;

        let inputs = self.marshal(rank, stage, reqs)?;
        let logits = self.model.forward(rank, &inputs)?;

        let vocab = self.shape.vocab_size;
        if logits.len() != reqs.len() * vocab {
            return Err(Error::Device(format!(
                "rank {rank} returned {} logits for {} requests of vocab {vocab}",
                logits.len(),
                reqs.len()
            )));
        }

        for (idx, req) in reqs.iter().enumerate() {
            let dst = req.logits_buf[rank] + (req.logits_offset * vocab * 4) as u64;
            let row = &logits[idx * vocab..(idx + 1) * vocab];
            device.copy_in(dst, as_bytes(row))?;
        }

        // Step-boundary synchronization on this rank's compute stream.
        device.synchronize()
    }

    /// Build and upload the input tables for one rank.
    fn marshal(&self, rank: usize, stage: InferStage, reqs: &[&StepRequest]) -> Result<StepInputs> {
        let batch_size = reqs.len();

        let mut input_ids = Vec::new();
        let mut input_offsets_u64 = Vec::with_capacity(batch_size + 1);
        let mut seq_lengths = Vec::new();
        let mut rotary_positions = Vec::new();
        let mut kv_cache_offsets = Vec::with_capacity(batch_size + 1);
        let mut block_ptrs = Vec::with_capacity(batch_size);
        let mut max_tokens = 0;

        input_offsets_u64.push(0);
        kv_cache_offsets.push(0);
        let mut total_block_num = 0usize;

        for req in reqs {
            input_ids.extend_from_slice(&req.tokens);
            input_offsets_u64.push(input_ids.len() as u64);
            max_tokens = max_tokens.max(req.seq_len);

            match stage {
                InferStage::Context => {
                    rotary_positions.extend(0..req.seq_len as i64);
                }
                InferStage::Decode => {
                    rotary_positions.push(req.seq_len as i64 - 1);
                    seq_lengths.push(req.seq_len as i32);
                }
            }

            total_block_num += req.kv_block_ids[rank].len();
            kv_cache_offsets.push(total_block_num as i32);
            block_ptrs.push(self.block_manager.get_block_ptrs(rank, &req.kv_block_ids[rank])?);
        }

        if input_ids.len() > self.max_step_tokens {
            return Err(Error::InvalidArgument(format!(
                "step of {} tokens exceeds max_step_tokens {}",
                input_ids.len(),
                self.max_step_tokens
            )));
        }

        let input_offsets_i32: Vec<i32> = input_offsets_u64.iter().map(|&v| v as i32).collect();
        let kv_list = self.layout.build_pointer_table(&block_ptrs);

        let scratch = &self.scratch[rank];
        let device = self.context.device(rank)?;
        let tables = DeviceTables {
            input_ids: scratch.input_ids.upload(device, as_bytes(&input_ids))?,
            input_offsets_i32: scratch
                .input_offsets_i32
                .upload(device, as_bytes(&input_offsets_i32))?,
            input_offsets_u64: scratch
                .input_offsets_u64
                .upload(device, as_bytes(&input_offsets_u64))?,
            seq_lengths: scratch.seq_lengths.upload(device, as_bytes(&seq_lengths))?,
            rotary_positions: scratch
                .rotary_positions
                .upload(device, as_bytes(&rotary_positions))?,
            kv_list: scratch.kv_list.upload(device, as_bytes(&kv_list))?,
            kv_cache_offsets: scratch
                .kv_cache_offsets
                .upload(device, as_bytes(&kv_cache_offsets))?,
        };

        Ok(StepInputs {
            stage,
            batch_size,
            input_ids,
            input_offsets_i32,
            input_offsets_u64,
            seq_lengths,
            rotary_positions,
            kv_list,
            kv_cache_offsets,
            total_block_num,
            max_tokens,
            tables,
        })
    }
}

impl<F: ForwardPass> Drop for StepDriver<F> {
    fn drop(&mut self) {
        for (rank, scratch) in self.scratch.iter().enumerate() {
            scratch.release(&self.block_manager, rank);
        }
    }
}

impl RankScratch {
    fn allocate(
        block_manager: &BlockManager,
        rank: usize,
        config: &SchedulerConfig,
        num_layers: usize,
        max_blocks: usize,
    ) -> Result<Self> {
        let batch_slots = config.max_batch_size + 1;
        Ok(Self {
            input_ids: Scratch::allocate(block_manager, rank, config.max_step_tokens * 4)?,
            input_offsets_i32: Scratch::allocate(block_manager, rank, batch_slots * 4)?,
            input_offsets_u64: Scratch::allocate(block_manager, rank, batch_slots * 8)?,
            seq_lengths: Scratch::allocate(block_manager, rank, batch_slots * 4)?,
            rotary_positions: Scratch::allocate(block_manager, rank, config.max_step_tokens * 8)?,
            kv_list: Scratch::allocate(block_manager, rank, num_layers * max_blocks * 2 * 8)?,
            kv_cache_offsets: Scratch::allocate(block_manager, rank, batch_slots * 4)?,
        })
    }

    fn release(&self, block_manager: &BlockManager, rank: usize) {
        for scratch in [
            &self.input_ids,
            &self.input_offsets_i32,
            &self.input_offsets_u64,
            &self.seq_lengths,
            &self.rotary_positions,
            &self.kv_list,
            &self.kv_cache_offsets,
        ] {
            if let Err(error) = block_manager.free_contiguous(rank, scratch.id) {
                tracing::warn!(rank, %error, "freeing scratch failed");
            }
        }
    }
}

impl Scratch {
    fn allocate(block_manager: &BlockManager, rank: usize, capacity: usize) -> Result<Self> {
        let id = block_manager.allocate_contiguous(rank, capacity)?;
        let addr = block_manager.get_contiguous_ptr(rank, id)?;
        Ok(Self { id, addr, capacity })
    }

    /// Upload `bytes` to this buffer, returning its device address.
    fn upload(&self, device: &Arc<dyn fornax::MemoryDevice>, bytes: &[u8]) -> Result<u64> {
        if bytes.len() > self.capacity {
            return Err(Error::InvalidArgument(format!(
                "upload of {} bytes exceeds scratch capacity {}",
                bytes.len(),
                self.capacity
            )));
        }
        if !bytes.is_empty() {
            device.copy_in(self.addr, bytes)?;
        }
        Ok(self.addr)
    }
}

/// View a slice of plain scalar values as raw bytes.
fn as_bytes<T: Copy>(values: &[T]) -> &[u8] {
    // SAFETY: T is a plain scalar (i32/i64/u64/f32) with no padding; the
    // pointer and length describe exactly the slice's memory.
    unsafe {
        std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use fornax::{AllocatorConfig, BlockManagerConfig, MemoryDevice, MemoryLocation};

    const BLOCK_SIZE: usize = 64;
    const VOCAB: usize = 8;

    /// Records the inputs of every forward call and returns logits whose
    /// argmax is `base_token + rank` for request index 0, 1, ...
    struct RecordingModel {
        calls: Mutex<Vec<StepInputs>>,
    }

    impl RecordingModel {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ForwardPass for RecordingModel {
        fn shape(&self) -> ModelShape {
            ModelShape {
                num_layers: 2,
                vocab_size: VOCAB,
            }
        }

        fn forward(&self, _rank: usize, inputs: &StepInputs) -> Result<Vec<f32>> {
            let batch = inputs.batch_size;
            self.calls.lock().unwrap().push(inputs.clone());
            let mut logits = vec![0.0; batch * VOCAB];
            for idx in 0..batch {
                logits[idx * VOCAB + (idx + 1) % VOCAB] = 1.0;
            }
            Ok(logits)
        }
    }

    fn make_block_manager(tp: usize) -> Arc<BlockManager> {
        let config = BlockManagerConfig {
            host_allocator: AllocatorConfig {
                block_size: BLOCK_SIZE,
                blocks_num: 16,
                block_token_num: 4,
                location: MemoryLocation::Host,
            },
            device_allocator: AllocatorConfig {
                block_size: BLOCK_SIZE,
                blocks_num: 8,
                block_token_num: 4,
                location: MemoryLocation::Device(0),
            },
            reserved_device_memory_ratio: 0.01,
            block_device_memory_ratio: -1.0,
            block_host_memory_factor: 2.0,
            lora_host_memory_factor: 2.0,
        };
        let manager = BlockManager::new(
            config,
            Arc::new(fornax::Context::for_testing(tp)),
        )
        .unwrap();
        manager.pre_allocate_blocks().unwrap();
        Arc::new(manager)
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            max_batch_size: 4,
            max_token_len: 16,
            max_step_tokens: 32,
            max_waiting_queue_len: 8,
        }
    }

    fn make_request(
        block_manager: &BlockManager,
        req_id: u64,
        tp: usize,
        stage: InferStage,
        tokens: Vec<i32>,
        seq_len: usize,
        blocks: usize,
    ) -> StepRequest {
        let mut kv_block_ids = Vec::new();
        let mut logits_buf = Vec::new();
        for rank in 0..tp {
            kv_block_ids.push(block_manager.allocate_blocks(rank, blocks).unwrap());
            let id = block_manager
                .allocate_contiguous(rank, VOCAB * 4)
                .unwrap();
            logits_buf.push(block_manager.get_contiguous_ptr(rank, id).unwrap());
        }
        StepRequest {
            req_id,
            stage,
            tokens,
            seq_len,
            kv_block_ids,
            logits_buf,
            logits_offset: 0,
            sampling: SamplingConfig::default(),
        }
    }

    #[test]
    fn context_batch_marshals_prompt_tables() {
        let block_manager = make_block_manager(1);
        let model = Arc::new(RecordingModel::new());
        let driver =
            StepDriver::new(Arc::clone(&block_manager), Arc::clone(&model), &scheduler_config())
                .unwrap();

        let req_a = make_request(
            &block_manager,
            1,
            1,
            InferStage::Context,
            vec![10, 11, 12, 13, 14],
            5,
            2,
        );
        let req_b = make_request(
            &block_manager,
            2,
            1,
            InferStage::Context,
            vec![20, 21, 22],
            3,
            1,
        );

        driver.step(&[req_a, req_b]).unwrap();

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let inputs = &calls[0];
        assert_eq!(inputs.batch_size, 2);
        assert_eq!(inputs.input_ids, vec![10, 11, 12, 13, 14, 20, 21, 22]);
        assert_eq!(inputs.input_offsets_i32, vec![0, 5, 8]);
        assert_eq!(inputs.input_offsets_u64, vec![0, 5, 8]);
        assert_eq!(inputs.rotary_positions, vec![0, 1, 2, 3, 4, 0, 1, 2]);
        assert_eq!(inputs.kv_cache_offsets, vec![0, 2, 3]);
        assert_eq!(inputs.total_block_num, 3);
        assert_eq!(inputs.max_tokens, 5);
        // [num_layers, 2 * total_block_num] pointer table.
        assert_eq!(inputs.kv_list.len(), 2 * 2 * 3);
        assert!(inputs.seq_lengths.is_empty());
    }

    #[test]
    fn decode_batch_feeds_last_tokens_and_positions() {
        let block_manager = make_block_manager(1);
        let model = Arc::new(RecordingModel::new());
        let driver =
            StepDriver::new(Arc::clone(&block_manager), Arc::clone(&model), &scheduler_config())
                .unwrap();

        let req_a = make_request(
            &block_manager,
            1,
            1,
            InferStage::Decode,
            vec![42],
            6,
            2,
        );
        let req_b = make_request(
            &block_manager,
            2,
            1,
            InferStage::Decode,
            vec![43],
            4,
            1,
        );

        driver.step(&[req_a, req_b]).unwrap();

        let calls = model.calls.lock().unwrap();
        let inputs = &calls[0];
        assert_eq!(inputs.input_ids, vec![42, 43]);
        assert_eq!(inputs.rotary_positions, vec![5, 3]);
        assert_eq!(inputs.seq_lengths, vec![6, 4]);
        assert_eq!(inputs.input_offsets_i32, vec![0, 1, 2]);
    }

    #[test]
    fn mixed_batch_runs_context_then_decode() {
        let block_manager = make_block_manager(1);
        let model = Arc::new(RecordingModel::new());
        let driver =
            StepDriver::new(Arc::clone(&block_manager), Arc::clone(&model), &scheduler_config())
                .unwrap();

        let context_req = make_request(
            &block_manager,
            1,
            1,
            InferStage::Context,
            vec![1, 2],
            2,
            1,
        );
        let decode_req = make_request(
            &block_manager,
            2,
            1,
            InferStage::Decode,
            vec![9],
            5,
            2,
        );

        driver.step(&[decode_req, context_req]).unwrap();

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].stage, InferStage::Context);
        assert_eq!(calls[1].stage, InferStage::Decode);
    }

    #[test]
    fn logits_are_scattered_per_rank() {
        let tp = 2;
        let block_manager = make_block_manager(tp);
        let model = Arc::new(RecordingModel::new());
        let driver =
            StepDriver::new(Arc::clone(&block_manager), Arc::clone(&model), &scheduler_config())
                .unwrap();

        let req = make_request(
            &block_manager,
            1,
            tp,
            InferStage::Context,
            vec![1, 2, 3],
            3,
            1,
        );
        let logits_buf = req.logits_buf.clone();

        driver.step(&[req]).unwrap();

        for rank in 0..tp {
            let device = block_manager.context().device(rank).unwrap();
            let mut bytes = vec![0u8; VOCAB * 4];
            device.copy_out(logits_buf[rank], &mut bytes).unwrap();
            let row: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            // Request index 0 peaks at token 1.
            assert_eq!(row[1], 1.0, "rank {rank} logits row");
            assert_eq!(row[0], 0.0);
        }
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let block_manager = make_block_manager(1);
        let model = Arc::new(RecordingModel::new());
        let config = SchedulerConfig {
            max_batch_size: 1,
            ..scheduler_config()
        };
        let driver =
            StepDriver::new(Arc::clone(&block_manager), Arc::clone(&model), &config).unwrap();

        let reqs: Vec<StepRequest> = (0..2)
            .map(|i| {
                make_request(
                    &block_manager,
                    i,
                    1,
                    InferStage::Decode,
                    vec![1],
                    2,
                    1,
                )
            })
            .collect();

        assert!(matches!(
            driver.step(&reqs),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn failing_model_surfaces_device_error() {
        struct FailingModel;
        impl ForwardPass for FailingModel {
            fn shape(&self) -> ModelShape {
                ModelShape {
                    num_layers: 2,
                    vocab_size: VOCAB,
                }
            }
            fn forward(&self, _rank: usize, _inputs: &StepInputs) -> Result<Vec<f32>> {
                Err(Error::Device("kernel launch failed".into()))
            }
        }

        let block_manager = make_block_manager(1);
        let driver = StepDriver::new(
            Arc::clone(&block_manager),
            Arc::new(FailingModel),
            &scheduler_config(),
        )
        .unwrap();

        let req = make_request(
            &block_manager,
            1,
            1,
            InferStage::Decode,
            vec![1],
            2,
            1,
        );
        assert!(matches!(driver.step(&[req]), Err(Error::Device(_))));
    }
}
