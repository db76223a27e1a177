//! End-to-end tests for the batching runtime.
//!
//! A deterministic counting model stands in for the transformer: the logits
//! row of every request peaks at `(last fed token + 1) % vocab`, so greedy
//! sampling generates consecutive token ids and every scenario's output is
//! predictable. The model also checks the KV invariant on every call: a
//! request's block table must cover its sequence.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use fornax::{
    AllocatorConfig, BlockManager, BlockManagerConfig, Context, Error, MemoryLocation, Result,
    SchedulerConfig,
};
use fornax_runtime::{
    BatchManager, FinishReason, ForwardPass, GenerationEvent, GreedySampler, InferStage,
    ModelShape, Request, SamplingConfig, StepInputs,
};

const VOCAB: usize = 32;
const NUM_LAYERS: usize = 2;
const BLOCK_SIZE: usize = 64;
const BLOCK_TOKEN_NUM: usize = 4;

/// Deterministic stand-in for the transformer forward pass.
struct CountingModel {
    /// Per-forward delay, so shutdown tests can interrupt mid-generation.
    delay: Duration,
}

impl CountingModel {
    fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    fn throttled() -> Self {
        Self {
            delay: Duration::from_millis(5),
        }
    }
}

impl ForwardPass for CountingModel {
    fn shape(&self) -> ModelShape {
        ModelShape {
            num_layers: NUM_LAYERS,
            vocab_size: VOCAB,
        }
    }

    fn forward(&self, _rank: usize, inputs: &StepInputs) -> Result<Vec<f32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut logits = vec![0.0_f32; inputs.batch_size * VOCAB];
        for idx in 0..inputs.batch_size {
            let start = inputs.input_offsets_u64[idx] as usize;
            let end = inputs.input_offsets_u64[idx + 1] as usize;

            // Every scheduled request must hold enough blocks for its
            // sequence; a violation here means the scheduler broke the
            // KV invariant.
            let blocks =
                (inputs.kv_cache_offsets[idx + 1] - inputs.kv_cache_offsets[idx]) as usize;
            let seq_len = match inputs.stage {
                InferStage::Context => end - start,
                InferStage::Decode => inputs.seq_lengths[idx] as usize,
            };
            if blocks * BLOCK_TOKEN_NUM < seq_len {
                return Err(Error::Device(format!(
                    "request {idx} has {blocks} blocks for {seq_len} tokens"
                )));
            }

            let last = inputs.input_ids[end - 1];
            let next = (last + 1).rem_euclid(VOCAB as i32) as usize;
            logits[idx * VOCAB + next] = 1.0;
        }
        Ok(logits)
    }
}

fn make_manager(
    tensor_para_size: usize,
    device_blocks: usize,
    host_blocks: usize,
    scheduler: SchedulerConfig,
) -> BatchManager<CountingModel> {
    make_manager_with_model(
        tensor_para_size,
        device_blocks,
        host_blocks,
        scheduler,
        CountingModel::instant(),
    )
}

fn make_manager_with_model(
    tensor_para_size: usize,
    device_blocks: usize,
    host_blocks: usize,
    scheduler: SchedulerConfig,
    model: CountingModel,
) -> BatchManager<CountingModel> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = BlockManagerConfig {
        host_allocator: AllocatorConfig {
            block_size: BLOCK_SIZE,
            blocks_num: host_blocks,
            block_token_num: BLOCK_TOKEN_NUM,
            location: MemoryLocation::Host,
        },
        device_allocator: AllocatorConfig {
            block_size: BLOCK_SIZE,
            blocks_num: device_blocks,
            block_token_num: BLOCK_TOKEN_NUM,
            location: MemoryLocation::Device(0),
        },
        reserved_device_memory_ratio: 0.01,
        block_device_memory_ratio: -1.0,
        block_host_memory_factor: 2.0,
        lora_host_memory_factor: 2.0,
    };
    let context = Arc::new(Context::for_testing(tensor_para_size));
    let block_manager = Arc::new(BlockManager::new(config, context).unwrap());
    block_manager.pre_allocate_blocks().unwrap();

    BatchManager::new(
        scheduler,
        block_manager,
        Arc::new(model),
        Arc::new(GreedySampler),
    )
    .unwrap()
}

fn default_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_batch_size: 8,
        max_token_len: 8,
        max_step_tokens: 64,
        max_waiting_queue_len: 16,
    }
}

fn request(req_id: u64, prompt: Vec<i32>, max_new_tokens: usize) -> Request {
    Request {
        req_id,
        model_name: "counting".into(),
        input_tokens: prompt,
        sampling: SamplingConfig {
            max_new_tokens,
            ..SamplingConfig::default()
        },
    }
}

/// Collect events until the terminal one, with a hang guard.
fn collect(rx: &Receiver<GenerationEvent>) -> (Vec<i32>, FinishReason) {
    let mut tokens = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(GenerationEvent::Token(id)) => tokens.push(id),
            Ok(GenerationEvent::Finished(reason)) => return (tokens, reason),
            Ok(GenerationEvent::Error(error)) => panic!("generation error: {error}"),
            Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for events"),
            Err(RecvTimeoutError::Disconnected) => panic!("channel closed without terminal event"),
        }
    }
}

/// Assert that nothing further arrives after the terminal event.
fn assert_no_more_events(rx: &Receiver<GenerationEvent>) {
    match rx.recv_timeout(Duration::from_millis(100)) {
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        Ok(_) => panic!("received an event after the terminal notification"),
    }
}

// ---------------------------------------------------------------------------
// Scenario: single request, no memory pressure
// ---------------------------------------------------------------------------

#[test]
fn single_request_generates_and_notifies_once() {
    let manager = make_manager(1, 8, 16, default_scheduler_config());
    manager.start().unwrap();

    let rx = manager.enqueue(request(1, vec![1, 2, 3, 4], 2)).unwrap();
    let (tokens, reason) = collect(&rx);

    // Counting model: last prompt token 4 → 5, then 6.
    assert_eq!(tokens, vec![5, 6]);
    assert_eq!(reason, FinishReason::Length);
    assert_no_more_events(&rx);

    manager.stop();

    // All blocks returned to the pool.
    let block_manager = manager.scheduler().block_manager();
    assert_eq!(block_manager.free_block_num(0), 8);
    assert_eq!(block_manager.host_free_block_num(), 16);
}

// ---------------------------------------------------------------------------
// Scenario: admission rejection by prompt length
// ---------------------------------------------------------------------------

#[test]
fn over_length_prompt_is_rejected_without_allocation() {
    let config = SchedulerConfig {
        max_token_len: 4,
        ..default_scheduler_config()
    };
    let manager = make_manager(1, 8, 16, config);

    let err = manager
        .enqueue(request(1, vec![1, 2, 3, 4, 5], 4))
        .unwrap_err();
    assert!(matches!(err, Error::ExceedLength { len: 5, max: 4 }));

    let block_manager = manager.scheduler().block_manager();
    assert_eq!(block_manager.free_block_num(0), 8);
    assert!(manager.scheduler().is_idle());

    // A prompt of exactly max_token_len is accepted.
    manager.start().unwrap();
    let rx = manager.enqueue(request(2, vec![1, 2, 3, 4], 1)).unwrap();
    let (tokens, reason) = collect(&rx);
    assert_eq!(tokens, vec![5]);
    assert_eq!(reason, FinishReason::Length);
    manager.stop();
}

// ---------------------------------------------------------------------------
// Scenario: admission rejection by queue capacity
// ---------------------------------------------------------------------------

#[test]
fn full_waiting_queue_rejects_with_capacity() {
    let config = SchedulerConfig {
        max_waiting_queue_len: 2,
        ..default_scheduler_config()
    };
    let manager = make_manager(1, 8, 16, config);

    // Driver not started yet, so the first two stay queued.
    let rx1 = manager.enqueue(request(1, vec![1, 2], 1)).unwrap();
    let rx2 = manager.enqueue(request(2, vec![3, 4], 1)).unwrap();

    let err = manager.enqueue(request(3, vec![5, 6], 1)).unwrap_err();
    assert!(matches!(err, Error::ExceedCapacity(_)));

    // The first two proceed once the driver runs.
    manager.start().unwrap();
    let (tokens1, reason1) = collect(&rx1);
    let (tokens2, reason2) = collect(&rx2);
    assert_eq!(tokens1, vec![3]);
    assert_eq!(tokens2, vec![5]);
    assert_eq!(reason1, FinishReason::Length);
    assert_eq!(reason2, FinishReason::Length);
    manager.stop();
}

// ---------------------------------------------------------------------------
// Scenario: stop tokens end generation early
// ---------------------------------------------------------------------------

#[test]
fn stop_token_finishes_with_eos() {
    let manager = make_manager(1, 8, 16, default_scheduler_config());
    manager.start().unwrap();

    let rx = manager
        .enqueue(Request {
            req_id: 1,
            model_name: "counting".into(),
            input_tokens: vec![7],
            sampling: SamplingConfig {
                max_new_tokens: 100,
                stop_token_ids: vec![10],
                ..SamplingConfig::default()
            },
        })
        .unwrap();

    // 7 → 8, 9, then 10 which is the stop token (recorded, not streamed).
    let (tokens, reason) = collect(&rx);
    assert_eq!(tokens, vec![8, 9]);
    assert_eq!(reason, FinishReason::Eos);
    assert_no_more_events(&rx);
    manager.stop();
}

// ---------------------------------------------------------------------------
// Scenario: swap-induced preemption under memory pressure
// ---------------------------------------------------------------------------

#[test]
fn preemption_completes_older_request_first() {
    // Two 8-token prompts on a 4-block pool: both fit at admission
    // (2 blocks each), but the first growth forces the newer request out.
    let config = SchedulerConfig {
        max_batch_size: 8,
        max_token_len: 8,
        max_step_tokens: 64,
        max_waiting_queue_len: 16,
    };
    let manager = make_manager(1, 4, 8, config);
    manager.start().unwrap();

    let prompt1: Vec<i32> = (0..8).collect();
    let prompt2: Vec<i32> = (10..18).collect();
    let rx1 = manager.enqueue(request(1, prompt1, 8)).unwrap();
    let rx2 = manager.enqueue(request(2, prompt2, 8)).unwrap();

    let (tokens1, reason1) = collect(&rx1);
    let (tokens2, reason2) = collect(&rx2);

    // Both complete despite the pool holding only half their total demand.
    assert_eq!(tokens1, (8..16).collect::<Vec<i32>>());
    assert_eq!(tokens2, (18..26).collect::<Vec<i32>>());
    assert_eq!(reason1, FinishReason::Length);
    assert_eq!(reason2, FinishReason::Length);

    manager.stop();
    let block_manager = manager.scheduler().block_manager();
    assert_eq!(block_manager.free_block_num(0), 4);
    assert_eq!(block_manager.host_free_block_num(), 8);
}

// ---------------------------------------------------------------------------
// Scenario: clean shutdown mid-generation
// ---------------------------------------------------------------------------

#[test]
fn stop_mid_generation_notifies_stopped() {
    // A throttled model and a deep pool keep the request in flight until
    // stop() lands.
    let manager = make_manager_with_model(
        1,
        64,
        128,
        default_scheduler_config(),
        CountingModel::throttled(),
    );
    manager.start().unwrap();

    let rx = manager.enqueue(request(1, vec![1, 2], 10_000)).unwrap();

    // Wait until generation is demonstrably in flight.
    let first = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(first, GenerationEvent::Token(_)));

    manager.stop();

    // Drain: some more tokens may have landed, then exactly one Stopped.
    let mut terminal = None;
    for event in rx.try_iter() {
        match event {
            GenerationEvent::Token(_) => {}
            GenerationEvent::Finished(reason) => {
                assert!(terminal.is_none(), "second terminal event");
                terminal = Some(reason);
            }
            GenerationEvent::Error(error) => panic!("unexpected error: {error}"),
        }
    }
    assert_eq!(terminal, Some(FinishReason::Stopped));

    let block_manager = manager.scheduler().block_manager();
    assert_eq!(block_manager.free_block_num(0), 64);
}

// ---------------------------------------------------------------------------
// Scenario: tensor-parallel ranks stay in lock-step
// ---------------------------------------------------------------------------

#[test]
fn two_rank_generation_matches_single_rank() {
    let single = make_manager(1, 8, 16, default_scheduler_config());
    single.start().unwrap();
    let rx = single.enqueue(request(1, vec![1, 2, 3], 4)).unwrap();
    let (expected, _) = collect(&rx);
    single.stop();

    let parallel = make_manager(2, 8, 16, default_scheduler_config());
    parallel.start().unwrap();
    let rx = parallel.enqueue(request(1, vec![1, 2, 3], 4)).unwrap();
    let (tokens, reason) = collect(&rx);
    parallel.stop();

    assert_eq!(tokens, expected);
    assert_eq!(reason, FinishReason::Length);

    // Both ranks' pools are fully released.
    let block_manager = parallel.scheduler().block_manager();
    assert_eq!(block_manager.free_block_num(0), 8);
    assert_eq!(block_manager.free_block_num(1), 8);
}

// ---------------------------------------------------------------------------
// Scenario: many concurrent requests share the device
// ---------------------------------------------------------------------------

#[test]
fn concurrent_requests_all_complete() {
    let manager = make_manager(1, 32, 64, default_scheduler_config());
    manager.start().unwrap();

    let receivers: Vec<(i32, Receiver<GenerationEvent>)> = (0..6)
        .map(|i| {
            let base = i * 3;
            let rx = manager
                .enqueue(request(u64::from(i as u32), vec![base, base + 1], 3))
                .unwrap();
            (base + 1, rx)
        })
        .collect();

    for (last_prompt_token, rx) in receivers {
        let (tokens, reason) = collect(&rx);
        assert_eq!(
            tokens,
            vec![
                last_prompt_token + 1,
                last_prompt_token + 2,
                last_prompt_token + 3
            ]
        );
        assert_eq!(reason, FinishReason::Length);
    }
    manager.stop();

    let block_manager = manager.scheduler().block_manager();
    assert_eq!(block_manager.free_block_num(0), 32);
}
