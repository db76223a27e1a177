//! Batch manager
//!
//! Top-level driver: owns the scheduler and the step driver, runs the
//! schedule/step loop on a dedicated thread, and exposes `enqueue`,
//! `start`, and `stop`. Between steps it reads each request's rank-0
//! logits, asks the [`Sampler`] for the next token, and commits the
//! results back into the queues before re-entering `schedule()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use fornax::{BlockManager, Error, Result, SchedulerConfig};

use crate::request::{GenerationEvent, InferRequest, Request, SamplingConfig};
use crate::scheduler::BatchScheduler;
use crate::step::{ForwardPass, StepDriver, StepRequest};
use crate::waiter::Waiter;

/// Token selection from a logits row. External to the core: the driver
/// hands it the request's sampling parameters and rank-0 logits.
pub trait Sampler: Send + Sync {
    /// Pick the next token id.
    fn sample(&self, sampling: &SamplingConfig, logits: &[f32]) -> i32;
}

/// Argmax selection. Ignores temperature and nucleus parameters; useful
/// for tests and as the deterministic fallback.
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&self, _sampling: &SamplingConfig, logits: &[f32]) -> i32 {
        let mut best = 0;
        let mut best_value = f32::NEG_INFINITY;
        for (idx, &value) in logits.iter().enumerate() {
            if value > best_value {
                best = idx;
                best_value = value;
            }
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        {
            best as i32
        }
    }
}

/// Owns the driver thread plus everything it runs.
pub struct BatchManager<F: ForwardPass> {
    scheduler: Arc<BatchScheduler>,
    block_manager: Arc<BlockManager>,
    waiter: Arc<Waiter>,
    terminated: Arc<AtomicBool>,
    sampler: Arc<dyn Sampler>,
    vocab_size: usize,
    step_driver: Mutex<Option<StepDriver<F>>>,
    driver_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ForwardPass + 'static> BatchManager<F> {
    /// Build the scheduler and step driver for `model`.
    ///
    /// # Errors
    /// Returns config validation and scratch allocation failures.
    pub fn new(
        config: SchedulerConfig,
        block_manager: Arc<BlockManager>,
        model: Arc<F>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        let vocab_size = model.shape().vocab_size;
        let scheduler = Arc::new(BatchScheduler::new(config.clone(), Arc::clone(&block_manager))?);
        let step_driver = StepDriver::new(Arc::clone(&block_manager), model, &config)?;

        Ok(Self {
            scheduler,
            block_manager,
            waiter: Arc::new(Waiter::new()),
            terminated: Arc::new(AtomicBool::new(false)),
            sampler,
            vocab_size,
            step_driver: Mutex::new(Some(step_driver)),
            driver_thread: Mutex::new(None),
        })
    }

    /// Submit a request. Returns the event receiver: zero or more tokens,
    /// then exactly one terminal event.
    ///
    /// # Errors
    /// Returns `ExceedCapacity` or `ExceedLength` on admission rejection,
    /// or an allocation failure for the request's logits buffers.
    pub fn enqueue(&self, request: Request) -> Result<Receiver<GenerationEvent>> {
        let req_id = request.req_id;
        tracing::debug!(req_id, "batch manager enqueue");

        let tensor_para_size = self.block_manager.context().tensor_parallel_size();
        let (tx, rx) = mpsc::channel();
        let mut infer_req = InferRequest::new(
            request,
            tensor_para_size,
            self.block_manager.block_size(),
            Box::new(tx),
        );

        // One logits row per rank, outside the block pool.
        for rank in 0..tensor_para_size {
            match self.allocate_logits(rank) {
                Ok((id, addr)) => {
                    infer_req.logits_block_ids.push(id);
                    infer_req.logits_buf[rank] = addr;
                }
                Err(error) => {
                    for (prev_rank, id) in infer_req.logits_block_ids.drain(..).enumerate() {
                        let _ = self.block_manager.free_contiguous(prev_rank, id);
                    }
                    return Err(error);
                }
            }
        }

        self.scheduler.add_infer_request(vec![infer_req])?;
        tracing::debug!(req_id, "request admitted");

        self.waiter.notify();
        Ok(rx)
    }

    /// Spawn the driver thread.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the manager was already started.
    pub fn start(&self) -> Result<()> {
        let step_driver = self
            .step_driver
            .lock()
            .expect("step driver mutex poisoned")
            .take()
            .ok_or_else(|| Error::InvalidArgument("batch manager already started".into()))?;

        let scheduler = Arc::clone(&self.scheduler);
        let block_manager = Arc::clone(&self.block_manager);
        let waiter = Arc::clone(&self.waiter);
        let terminated = Arc::clone(&self.terminated);
        let sampler = Arc::clone(&self.sampler);
        let vocab_size = self.vocab_size;

        let handle = thread::spawn(move || {
            driver_loop(
                &scheduler,
                &block_manager,
                &step_driver,
                sampler.as_ref(),
                &waiter,
                &terminated,
                vocab_size,
            );
        });
        *self.driver_thread.lock().expect("driver mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the driver: finish the in-flight step, join the thread, and
    /// notify every remaining request with `Stopped`.
    pub fn stop(&self) {
        tracing::debug!("stop batch manager");
        self.terminated.store(true, Ordering::Release);
        self.waiter.notify();

        let handle = self
            .driver_thread
            .lock()
            .expect("driver mutex poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("driver thread panicked");
            }
        } else {
            // Never started: the loop's exit drain never ran.
            self.scheduler.drain_on_stop();
        }
        tracing::debug!("batch manager stopped");
    }

    /// The shared scheduler (for tests and metrics).
    #[must_use]
    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    fn allocate_logits(&self, rank: usize) -> Result<(fornax::BlockId, u64)> {
        let id = self
            .block_manager
            .allocate_contiguous(rank, self.vocab_size * 4)?;
        let addr = self.block_manager.get_contiguous_ptr(rank, id)?;
        Ok((id, addr))
    }
}

/// The schedule/step loop. Exits when `terminated` is set, then drains the
/// queues so every client still gets its terminal notification.
fn driver_loop<F: ForwardPass>(
    scheduler: &BatchScheduler,
    block_manager: &BlockManager,
    step_driver: &StepDriver<F>,
    sampler: &dyn Sampler,
    waiter: &Waiter,
    terminated: &AtomicBool,
    vocab_size: usize,
) {
    while !terminated.load(Ordering::Acquire) {
        let batch = match scheduler.schedule() {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(%error, "schedule failed");
                scheduler.fail_running(&error.to_string());
                continue;
            }
        };

        if batch.is_empty() {
            waiter.wait();
            continue;
        }
        tracing::debug!(batch = batch.len(), "batch scheduler result");

        if let Err(error) = step_driver.step(&batch) {
            tracing::error!(%error, "step failed, failing batch");
            scheduler.fail_running(&error.to_string());
            continue;
        }

        match sample_batch(block_manager, sampler, &batch, vocab_size) {
            Ok(sampled) => scheduler.commit_step(&sampled),
            Err(error) => {
                tracing::error!(%error, "sampling failed, failing batch");
                scheduler.fail_running(&error.to_string());
            }
        }
    }

    scheduler.drain_on_stop();
}

/// Read each request's rank-0 logits row and pick its next token.
fn sample_batch(
    block_manager: &BlockManager,
    sampler: &dyn Sampler,
    batch: &[StepRequest],
    vocab_size: usize,
) -> Result<Vec<(u64, i32)>> {
    let device = block_manager.context().device(0)?;
    let mut sampled = Vec::with_capacity(batch.len());
    let mut bytes = vec![0u8; vocab_size * 4];

    for req in batch {
        let src = req.logits_buf[0] + (req.logits_offset * vocab_size * 4) as u64;
        device.copy_out(src, &mut bytes)?;
        let row: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        sampled.push((req.req_id, sampler.sample(&req.sampling, &row)));
    }
    Ok(sampled)
}
