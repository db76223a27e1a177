//! Batch scheduler
//!
//! `schedule()` runs once per step on the driver thread, holding the main
//! queue mutex for the duration: intake from the buffer queue, a finish
//! sweep over running and swapped requests, a strategy plan, and the plan's
//! execution against the block manager. Enqueue-time admission (capacity,
//! then prompt length) rejects requests before they ever reach the queues.

use std::sync::Arc;

use fornax::{BlockManager, Error, Result, SchedulerConfig};

use crate::batch_state::{BatchState, Queues};
use crate::request::{FinishReason, InferRequest, InferStage};
use crate::step::StepRequest;
use crate::strategy::{ContinuousBatching, PoolStats, QueueView, RequestView, ScheduleStrategy};

/// Admission, queue upkeep, and per-step scheduling.
pub struct BatchScheduler {
    config: SchedulerConfig,
    block_manager: Arc<BlockManager>,
    state: BatchState,
    strategy: Box<dyn ScheduleStrategy>,
}

impl BatchScheduler {
    /// Create a scheduler with the default continuous-batching strategy.
    ///
    /// # Errors
    /// Returns `InvalidArgument` on config violations.
    pub fn new(config: SchedulerConfig, block_manager: Arc<BlockManager>) -> Result<Self> {
        Self::with_strategy(config, block_manager, Box::new(ContinuousBatching))
    }

    /// Create a scheduler with a custom strategy.
    ///
    /// # Errors
    /// Returns `InvalidArgument` on config violations.
    pub fn with_strategy(
        config: SchedulerConfig,
        block_manager: Arc<BlockManager>,
        strategy: Box<dyn ScheduleStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            block_manager,
            state: BatchState::new(),
            strategy,
        })
    }

    /// The scheduler's configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Admit a request group into the buffer queue, or reject it.
    ///
    /// The group is admitted or rejected atomically. On rejection every
    /// request is finished with the shared reason and its resources are
    /// released, so the client still observes exactly one notification.
    ///
    /// # Errors
    /// Returns `ExceedCapacity` when the waiting queue is full and
    /// `ExceedLength` when the prompt exceeds `max_token_len`.
    pub fn add_infer_request(&self, mut group: Vec<InferRequest>) -> Result<()> {
        let head = group
            .first()
            .ok_or_else(|| Error::InvalidArgument("empty request group".into()))?;
        let req_id = head.req_id;
        let prompt_len = head.input_tokens.len();
        tracing::debug!(
            req_id,
            prompt_len,
            max_new_tokens = head.sampling.max_new_tokens,
            "add infer request"
        );

        if prompt_len == 0 {
            let error = Error::InvalidArgument("empty prompt".into());
            self.reject_group(&mut group, None, Some("empty prompt"));
            return Err(error);
        }

        if self.state.pending_len() + group.len() > self.config.max_waiting_queue_len {
            tracing::debug!(req_id, "waiting queue is full");
            self.reject_group(&mut group, Some(FinishReason::Capacity), None);
            return Err(Error::ExceedCapacity("waiting queue is full".into()));
        }

        if prompt_len > self.config.max_token_len {
            tracing::debug!(req_id, prompt_len, "input is too long");
            self.reject_group(&mut group, Some(FinishReason::Length), None);
            return Err(Error::ExceedLength {
                len: prompt_len,
                max: self.config.max_token_len,
            });
        }

        self.state.push_buffer(group);
        Ok(())
    }

    /// Run one scheduling pass and snapshot the running queue for the step
    /// driver. An empty result means there is nothing to execute.
    ///
    /// # Errors
    /// Returns block-manager failures that the strategy could not have
    /// predicted (these indicate a bug or a failing device).
    pub fn schedule(&self) -> Result<Vec<StepRequest>> {
        let mut queues = self.state.lock_queues();
        self.state.drain_buffer_into(&mut queues);

        self.sweep_finished(&mut queues);

        let view = build_view(&queues);
        let pool = PoolStats {
            free_device_blocks: self.block_manager.free_block_num(0),
            free_host_blocks: self.block_manager.host_free_block_num(),
            total_device_blocks: self.block_manager.total_block_num(0),
            block_token_num: self.block_manager.block_token_num(),
        };
        let plan = self.strategy.plan(&view, &pool, &self.config);
        self.apply_plan(&mut queues, plan)?;

        tracing::debug!(
            running = queues.running.len(),
            waiting = queues.waiting.len(),
            swapped = queues.swapped.len(),
            free_blocks = self.block_manager.free_block_num(0),
            used_blocks = self.block_manager.used_block_num(0),
            "schedule result"
        );

        Ok(queues.running.iter().map(StepRequest::snapshot).collect())
    }

    /// Apply sampled tokens between steps: append to `output_tokens`,
    /// stream to the client, and advance CONTEXT requests into DECODE.
    /// Stop tokens are recorded but not streamed; the finish sweep turns
    /// them into an `Eos` notification on the next pass.
    pub fn commit_step(&self, sampled: &[(u64, i32)]) {
        let mut queues = self.state.lock_queues();
        for &(req_id, token) in sampled {
            let Some(req) = queues.running.iter_mut().find(|r| r.req_id == req_id) else {
                continue;
            };
            req.output_tokens.push(token);
            if !req.sampling.stop_token_ids.contains(&token) {
                req.send_token(token);
            }
            match req.stage {
                InferStage::Context => req.stage = InferStage::Decode,
                InferStage::Decode => req.step += 1,
            }
        }
    }

    /// Fail every running request after a step error. The batch is gone;
    /// the queues and pools stay consistent for the next schedule.
    pub fn fail_running(&self, message: &str) {
        let mut queues = self.state.lock_queues();
        let failed: Vec<InferRequest> = queues.running.drain(..).collect();
        for mut req in failed {
            self.release_resources(&mut req);
            req.finish_with_error(Error::Device(message.to_string()));
        }
    }

    /// Finish every request still owned by any queue with `Stopped`.
    /// Called once after the driver loop exits.
    pub fn drain_on_stop(&self) {
        for mut req in self.state.drain_all() {
            self.release_resources(&mut req);
            req.finish(FinishReason::Stopped);
        }
    }

    /// Number of requests awaiting admission (buffer plus waiting queue).
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.pending_len()
    }

    /// Whether all queues are empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.pending_len() == 0 && self.state.lock_queues().is_idle()
    }

    /// The shared block manager.
    #[must_use]
    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.block_manager
    }

    fn reject_group(
        &self,
        group: &mut [InferRequest],
        reason: Option<FinishReason>,
        error: Option<&str>,
    ) {
        for req in group {
            self.release_resources(req);
            match (reason, error) {
                (Some(reason), _) => req.finish(reason),
                (None, Some(message)) => {
                    req.finish_with_error(Error::InvalidArgument(message.into()));
                }
                (None, None) => req.finish(FinishReason::Error),
            }
        }
    }

    /// Terminal-condition sweep over the running and swapped queues.
    fn sweep_finished(&self, queues: &mut Queues) {
        for idx in (0..queues.running.len()).rev() {
            let req = &queues.running[idx];
            let reason = if req.abandoned {
                Some(FinishReason::Stopped)
            } else if req.generated_len() >= req.sampling.max_new_tokens {
                Some(FinishReason::Length)
            } else if req.generated_len() > 0
                && req
                    .output_tokens
                    .last()
                    .is_some_and(|t| req.sampling.stop_token_ids.contains(t))
            {
                Some(FinishReason::Eos)
            } else {
                None
            };

            if let Some(reason) = reason {
                let mut req = queues.running.remove(idx);
                tracing::debug!(req_id = req.req_id, ?reason, "request finished");
                self.release_resources(&mut req);
                req.finish(reason);
            }
        }

        // Swapped requests only leave early when the client went away.
        for idx in (0..queues.swapped.len()).rev() {
            if queues.swapped[idx].abandoned {
                let mut req = queues.swapped.remove(idx).expect("index in range");
                self.release_resources(&mut req);
                req.finish(FinishReason::Stopped);
            }
        }
    }

    /// Execute a strategy plan: capacity finishes, then swap-outs, then
    /// swap-ins, then grows, then admissions. Grows run after swap-ins so
    /// resumed requests are back in the running queue when they grow.
    fn apply_plan(&self, queues: &mut Queues, plan: crate::strategy::StepPlan) -> Result<()> {
        let tp = self.block_manager.context().tensor_parallel_size();

        for req_id in plan.finish_capacity {
            let mut req = if let Some(idx) =
                queues.running.iter().position(|r| r.req_id == req_id)
            {
                queues.running.remove(idx)
            } else if let Some(idx) = queues.swapped.iter().position(|r| r.req_id == req_id) {
                queues.swapped.remove(idx).expect("index in range")
            } else if let Some(idx) = queues.waiting.iter().position(|r| r.req_id == req_id) {
                queues.waiting.remove(idx).expect("index in range")
            } else {
                continue;
            };
            tracing::warn!(req_id, "request starved for capacity");
            self.release_resources(&mut req);
            req.finish(FinishReason::Capacity);
        }

        for req_id in plan.swap_out {
            let Some(idx) = queues.running.iter().position(|r| r.req_id == req_id) else {
                continue;
            };
            let mut req = queues.running.remove(idx);
            for rank in 0..tp {
                let host_ids = self
                    .block_manager
                    .swap_out(rank, &req.kv_cache_blocks[rank])?;
                req.host_blocks[rank] = host_ids;
                req.kv_cache_blocks[rank].clear();
            }
            queues.swapped.push_back(req);
        }

        for req_id in plan.swap_in {
            let Some(idx) = queues.swapped.iter().position(|r| r.req_id == req_id) else {
                continue;
            };
            let mut req = queues.swapped.remove(idx).expect("index in range");
            for rank in 0..tp {
                let device_ids = self.block_manager.swap_in(rank, &req.host_blocks[rank])?;
                req.kv_cache_blocks[rank] = device_ids;
                req.host_blocks[rank].clear();
            }
            queues.running.push(req);
        }

        for (req_id, additional) in plan.grow {
            let Some(req) = queues.running.iter_mut().find(|r| r.req_id == req_id) else {
                continue;
            };
            for rank in 0..tp {
                let mut ids = self.block_manager.allocate_blocks(rank, additional)?;
                req.kv_cache_blocks[rank].append(&mut ids);
            }
        }

        for (req_id, blocks_needed) in plan.admit {
            let Some(idx) = queues.waiting.iter().position(|r| r.req_id == req_id) else {
                continue;
            };
            let mut req = queues.waiting.remove(idx).expect("index in range");
            for rank in 0..tp {
                req.kv_cache_blocks[rank] = self.block_manager.allocate_blocks(rank, blocks_needed)?;
            }
            req.stage = InferStage::Context;
            queues.running.push(req);
        }

        Ok(())
    }

    /// Free everything a request holds: device blocks on every rank, host
    /// blocks if swapped, and its logits buffers.
    fn release_resources(&self, req: &mut InferRequest) {
        for (rank, blocks) in req.kv_cache_blocks.iter_mut().enumerate() {
            if !blocks.is_empty() {
                if let Err(error) = self.block_manager.free_blocks(rank, blocks) {
                    tracing::warn!(req_id = req.req_id, rank, %error, "freeing blocks failed");
                }
                blocks.clear();
            }
        }
        for blocks in &mut req.host_blocks {
            if !blocks.is_empty() {
                if let Err(error) = self.block_manager.swap_drop(blocks) {
                    tracing::warn!(req_id = req.req_id, %error, "dropping host blocks failed");
                }
                blocks.clear();
            }
        }
        for (rank, id) in req.logits_block_ids.drain(..).enumerate() {
            if let Err(error) = self.block_manager.free_contiguous(rank, id) {
                tracing::warn!(req_id = req.req_id, rank, %error, "freeing logits failed");
            }
        }
    }
}

fn build_view(queues: &Queues) -> QueueView {
    QueueView {
        running: queues.running.iter().map(running_view).collect(),
        waiting: queues.waiting.iter().map(running_view).collect(),
        swapped: queues
            .swapped
            .iter()
            .map(|req| RequestView {
                held_blocks: req.host_blocks_per_rank(),
                ..running_view(req)
            })
            .collect(),
    }
}

fn running_view(req: &InferRequest) -> RequestView {
    RequestView {
        req_id: req.req_id,
        stage: req.stage,
        prompt_len: req.input_tokens.len(),
        output_len: req.output_tokens.len(),
        held_blocks: req.blocks_per_rank(),
    }
}
