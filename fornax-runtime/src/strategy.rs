//! Scheduling policy
//!
//! The policy is a pure function: it sees immutable per-request views and
//! pool statistics and returns a [`StepPlan`] of queue movements and
//! allocations. The scheduler executes the plan against the block manager.
//! Because allocation success is fully determined by the free-block count,
//! the policy can simulate every allocation exactly, and alternative
//! policies are drop-in replacements.

use fornax::SchedulerConfig;

use crate::request::InferStage;

/// What the policy knows about one request.
#[derive(Debug, Clone)]
pub struct RequestView {
    /// Request id (arrival order).
    pub req_id: u64,
    /// Current phase.
    pub stage: InferStage,
    /// Prompt length in tokens.
    pub prompt_len: usize,
    /// Prompt plus generated tokens.
    pub output_len: usize,
    /// Blocks held per rank: device blocks for running requests, host
    /// blocks for swapped ones, zero for waiting ones.
    pub held_blocks: usize,
}

/// Immutable snapshot of the three scheduler queues.
#[derive(Debug, Clone)]
pub struct QueueView {
    /// Running requests in arrival order (oldest first).
    pub running: Vec<RequestView>,
    /// Waiting requests in arrival order.
    pub waiting: Vec<RequestView>,
    /// Swapped requests in swap order (oldest first).
    pub swapped: Vec<RequestView>,
}

/// Pool statistics the policy plans against.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Free blocks on each device rank (ranks are symmetric).
    pub free_device_blocks: usize,
    /// Free blocks in the host pool.
    pub free_host_blocks: usize,
    /// Total device pool size, free plus used.
    pub total_device_blocks: usize,
    /// Tokens of KV data per block.
    pub block_token_num: usize,
}

/// Queue movements and allocations for one step, in execution order:
/// capacity finishes, swap-outs, grows, swap-ins, admissions.
#[derive(Debug, Clone, Default)]
pub struct StepPlan {
    /// Requests whose demand can never fit the device pool; finish them.
    pub finish_capacity: Vec<u64>,
    /// Running requests to evict to the host.
    pub swap_out: Vec<u64>,
    /// `(req_id, additional_blocks)` for requests staying in running.
    pub grow: Vec<(u64, usize)>,
    /// Swapped requests to bring back to the device.
    pub swap_in: Vec<u64>,
    /// `(req_id, prompt_blocks)` waiting requests to admit.
    pub admit: Vec<(u64, usize)>,
}

impl StepPlan {
    /// Whether the plan moves or allocates anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.finish_capacity.is_empty()
            && self.swap_out.is_empty()
            && self.grow.is_empty()
            && self.swap_in.is_empty()
            && self.admit.is_empty()
    }
}

/// A scheduling policy. Implementations must be pure: same inputs, same
/// plan.
pub trait ScheduleStrategy: Send + Sync {
    /// Plan the next step.
    fn plan(&self, view: &QueueView, pool: &PoolStats, config: &SchedulerConfig) -> StepPlan;
}

/// Continuous batching with swap-based preemption.
///
/// Rules, applied in order:
/// 1. Grow running DECODE requests in arrival order. When the pool is
///    exhausted, evict the newest-arrived running request to the host and
///    retry, so long-lived requests keep their progress.
/// 2. A request whose demand exceeds the whole pool (or that cannot even
///    be parked on the host) is finished as capacity-starved.
/// 3. When nothing was evicted, resume the swapped queue head while blocks
///    and the token budget allow. Swap-out and swap-in never happen in the
///    same step.
/// 4. When the swapped queue is empty, admit waiting requests in arrival
///    order while the batch, budget, and pool allow.
///
/// Budget accounting: a CONTEXT request consumes its prompt length from
/// `max_step_tokens`, a DECODE request consumes one token.
pub struct ContinuousBatching;

impl ScheduleStrategy for ContinuousBatching {
    fn plan(&self, view: &QueueView, pool: &PoolStats, config: &SchedulerConfig) -> StepPlan {
        let mut plan = StepPlan::default();
        let btn = pool.block_token_num;
        let mut free = pool.free_device_blocks;
        let mut free_host = pool.free_host_blocks;

        // Rule 1: keep every surviving running request able to cover its
        // output tokens.
        let mut remaining: Vec<&RequestView> = view.running.iter().collect();
        let mut idx = 0;
        while idx < remaining.len() {
            let req = remaining[idx];
            let required = req.output_len.div_ceil(btn);
            let deficit = required.saturating_sub(req.held_blocks);
            if deficit == 0 {
                idx += 1;
                continue;
            }

            // Evict newest-arrived requests until the deficit is coverable.
            while free < deficit && remaining.len() > idx + 1 {
                let victim = remaining.last().copied().expect("len checked above");
                if free_host < victim.held_blocks {
                    break;
                }
                remaining.pop();
                free += victim.held_blocks;
                free_host -= victim.held_blocks;
                plan.swap_out.push(victim.req_id);
            }

            if free >= deficit {
                free -= deficit;
                plan.grow.push((req.req_id, deficit));
                idx += 1;
                continue;
            }

            // No victims left. The request itself leaves the running queue:
            // starved if it can never fit, otherwise parked on the host.
            remaining.remove(idx);
            if required > pool.total_device_blocks || free_host < req.held_blocks {
                plan.finish_capacity.push(req.req_id);
            } else {
                free += req.held_blocks;
                free_host -= req.held_blocks;
                plan.swap_out.push(req.req_id);
            }
        }

        let mut batch = remaining.len();
        let mut budget: usize = remaining.iter().map(|req| step_cost(req)).sum();

        // Rule 3: resume the swapped queue in order. Skipped entirely in a
        // step that evicted, to avoid ping-ponging blocks.
        let mut resumed = 0;
        if plan.swap_out.is_empty() {
            for req in &view.swapped {
                let required = req.output_len.div_ceil(btn);
                if required > pool.total_device_blocks {
                    // Can never fit, even alone on the device.
                    plan.finish_capacity.push(req.req_id);
                    resumed += 1;
                    continue;
                }
                if batch >= config.max_batch_size
                    || budget + 1 > config.max_step_tokens
                    || free < required
                {
                    break;
                }
                let deficit = required.saturating_sub(req.held_blocks);
                free -= required;
                free_host += req.held_blocks;
                budget += 1;
                batch += 1;
                resumed += 1;
                plan.swap_in.push(req.req_id);
                if deficit > 0 {
                    plan.grow.push((req.req_id, deficit));
                }
            }
        }

        // Rule 4: admit new requests only once nothing is parked, so
        // swapped requests cannot be starved by fresh arrivals.
        if plan.swap_out.is_empty() && resumed == view.swapped.len() {
            for req in &view.waiting {
                let blocks_needed = req.prompt_len.div_ceil(btn).max(1);
                if blocks_needed > pool.total_device_blocks {
                    // A prompt the pool can never hold would block the
                    // queue head forever.
                    plan.finish_capacity.push(req.req_id);
                    continue;
                }
                if batch >= config.max_batch_size
                    || budget + req.prompt_len > config.max_step_tokens
                    || free < blocks_needed
                {
                    break;
                }
                free -= blocks_needed;
                budget += req.prompt_len;
                batch += 1;
                plan.admit.push((req.req_id, blocks_needed));
            }
        }

        plan
    }
}

fn step_cost(req: &RequestView) -> usize {
    match req.stage {
        InferStage::Context => req.output_len,
        InferStage::Decode => 1,
    }
}
