//! Request types and client notification
//!
//! A client [`Request`] is wrapped into an [`InferRequest`] at enqueue and
//! owned by the scheduler's queues from then on. Generation results flow
//! back through a single channel per request, so ordering is guaranteed:
//! zero or more [`GenerationEvent::Token`]s, then exactly one terminal
//! event ([`GenerationEvent::Finished`] or [`GenerationEvent::Error`]).

use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use fornax::{BlockId, Error};

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was produced.
    Eos,
    /// Reached `max_new_tokens`.
    Length,
    /// Rejected or starved for capacity.
    Capacity,
    /// A step failed; the request was aborted.
    Error,
    /// The server stopped or the client went away mid-generation.
    Stopped,
}

/// Phase of a request's forward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferStage {
    /// Prompt prefill: one pass over all prompt tokens.
    Context,
    /// Per-token generation.
    Decode,
}

/// Sampling parameters carried by a request.
///
/// Token selection itself is external to this crate (see
/// [`Sampler`](crate::Sampler)); the scheduler only reads
/// `max_new_tokens` and `stop_token_ids` for termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: usize,
    /// Temperature for logit scaling.
    pub temperature: f32,
    /// Top-k cutoff; 0 disables it.
    pub top_k: usize,
    /// Nucleus probability threshold in (0, 1].
    pub top_p: f32,
    /// Token ids that terminate generation.
    pub stop_token_ids: Vec<i32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            temperature: 0.7,
            top_k: 0,
            top_p: 0.9,
            stop_token_ids: Vec::new(),
        }
    }
}

/// A client-facing generation request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Monotonic request id; also the arrival-order tie-break key.
    pub req_id: u64,
    /// Which registered model serves this request.
    pub model_name: String,
    /// Prompt token ids.
    pub input_tokens: Vec<i32>,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
}

/// An event produced by the engine during generation.
pub enum GenerationEvent {
    /// A newly generated token.
    Token(i32),
    /// An error occurred; terminal.
    Error(Error),
    /// Generation completed with the given reason; terminal.
    Finished(FinishReason),
}

/// Trait for sending generation events back to the caller.
///
/// Abstracted so callers can provide either a sync or async sender.
/// Return `false` to signal that the receiver has been dropped and the
/// request should be reaped.
pub trait TokenSender: Send {
    /// Send a generation event to the receiver.
    fn send(&self, event: GenerationEvent) -> bool;
}

impl TokenSender for mpsc::Sender<GenerationEvent> {
    fn send(&self, event: GenerationEvent) -> bool {
        mpsc::Sender::send(self, event).is_ok()
    }
}

impl TokenSender for Box<dyn TokenSender> {
    fn send(&self, event: GenerationEvent) -> bool {
        (**self).send(event)
    }
}

/// Per-request state owned by the scheduler's queues.
pub struct InferRequest {
    /// Unique, monotonically assigned id.
    pub req_id: u64,
    /// Which registered model serves this request.
    pub model_name: String,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
    /// Original prompt.
    pub input_tokens: Vec<i32>,
    /// Prompt plus everything generated so far. Mutated only between steps.
    pub output_tokens: Vec<i32>,
    /// Current phase.
    pub stage: InferStage,
    /// Number of DECODE iterations executed.
    pub step: usize,
    /// Bytes per KV block, copied from the block manager at enqueue.
    pub block_size: usize,
    /// Device KV block ids, one list per rank. Lists are always the same
    /// length across ranks.
    pub kv_cache_blocks: Vec<Vec<BlockId>>,
    /// Host block ids while the request is swapped out, one list per rank.
    pub host_blocks: Vec<Vec<BlockId>>,
    /// Per-rank logits buffer base addresses.
    pub logits_buf: Vec<u64>,
    /// Row offset into the logits buffer.
    pub logits_offset: usize,
    /// Contiguous-region ids backing `logits_buf`, freed with the request.
    pub logits_block_ids: Vec<BlockId>,
    /// Whether a terminal event has been delivered.
    pub finished: bool,
    /// Terminal reason, if any.
    pub finish_reason: Option<FinishReason>,
    /// Set when the receiver has gone away; reaped at the next schedule.
    pub abandoned: bool,
    notifier: Box<dyn TokenSender>,
}

impl InferRequest {
    /// Wrap a client request for scheduling across `tensor_para_size` ranks.
    #[must_use]
    pub fn new(
        request: Request,
        tensor_para_size: usize,
        block_size: usize,
        notifier: Box<dyn TokenSender>,
    ) -> Self {
        Self {
            req_id: request.req_id,
            model_name: request.model_name,
            sampling: request.sampling,
            output_tokens: request.input_tokens.clone(),
            input_tokens: request.input_tokens,
            stage: InferStage::Context,
            step: 0,
            block_size,
            kv_cache_blocks: vec![Vec::new(); tensor_para_size],
            host_blocks: vec![Vec::new(); tensor_para_size],
            logits_buf: vec![0; tensor_para_size],
            logits_offset: 0,
            logits_block_ids: Vec::new(),
            finished: false,
            finish_reason: None,
            abandoned: false,
            notifier,
        }
    }

    /// Tokens generated beyond the prompt.
    #[must_use]
    pub fn generated_len(&self) -> usize {
        self.output_tokens.len() - self.input_tokens.len()
    }

    /// Device blocks currently held per rank.
    #[must_use]
    pub fn blocks_per_rank(&self) -> usize {
        self.kv_cache_blocks.first().map_or(0, Vec::len)
    }

    /// Host blocks currently held per rank (while swapped).
    #[must_use]
    pub fn host_blocks_per_rank(&self) -> usize {
        self.host_blocks.first().map_or(0, Vec::len)
    }

    /// Blocks each rank must hold to cover `output_tokens`.
    #[must_use]
    pub fn required_blocks(&self, block_token_num: usize) -> usize {
        self.output_tokens.len().div_ceil(block_token_num)
    }

    /// Stream one generated token. A failed send marks the request
    /// abandoned so the scheduler reaps it at the next pass.
    pub fn send_token(&mut self, token: i32) {
        if !self.notifier.send(GenerationEvent::Token(token)) {
            self.abandoned = true;
        }
    }

    /// Deliver the terminal event. Idempotent: only the first call for a
    /// request does anything, so clients observe exactly one notification.
    pub fn finish(&mut self, reason: FinishReason) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.finish_reason = Some(reason);
        let _ = self.notifier.send(GenerationEvent::Finished(reason));
    }

    /// Deliver a terminal error event. Idempotent like [`Self::finish`].
    pub fn finish_with_error(&mut self, error: Error) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.finish_reason = Some(FinishReason::Error);
        let _ = self.notifier.send(GenerationEvent::Error(error));
    }
}
