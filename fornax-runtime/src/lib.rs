//! Fornax runtime: continuous batching over the paged KV-cache core
//!
//! # Architecture
//!
//! ```text
//! BatchManager<F>      ← driver thread; enqueue / start / stop
//!   ├── BatchScheduler ← admission, queues, strategy plan per step
//!   │     └── ScheduleStrategy  ← pure policy (continuous batching)
//!   └── StepDriver<F>  ← marshal batch, run forward on every rank
//!         └── F: ForwardPass    ← the transformer, external
//! ```
//!
//! One driver thread calls `schedule()` then `step()` in a loop, parking on
//! a [`Waiter`] when idle. Producers enqueue concurrently; a request's
//! events stream through its own channel and end with exactly one terminal
//! event.

mod batch_manager;
mod batch_state;
mod request;
mod scheduler;
mod step;
mod strategy;
mod waiter;

pub use batch_manager::{BatchManager, GreedySampler, Sampler};
pub use batch_state::{BatchState, Queues};
pub use request::{
    FinishReason, GenerationEvent, InferRequest, InferStage, Request, SamplingConfig, TokenSender,
};
pub use scheduler::BatchScheduler;
pub use step::{DeviceTables, ForwardPass, ModelShape, StepDriver, StepInputs, StepRequest};
pub use strategy::{
    ContinuousBatching, PoolStats, QueueView, RequestView, ScheduleStrategy, StepPlan,
};
pub use waiter::Waiter;
