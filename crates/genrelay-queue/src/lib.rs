//! Delayed, at-least-once job activations.
//!
//! An activation is either a generate request or one poll of an in-flight
//! asynchronous task. Workers claim ready activations, run them, and either
//! acknowledge or hand them back for a delayed retry. A claimed activation
//! that is neither acknowledged nor retried before its visibility timeout
//! is delivered again, so every consumer must tolerate duplicates.

pub mod activation;
pub mod memory;
pub mod redis_queue;

pub use activation::{Activation, ActivationKind};
pub use memory::{InMemoryQueue, PendingActivation};
pub use redis_queue::RedisQueue;

use anyhow::Result;
use async_trait::async_trait;
use genrelay_core::JobDescriptor;
use std::time::Duration;
use ulid::Ulid;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedule an activation to become ready after `delay`.
    async fn enqueue_activation(
        &self,
        kind: ActivationKind,
        descriptor: JobDescriptor,
        delay: Duration,
    ) -> Result<Ulid>;

    /// Claim the next ready activation, if any.
    async fn next_ready(&self) -> Result<Option<Activation>>;

    /// Mark a claimed activation as done.
    async fn ack(&self, activation: &Activation) -> Result<()>;

    /// Return a claimed activation for another attempt after `delay`.
    async fn retry(&self, activation: Activation, delay: Duration) -> Result<()>;
}
