//! Distributed rate and concurrency admission for generation providers.

pub mod controller;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use controller::{AdmissionController, AdmissionPermit, Limits};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{AdmitDecision, AdmitRequest, SharedStore, SlotSnapshot};
