//! cloudRIG Worker
//!
//! Runs workflow steps delivered via NATS JetStream.
//!
//! This crate provides:
//! - NATS JetStream bus and scheduler for step messages
//! - JetStream subscriber that holds back scheduled messages
//! - NATS progress and alert sinks
//! - The worker loop around the step runtime

pub mod config;
pub mod nats;
pub mod progress;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
