//! cloudRIG Steps
//!
//! The concrete steps of a rig provisioning chain and the collaborators
//! they talk to:
//! - [`ResourceControl`] and [`RemoteCommand`] provider interfaces
//! - [`HttpResourceControl`], the HTTP provider client
//! - [`InMemoryProvider`] for dry runs
//! - The built-in steps and [`create_default_registry`]
//! - Chain templates for provisioning and stopping a rig

pub mod client;
pub mod error;
pub mod memory;
pub mod resource;
pub mod steps;
pub mod templates;

pub use client::HttpResourceControl;
pub use error::ProviderError;
pub use memory::InMemoryProvider;
pub use resource::{
    AgentFacts, CommandOutput, InstanceRecord, RemoteCommand, ResourceControl, ResourceSpec,
    ResourceState, StatusFacts,
};
pub use steps::create_default_registry;
pub use templates::{compensating_chain, provision, stop, ProvisionRequest};
