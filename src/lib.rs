#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sandstrap only works on linux or android");

#[macro_use] extern crate lazy_static;

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod events;
pub mod layer;
pub mod readiness;
pub mod sandbox;
pub mod supervisor;

pub use crate::{
    bootstrap::{BootstrapState, Orchestrator, OrchestratorBuilder, ServiceSpec, Status},
    config::{GatewayConfig, Provider},
    layer::LayerSpec,
    supervisor::Role,
};
