// Common library for the remote deployment orchestrator

pub mod config;
pub mod errors;
pub mod executor;
pub mod hasher;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod telemetry;
pub mod transfer;
pub mod transport;
pub mod workflow;
