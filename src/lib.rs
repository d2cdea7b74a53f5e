//! Client-side synchronization layer for Moonraker/Klipper
//!
//! This crate keeps a local, continuously reconciled model of a 3D printer
//! controlled by Klipper and exposed through Moonraker's JSON-RPC websocket
//! API, and translates operator intents into remote commands.
//!
//! # Features
//!
//! - JSON-RPC 2.0 over websocket with request/response correlation
//! - Capability discovery of heaters, sensors, fans, pins and MCUs
//! - Subscription building and snapshot/delta reconciliation
//! - Temperature history, layer tracking and job bookkeeping
//! - Command emitters for motion, temperature, devices and job control
//! - Power device, firmware and host information services

pub mod client;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod services;
pub mod session;
pub mod state;

// Test support modules - available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

// Re-export main types for convenience
pub use client::{ChannelState, MoonrakerClient, RpcSender};
pub use commands::CommandEmitter;
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use session::Session;
pub use state::{MachineModel, MachineStatus, StateEngine};
