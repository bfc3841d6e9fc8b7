//! DMS Core - distributed ability scheduling for lightweight devices.
//!
//! This crate implements:
//! - The single-slot session manager with busy gating and timeout recovery
//! - The permission verifier for remote start requests
//! - Request dispatch between transport callbacks and protocol handling
//! - Endpoint assembly and configuration

#![forbid(unsafe_code)]

// Core state machines
pub mod session;
pub mod permission;

// Services
pub mod ability;
pub mod dispatch;
pub mod service;

// Adapters
pub mod registry;

// Supporting modules
pub mod config;
pub mod errors;
pub mod sync;
pub mod harness;

pub use ability::{AbilityLauncher, AbilityManager, LoggingLauncher, Want};
pub use config::{ConfigError, DmsConfig};
pub use errors::{DmsError, DmsResult};
pub use permission::{AccessMode, AppIdentity, CallerInfo, IdentityProfile, PermissionVerifier};
pub use service::DmsService;
pub use session::{CompletionListener, SessionManager, SessionState};
