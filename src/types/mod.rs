//! Core types for the container.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, ConvId, ContainerId)
//! - **Errors**: Status-coded error taxonomy with thiserror derives
//! - **Config**: Container configuration and process config helpers

mod config;
mod errors;
mod ids;

pub use config::{
    config_path, config_str, ensure_object, merge_config, Config, ContainerConfig,
    GovernanceConfig, MessagingConfig, ObservabilityConfig, PreconditionFailureMode,
};
pub use errors::{CauseFrame, Error, ErrorKind, RemoteFault, Result};
pub use ids::{is_valid_identifier, ContainerId, ConvId, ConvIdGenerator, ProcessId, ProcessIdPool};
