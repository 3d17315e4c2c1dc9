//! Error types for OpenSteer

use thiserror::Error;

use crate::core::CoreId;

/// OpenSteer error type
#[derive(Error, Debug)]
pub enum SteerError {
    /// Live-flow cap reached
    #[error("flow table full")]
    FlowTableFull,

    /// Classification rule limit reached
    #[error("filter limit reached")]
    FilterLimit,

    /// An identical classification rule is already installed
    #[error("duplicate filter")]
    DuplicateFilter,

    /// Referenced rule is not installed
    #[error("filter not found")]
    FilterNotFound,

    /// Core index outside the configured topology
    #[error("invalid core: {0}")]
    InvalidCore(CoreId),

    /// Referenced flow is not in the table
    #[error("flow not found: {0:#x}")]
    FlowNotFound(u64),

    /// Engine is not running
    #[error("engine not running")]
    NotRunning,

    /// Engine already running
    #[error("engine already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("config error: {0}")]
    ConfigError(String),
}

/// Result type for OpenSteer
pub type SteerResult<T> = Result<T, SteerError>;
