//! Error types for the warehouse core.

use crate::arm::InFlight;

/// Top-level error type.
///
/// `Validation`, `NotFound` and `Busy` are resolved at the boundary and never
/// reach the device. `Persistence` is reserved for the window after the device
/// acknowledged a command but the matching store update failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Arm is busy{}", busy_suffix(.current))]
    Busy { current: Option<InFlight> },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device acknowledged the command but the state update failed: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Stable machine-readable code, sent to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Busy { .. } => "busy",
            Self::Device(DeviceError::Unregistered) => "device_unregistered",
            Self::Device(DeviceError::CommFailure { .. }) => "device_comm_failure",
            Self::Device(DeviceError::InvalidAddress(_)) => "validation",
            Self::Persistence(_) => "persistence",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

fn busy_suffix(current: &Option<InFlight>) -> String {
    match current {
        Some(c) => format!(" with {c}"),
        None => String::new(),
    }
}

/// Device gateway errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not registered")]
    Unregistered,

    #[error("Device communication failed: {reason}")]
    CommFailure { reason: String },

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for the warehouse core.
pub type Result<T> = std::result::Result<T, Error>;
