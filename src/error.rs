//! Error taxonomy shared by resolution, breeding and the saga definitions.
//!
//! Every terminal saga failure is reduced to a [`SagaFailure`]: a structured
//! [`ErrorKind`] plus a human readable message.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::inventory::InventoryError;
use crate::resolution::{format_chain, AncestorInfo};

/// Errors produced while resolving gene sets and ancestors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("invalid gene reference '{reference}': {reason}")]
    InvalidGeneReference { reference: String, reason: String },
    #[error("failed to resolve gene set '{gene_set}': {reason}")]
    GeneResolutionFailed { gene_set: String, reason: String },
    #[error("ancestor '{ancestor}' is unavailable: {reason}")]
    AncestorGeneUnavailable { ancestor: String, reason: String },
    #[error("cyclic ancestry detected: {}", format_chain(.chain))]
    CyclicAncestryDetected { chain: Vec<AncestorInfo> },
}

/// Two fragments claim the same key and cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("breeding conflict in {collection} [{}]: {reason}", .keys.join(", "))]
pub struct BreedingError {
    pub collection: String,
    pub keys: Vec<String>,
    pub reason: String,
}

/// Failure of the combined resolve-and-breed operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecificationError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Breeding(#[from] BreedingError),
}

/// Structured kind carried by every terminal saga failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidGeneReference,
    GeneResolutionFailed,
    AncestorGeneUnavailable,
    CyclicAncestryDetected,
    BreedingConflict,
    AgentCommandFailed,
    SagaDataMissing,
    InvalidConfig,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors a saga step can return. Any of them ends the saga with `fail`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SagaError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Breeding(#[from] BreedingError),
    #[error("agent command '{command}' failed: {message}")]
    AgentCommandFailed { command: String, message: String },
    /// A value that must exist at this step is missing. Contract violation.
    #[error("saga data missing: {0}")]
    SagaDataMissing(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Resolution(e) => match e {
                ResolutionError::InvalidGeneReference { .. } => ErrorKind::InvalidGeneReference,
                ResolutionError::GeneResolutionFailed { .. } => ErrorKind::GeneResolutionFailed,
                ResolutionError::AncestorGeneUnavailable { .. } => {
                    ErrorKind::AncestorGeneUnavailable
                }
                ResolutionError::CyclicAncestryDetected { .. } => ErrorKind::CyclicAncestryDetected,
            },
            SagaError::Breeding(_) => ErrorKind::BreedingConflict,
            SagaError::AgentCommandFailed { .. } => ErrorKind::AgentCommandFailed,
            SagaError::SagaDataMissing(_) => ErrorKind::SagaDataMissing,
            SagaError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SagaError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<SpecificationError> for SagaError {
    fn from(e: SpecificationError) -> Self {
        match e {
            SpecificationError::Resolution(e) => SagaError::Resolution(e),
            SpecificationError::Breeding(e) => SagaError::Breeding(e),
        }
    }
}

impl From<InventoryError> for SagaError {
    fn from(e: InventoryError) -> Self {
        SagaError::Internal(format!("inventory: {e}"))
    }
}

impl From<serde_json::Error> for SagaError {
    fn from(e: serde_json::Error) -> Self {
        SagaError::Internal(e.to_string())
    }
}

/// Terminal failure reported to whoever initiated a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SagaFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl SagaFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<SagaError> for SagaFailure {
    fn from(e: SagaError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}
