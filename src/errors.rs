//! Error Types
//!
//! This module defines the error types used throughout the skinning pipeline.
//!
//! # Overview
//!
//! The main error type [`SkinError`] covers the recoverable failure modes:
//! - GPU resource creation failures (per-entry fallback to the uncached path)
//! - Missing platform capabilities (skin cache becomes inert)
//! - Invalid handles and unknown mesh objects
//! - A disconnected render command queue
//!
//! Invariant violations (freeing before a fence signals, double release,
//! buffer identity corruption) are **not** represented here: they panic.
//!
//! # Usage
//!
//! ```rust,ignore
//! use myth_skinning::errors::{SkinError, Result};
//!
//! fn upload() -> Result<()> {
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The main error type for the skinning pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkinError {
    // ========================================================================
    // GPU Resource Errors
    // ========================================================================
    /// A pool or the device could not provide a buffer of the requested size.
    #[error("Resource exhaustion for '{label}' ({size} bytes): {reason}")]
    ResourceExhaustion {
        /// Label of the pool or resource that failed
        label: &'static str,
        /// Requested size in bytes
        size: u64,
        /// Human readable cause
        reason: String,
    },

    /// The platform lacks a capability required by the requested feature.
    #[error("Capability unsupported: {0}")]
    CapabilityUnsupported(String),

    /// A buffer handle no longer refers to a live device buffer.
    #[error("Invalid buffer handle: {0}")]
    InvalidHandle(String),

    // ========================================================================
    // Pipeline Errors
    // ========================================================================
    /// A render command referenced a mesh object that does not exist.
    #[error("Unknown mesh object: {0}")]
    UnknownMeshObject(u64),

    /// A compute kernel has no pipeline registered on the device.
    #[error("Missing compute pipeline for kernel: {0}")]
    MissingPipeline(String),

    /// The render command queue has been closed.
    #[error("Render command queue disconnected")]
    Disconnected,
}

impl SkinError {
    /// Builds a [`SkinError::ResourceExhaustion`].
    #[must_use]
    pub fn exhausted(label: &'static str, size: u64, reason: impl Into<String>) -> Self {
        Self::ResourceExhaustion {
            label,
            size,
            reason: reason.into(),
        }
    }

    /// Stable key used to log a failure once per distinct class.
    #[must_use]
    pub fn failure_class(&self) -> &'static str {
        match self {
            Self::ResourceExhaustion { label, .. } => label,
            Self::CapabilityUnsupported(_) => "capability",
            Self::InvalidHandle(_) => "invalid-handle",
            Self::UnknownMeshObject(_) => "unknown-mesh-object",
            Self::MissingPipeline(_) => "missing-pipeline",
            Self::Disconnected => "disconnected",
        }
    }
}

impl<T> From<flume::SendError<T>> for SkinError {
    fn from(_: flume::SendError<T>) -> Self {
        SkinError::Disconnected
    }
}

/// Alias for `Result<T, SkinError>`.
pub type Result<T> = std::result::Result<T, SkinError>;
