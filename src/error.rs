//! Error types for the buildpacks platform.
//!
//! A nonzero lifecycle phase exit code is not an error: phases report exit
//! codes and the orchestrator short-circuits on them. Everything in here is a
//! failure of the orchestration itself.

/// Result type alias for platform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a build.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Build request or settings are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Failed to parse a `major.minor` version.
    #[error("invalid version '{value}': expected major.minor")]
    InvalidVersion { value: String },

    /// No platform level is supported by both sides.
    #[error(
        "no compatible platform level: {origin} supports [{}], requested [{}]",
        supported.join(", "),
        requested.join(", ")
    )]
    IncompatiblePlatform {
        origin: String,
        requested: Vec<String>,
        supported: Vec<String>,
    },

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Builder or lifecycle image metadata missing or malformed.
    #[error("invalid metadata on image '{image}': {reason}")]
    BuilderMetadata { image: String, reason: String },

    /// No run image could be resolved.
    #[error("no run image resolvable for builder '{builder}'")]
    NoRunImage { builder: String },

    /// A structured document could not be read.
    #[error("failed to read {what}: {reason}")]
    Document { what: String, reason: String },

    // =========================================================================
    // Runtime Gateway Errors
    // =========================================================================
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image not known to the runtime.
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Container create failed.
    #[error("failed to create container from '{image}': {reason}")]
    CreateFailed { image: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Archive copy into or out of a container failed.
    #[error("archive copy failed for {container}:{path}: {reason}")]
    ArchiveCopyFailed {
        container: String,
        path: String,
        reason: String,
    },

    /// Volume operation failed.
    #[error("volume '{name}': {reason}")]
    VolumeFailed { name: String, reason: String },

    /// Any other runtime gateway failure.
    #[error("runtime operation '{operation}' failed: {reason}")]
    Runtime { operation: String, reason: String },

    // =========================================================================
    // Content Staging Errors
    // =========================================================================
    /// A content entry cannot be staged.
    #[error("invalid content entry '{path}': {reason}")]
    InvalidEntry { path: String, reason: String },

    /// The archive producer failed mid-stream.
    #[error("archive stream failed: {0}")]
    StreamFailed(String),

    // =========================================================================
    // Image Pull Errors
    // =========================================================================
    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Control Flow
    // =========================================================================
    /// The build was interrupted before it completed.
    #[error("build interrupted")]
    Interrupted,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::Runtime`].
    pub fn runtime(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Runtime {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`Error::Document`].
    pub fn document(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Document {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}
