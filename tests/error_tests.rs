//! Tests for error types.
//!
//! Validates display formatting and conversions.

use magikpack::Error;
use std::time::Duration;

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_incompatible_platform_display() {
    let err = Error::IncompatiblePlatform {
        origin: "builder example.com/builder:jammy".to_string(),
        requested: vec!["0.12".to_string()],
        supported: vec!["0.9".to_string(), "0.10".to_string()],
    };
    let msg = err.to_string();

    assert!(msg.contains("builder example.com/builder:jammy"), "should name the origin");
    assert!(msg.contains("[0.9, 0.10]"), "should list supported levels");
    assert!(msg.contains("[0.12]"), "should list requested levels");
}

#[test]
fn test_invalid_image_reference_display() {
    let err = Error::InvalidImageReference {
        reference: "UPPER/case".to_string(),
        reason: "repository must be lowercase".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("UPPER/case"));
    assert!(msg.contains("lowercase"));
}

#[test]
fn test_no_run_image_display() {
    let err = Error::NoRunImage {
        builder: "example.com/builder:jammy".to_string(),
    };
    assert!(err.to_string().contains("example.com/builder:jammy"));
}

// =============================================================================
// Runtime Gateway Error Tests
// =============================================================================

#[test]
fn test_archive_copy_failed_display() {
    let err = Error::ArchiveCopyFailed {
        container: "abc123".to_string(),
        path: "/cnb/run.toml".to_string(),
        reason: "no such file".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "archive copy failed for abc123:/cnb/run.toml: no such file"
    );
}

#[test]
fn test_runtime_shorthand() {
    let err = Error::runtime("volume create", "daemon unreachable");
    match err {
        Error::Runtime { operation, reason } => {
            assert_eq!(operation, "volume create");
            assert_eq!(reason, "daemon unreachable");
        }
        other => panic!("unexpected variant: {:?}", other),
    }
}

#[test]
fn test_document_shorthand() {
    let err = Error::document("analyzed.toml", "expected table");
    assert_eq!(err.to_string(), "failed to read analyzed.toml: expected table");
}

// =============================================================================
// Pull and Control Flow Error Tests
// =============================================================================

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "pull example.com/run:base".to_string(),
        duration: Duration::from_secs(60),
    };
    let msg = err.to_string();

    assert!(msg.contains("60s"), "should include duration");
    assert!(msg.contains("pull example.com/run:base"), "should include operation");
}

#[test]
fn test_interrupted_display() {
    assert_eq!(Error::Interrupted.to_string(), "build interrupted");
}

#[test]
fn test_io_error_conversion() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let err: Error = io_err.into();

    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("file not found"));
}
