//! # Buildpacks Platform Constants
//!
//! Defines the container paths, image labels, default identities, timeouts
//! and platform levels used when driving the CNB lifecycle. These constants
//! are the **single source of truth** for the paths shared between the
//! compositor, the streaming engine and the lifecycle phases.
//!
//! ## Cross-References
//!
//! - [`crate::builder`]: Uses label names and default build ids
//! - [`crate::compositor`]: Uses content directories and mount points
//! - [`crate::lifecycle`]: Uses phase paths and platform levels
//! - [`crate::registry`]: Uses pull timeouts and retry defaults

use std::time::Duration;

use crate::version::Version;

// =============================================================================
// Platform API Levels
// =============================================================================

/// Platform API levels this crate can drive, newest first.
///
/// Level selection walks this list in order and picks the first level the
/// builder (or lifecycle image) also supports.
pub const SUPPORTED_PLATFORM_LEVELS: &[Version] = &[
    Version::new(0, 12),
    Version::new(0, 11),
    Version::new(0, 10),
    Version::new(0, 9),
    Version::new(0, 8),
    Version::new(0, 7),
    Version::new(0, 6),
    Version::new(0, 5),
    Version::new(0, 4),
];

/// Analyze runs before Detect from this level on.
pub const PLATFORM_ANALYZE_FIRST: Version = Version::new(0, 7);

/// `-launch-cache` is understood from this level on.
pub const PLATFORM_LAUNCH_CACHE: Version = Version::new(0, 9);

/// Image extensions are available from this level on.
pub const PLATFORM_EXTENSIONS: Version = Version::new(0, 10);

/// Run metadata moves to `/cnb/run.toml` and run-image extension appears.
pub const PLATFORM_RUN_TOML: Version = Version::new(0, 12);

// =============================================================================
// Image Labels
// =============================================================================

/// Builder metadata label (JSON).
pub const BUILDER_METADATA_LABEL: &str = "io.buildpacks.builder.metadata";

/// Extension layers label (JSON object, empty when no extensions).
pub const EXTENSION_LAYERS_LABEL: &str = "io.buildpacks.extension.layers";

/// Lifecycle image API label (JSON).
pub const LIFECYCLE_APIS_LABEL: &str = "io.buildpacks.lifecycle.apis";

// =============================================================================
// Build Identity
// =============================================================================

/// Build user id used when the builder does not declare one.
pub const DEFAULT_BUILD_UID: u32 = 1000;

/// Build group id used when the builder does not declare one.
pub const DEFAULT_BUILD_GID: u32 = 1000;

/// Image/platform environment key carrying the build user id.
pub const ENV_USER_ID: &str = "CNB_USER_ID";

/// Image/platform environment key carrying the build group id.
pub const ENV_GROUP_ID: &str = "CNB_GROUP_ID";

/// Environment key announcing the platform level to each phase.
pub const ENV_PLATFORM_API: &str = "CNB_PLATFORM_API";

/// Environment key enabling experimental lifecycle features (extensions).
pub const ENV_EXPERIMENTAL_MODE: &str = "CNB_EXPERIMENTAL_MODE";

/// Host environment flag that turns on the built-in debug wrapper.
pub const ENV_LIFECYCLE_DEBUG: &str = "MAGIKPACK_LIFECYCLE_DEBUG";

// =============================================================================
// Container Paths
// =============================================================================

/// Lifecycle binaries directory.
pub const LIFECYCLE_DIR: &str = "/cnb/lifecycle";

/// Extensions directory inside a builder.
pub const EXTENSIONS_DIR: &str = "/cnb/extensions";

/// Buildpacks directory inside a builder.
pub const BUILDPACKS_DIR: &str = "/cnb/buildpacks";

/// Run image metadata written into builders (platform 0.12+).
pub const RUN_TOML_PATH: &str = "/cnb/run.toml";

/// Stack metadata used by platforms 0.7 - 0.11.
pub const STACK_TOML_PATH: &str = "/cnb/stack.toml";

/// Location of the injected debug wrapper.
pub const DEBUG_SCRIPT_PATH: &str = "/cnb/magikpack-debug.sh";

/// Application source mount.
pub const APP_DIR: &str = "/workspace";

/// Lifecycle layers mount (also holds the output documents).
pub const LAYERS_DIR: &str = "/layers";

/// Build cache mount.
pub const CACHE_DIR: &str = "/cache";

/// Launch cache mount.
pub const LAUNCH_CACHE_DIR: &str = "/launch-cache";

/// Platform directory mount.
pub const PLATFORM_DIR: &str = "/platform";

/// Platform environment directory.
pub const PLATFORM_ENV_DIR: &str = "/platform/env";

/// Kaniko cache mount used by extenders.
pub const KANIKO_DIR: &str = "/kaniko";

/// Analyzed document written by analyzer / detector.
pub const ANALYZED_PATH: &str = "/layers/analyzed.toml";

/// Group document written by detector.
pub const GROUP_PATH: &str = "/layers/group.toml";

/// Plan document written by detector.
pub const PLAN_PATH: &str = "/layers/plan.toml";

/// Generated Dockerfiles written by extension detection.
pub const GENERATED_DIR: &str = "/layers/generated";

/// Mount point for throwaway containers that stage content into volumes.
///
/// Must not be a directory the anchor image owns as root, so that the
/// synthesized directory entry can hand ownership to the build user.
pub const VOLUME_STAGING_MOUNT: &str = "/volume-mount";

/// Default engine socket bound into daemon-mode phases.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Directories pre-created inside the ephemeral builder, owned by the build user.
pub const BUILDER_MOUNT_DIRS: &[&str] = &[
    KANIKO_DIR,
    APP_DIR,
    LAYERS_DIR,
    CACHE_DIR,
    LAUNCH_CACHE_DIR,
    PLATFORM_DIR,
    PLATFORM_ENV_DIR,
];

// =============================================================================
// Image Naming
// =============================================================================

/// Repository used to tag ephemeral builders.
pub const EPHEMERAL_BUILDER_REPOSITORY: &str = "magikpack-ephemeral-builder";

/// Prefix for generated volume names.
pub const VOLUME_NAME_PREFIX: &str = "magikpack";

/// Maximum image reference length in bytes.
///
/// Registry implementations may have lower limits.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Characters allowed in an image reference.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/:.-_@";

// =============================================================================
// Timeouts and Streaming
// =============================================================================

/// Default per-attempt image pull timeout.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default extra time granted to every retry after the first attempt.
pub const DEFAULT_PULL_RETRY_INCREASE: Duration = Duration::from_secs(15);

/// Default number of pull attempts.
pub const DEFAULT_PULL_RETRY_COUNT: u32 = 3;

/// Chunk size used when pumping archive bytes.
pub const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered between an archive producer and its consumer.
///
/// Bounds memory to `ARCHIVE_CHANNEL_DEPTH * ARCHIVE_CHUNK_SIZE` per staging call.
pub const ARCHIVE_CHANNEL_DEPTH: usize = 16;
