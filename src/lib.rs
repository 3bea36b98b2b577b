//! # magikpack
//!
//! **Cloud Native Buildpacks Platform**
//!
//! This crate drives the CNB lifecycle against a container engine to turn
//! application source into a runnable OCI image, without the `pack` CLI. It
//! handles the versioned multi-phase build protocol (platform API 0.4 to
//! 0.12), recomposes the builder image at build time, and streams file trees
//! into containers and volumes with correct ownership.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magikpack                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 Lifecycle Orchestrator                      │    │
//! │  │  creator │ analyze ⇄ detect → restore → build/extend → export│    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │                       │                      │           │
//! │  ┌───────┴────────┐   ┌──────────┴─────────┐  ┌─────────┴────────┐  │
//! │  │ Builder Image  │   │ Ephemeral Builder  │  │ Content Streaming│  │
//! │  │ uid/gid, levels│   │ lifecycle/ext/bp   │  │ tar+gzip → cp    │  │
//! │  │ run images     │   │ commit + tag       │  │ owner stamping   │  │
//! │  └────────────────┘   └────────────────────┘  └──────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                  ContainerRuntime (gateway trait)                   │
//! │        ┌──────────────────────────────────────────────┐             │
//! │        │  DockerCliRuntime  (docker / podman CLI)     │             │
//! │        └──────────────────────────────────────────────┘             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Platform Levels
//!
//! | Level | Change |
//! |-------|--------|
//! | 0.7 | Analyze runs before Detect; `-previous-image`, `-run-image`, `-tag` |
//! | 0.9 | `-launch-cache` in daemon mode |
//! | 0.10 | Image extensions (`-generated`, extender phase) |
//! | 0.12 | `/cnb/run.toml`, run-image extension, `-run` |
//!
//! # Cleanup Guarantees
//!
//! - Every throwaway container is removed, success or failure.
//! - Teardown runs after every build, including failed and interrupted ones.
//! - Cleanup failures are logged, never raised over the primary outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use magikpack::{BuildRequest, DirectoryContent, DockerCliRuntime, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> magikpack::Result<()> {
//!     let runtime = Arc::new(DockerCliRuntime::new("docker"));
//!     let request = BuildRequest::new("paketobuildpacks/builder-jammy-base", "my-app")
//!         .with_content(DirectoryContent::new("./app"));
//!     let exit_code = Orchestrator::new(runtime).build(&request).await?;
//!     std::process::exit(exit_code as i32);
//! }
//! ```

pub mod builder;
pub mod compositor;
pub mod config;
pub mod constants;
pub mod content;
pub mod document;
pub mod error;
pub mod lifecycle;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod streaming;
pub mod version;

pub mod runtimes;

// Re-exports
pub use builder::{select_platform_level, BuilderImage};
pub use compositor::CompositionPlan;
pub use config::{BuildConfig, BuildRequest, PullPolicy};
pub use constants::*;
pub use content::{Content, ContainerEntry, DirectoryContent, FileContent, StringContent};
pub use error::{Error, Result};
pub use lifecycle::{Orchestrator, Phase, PhaseLogSink, TracingLogSink};
pub use reference::ImageReference;
pub use registry::ImagePuller;
pub use runtime::{ArchiveStream, ContainerRuntime, ContainerSpec, ImageInfo, ImageSummary, LogLine};
pub use runtimes::DockerCliRuntime;
pub use version::Version;
