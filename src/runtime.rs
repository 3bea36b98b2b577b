//! Container runtime gateway.
//!
//! The platform never talks to a container engine directly. Everything it
//! needs is expressed through [`ContainerRuntime`], a deliberately narrow set
//! of engine primitives:
//!
//! ```text
//! create(spec) → start(id) → stream_logs(id) → wait(id) → remove(id)
//! copy_to(id, path, archive)      copy_from(id, path) → archive
//! inspect / pull / list / commit / tag / remove images
//! create / inspect / remove volumes
//! ```
//!
//! # Archive Streams
//!
//! Tar archives cross the gateway as [`ArchiveStream`]s: bounded channels of
//! byte chunks. Producers running on a blocking thread write through
//! [`ArchiveWriter`]; a producer failure travels in-band as an `Err` chunk so
//! the consumer abandons the upload instead of committing a truncated archive.
//!
//! # Implementations
//!
//! - `DockerCliRuntime`: drives a Docker-compatible CLI (`docker`, `podman`)

use std::collections::HashMap;
use std::io::{self, Write};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::constants::ARCHIVE_CHUNK_SIZE;
use crate::error::Result;

// =============================================================================
// Container Specification
// =============================================================================

/// A volume or host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Volume name or absolute host path.
    pub source: String,
    /// Mount point inside the container.
    pub target: String,
}

impl VolumeBinding {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image to create the container from.
    pub image: String,
    /// Command (entrypoint first). Empty means "image default".
    pub command: Vec<String>,
    /// User (`uid`, `uid:gid` or name) to run as.
    pub user: Option<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Security options (e.g. `label=disable`).
    pub security_options: Vec<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Volume bindings.
    pub bindings: Vec<VolumeBinding>,
}

impl ContainerSpec {
    /// Creates a spec for `image` with no command.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_binding(mut self, binding: VolumeBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

// =============================================================================
// Images
// =============================================================================

/// Result of inspecting an image.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    /// Image ID.
    pub id: String,
    /// Image labels.
    pub labels: HashMap<String, String>,
    /// Image environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Declared operating system.
    pub os: String,
    /// Declared architecture.
    pub architecture: String,
    /// Repository tags.
    pub repo_tags: Vec<String>,
    /// Repository digests.
    pub repo_digests: Vec<String>,
}

impl ImageInfo {
    /// Looks up a variable in the image environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// `os/architecture`, as accepted by `pull --platform`.
    pub fn platform(&self) -> Option<String> {
        if self.os.is_empty() || self.architecture.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.os, self.architecture))
    }
}

/// One entry of the runtime's image list.
#[derive(Debug, Clone, Default)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
}

// =============================================================================
// Logs
// =============================================================================

/// Which container stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

// =============================================================================
// Archive Streams
// =============================================================================

type Chunk = io::Result<Vec<u8>>;

/// Receiving half of a bounded archive byte pipe.
#[derive(Debug)]
pub struct ArchiveStream {
    rx: mpsc::Receiver<Chunk>,
}

/// Sending half of a bounded archive byte pipe.
#[derive(Debug, Clone)]
pub struct ArchiveSender {
    tx: mpsc::Sender<Chunk>,
}

impl ArchiveStream {
    /// Creates a pipe buffering at most `depth` chunks.
    pub fn channel(depth: usize) -> (ArchiveSender, ArchiveStream) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (ArchiveSender { tx }, ArchiveStream { rx })
    }

    /// Wraps an in-memory archive.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let (sender, stream) = Self::channel(1);
        // Capacity 1 and a fresh channel: this cannot be full.
        let _ = sender.tx.try_send(Ok(bytes));
        stream
    }

    /// Receives the next chunk; `None` once the producer is done.
    pub async fn recv(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.rx.recv().await
    }

    /// Drains the whole stream into memory, failing on the first `Err` chunk.
    pub async fn collect(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl ArchiveSender {
    /// Sends a chunk; false if the consumer went away.
    pub async fn send(&self, chunk: Vec<u8>) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Signals a producer failure to the consumer.
    pub async fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Blocking variant of [`ArchiveSender::fail`]. Must not be called from
    /// an async context.
    pub fn blocking_fail(&self, err: io::Error) {
        let _ = self.tx.blocking_send(Err(err));
    }

    /// Turns this sender into a blocking `Write` adapter.
    pub fn into_writer(self) -> ArchiveWriter {
        ArchiveWriter {
            sender: self,
            buf: Vec::with_capacity(ARCHIVE_CHUNK_SIZE),
        }
    }
}

/// Blocking [`Write`] adapter over an [`ArchiveSender`].
///
/// Buffers up to [`ARCHIVE_CHUNK_SIZE`] bytes per chunk and blocks while the
/// pipe is full. Must be driven from a blocking thread.
#[derive(Debug)]
pub struct ArchiveWriter {
    sender: ArchiveSender,
    buf: Vec<u8>,
}

impl ArchiveWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(ARCHIVE_CHUNK_SIZE));
        self.sender
            .tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer closed"))
    }

    /// Reports a failure to the consumer, discarding buffered bytes.
    pub fn fail(self, err: io::Error) {
        self.sender.blocking_fail(err);
    }
}

impl Write for ArchiveWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = ARCHIVE_CHUNK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= ARCHIVE_CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// Capability interface onto a container engine.
///
/// Implementations wrap engine errors into [`crate::Error`] with enough
/// context to identify the failing resource.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    // =========================================================================
    // Containers
    // =========================================================================

    /// Creates (but does not start) a container. Returns its ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Relays combined stdout/stderr to `sink` until the log stream closes.
    async fn stream_logs(
        &self,
        id: &str,
        timestamps: bool,
        sink: &mut (dyn FnMut(LogLine) + Send),
    ) -> Result<()>;

    /// Waits for a container to exit and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Force-removes a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Extracts the tar archive `archive` at `path` inside the container.
    async fn copy_to_container(&self, id: &str, path: &str, archive: ArchiveStream)
        -> Result<()>;

    /// Streams `path` out of the container as a tar archive.
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<ArchiveStream>;

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    // =========================================================================
    // Images
    // =========================================================================

    /// Inspects an image; `None` if the runtime does not know it.
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;

    /// Pulls an image, optionally for a specific `os/arch`. Returns on completion.
    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// Commits a container to a new image. Returns the image ID.
    async fn commit_container(&self, id: &str) -> Result<String>;

    async fn tag_image(&self, image: &str, reference: &str) -> Result<()>;

    async fn remove_image(&self, reference: &str) -> Result<()>;
}

/// Removes a container, logging instead of failing.
///
/// Used on cleanup paths, where a removal failure must never mask the
/// primary outcome.
pub async fn discard_container(runtime: &dyn ContainerRuntime, id: &str) {
    if let Err(e) = runtime.remove_container(id).await {
        warn!("Failed to remove container {}: {}", id, e);
    }
}
