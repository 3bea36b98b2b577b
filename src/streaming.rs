//! Content streaming engine.
//!
//! Turns an ordered list of [`ContainerEntry`] values into a gzip-compressed
//! tar stream and pushes it into a container (or, through a throwaway
//! container, into a named volume).
//!
//! ## Producer / Consumer
//!
//! ```text
//!  spawn_blocking                      async task
//! ┌──────────────────┐  ArchiveStream  ┌──────────────────────────────┐
//! │ tar + gzip write │ ──(bounded)───► │ runtime.copy_to_container()  │
//! └──────────────────┘                 └──────────────────────────────┘
//!            └───────────── joined before returning ─────────┘
//! ```
//!
//! The consumer starts draining while the producer is still walking the
//! entries, so memory stays bounded by the channel depth regardless of the
//! size of the tree. Both halves are joined; the producer's error wins even
//! when the upload itself reported success.
//!
//! ## Directory Synthesis
//!
//! Every ancestor of every entry is emitted once per call, root-most first,
//! as a directory owned by the requested uid/gid. The archive root (`""`) is
//! never emitted.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::constants::{ARCHIVE_CHANNEL_DEPTH, VOLUME_STAGING_MOUNT};
use crate::content::{join_path, ContainerEntry, EntryKind, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::error::{Error, Result};
use crate::runtime::{discard_container, ArchiveStream, ContainerRuntime, ContainerSpec, VolumeBinding};

// =============================================================================
// Archive Writer
// =============================================================================

/// Checks every entry up front so a bad list never reaches the runtime.
pub fn validate_entries(entries: &[ContainerEntry]) -> Result<()> {
    entries.iter().try_for_each(ContainerEntry::validate)
}

/// Writes `entries` as a gzip-compressed tar into `out`, returning `out`.
pub fn write_archive<W: Write>(
    out: W,
    prefix: &str,
    uid: u32,
    gid: u32,
    entries: &[ContainerEntry],
) -> Result<W> {
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    let mut emitted: HashSet<String> = HashSet::new();
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    for entry in entries {
        let path = join_path(prefix, entry.path())
            .trim_start_matches('/')
            .trim_end_matches('/')
            .to_string();
        if path.is_empty() {
            return Err(Error::InvalidEntry {
                path: entry.path().to_string(),
                reason: "empty path".to_string(),
            });
        }

        // Ancestors, root-most first.
        let segments: Vec<&str> = path.split('/').collect();
        for depth in 1..segments.len() {
            let ancestor = segments[..depth].join("/");
            if emitted.insert(ancestor.clone()) {
                append_directory(&mut builder, &ancestor, DEFAULT_DIR_MODE, uid, gid, mtime)?;
            }
        }

        match entry.kind() {
            EntryKind::Directory => {
                if emitted.insert(path.clone()) {
                    let mode = entry.mode().unwrap_or(DEFAULT_DIR_MODE);
                    append_directory(&mut builder, &path, mode, uid, gid, mtime)?;
                }
            }
            EntryKind::File => {
                let size = entry.size().ok_or_else(|| Error::InvalidEntry {
                    path: entry.path().to_string(),
                    reason: "size cannot be determined".to_string(),
                })?;
                let reader = entry.open()?;
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(size);
                header.set_mode(entry.mode().unwrap_or(DEFAULT_FILE_MODE));
                header.set_uid(uid as u64);
                header.set_gid(gid as u64);
                header.set_mtime(mtime);
                let mut counted = CountingReader::new(reader.take(size));
                builder
                    .append_data(&mut header, &path, &mut counted)
                    .map_err(|e| stream_error(&path, e))?;
                if counted.count < size {
                    return Err(Error::InvalidEntry {
                        path: entry.path().to_string(),
                        reason: format!("source yielded {} of {} bytes", counted.count, size),
                    });
                }
            }
        }
    }

    let encoder = builder.into_inner().map_err(|e| stream_error("<trailer>", e))?;
    encoder.finish().map_err(|e| stream_error("<gzip>", e))
}

fn append_directory<W: Write>(
    builder: &mut Builder<W>,
    path: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode);
    header.set_uid(uid as u64);
    header.set_gid(gid as u64);
    header.set_mtime(mtime);
    builder
        .append_data(&mut header, format!("{}/", path), io::empty())
        .map_err(|e| stream_error(path, e))
}

/// Counts the bytes read through it.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

fn stream_error(path: &str, err: io::Error) -> Error {
    Error::StreamFailed(format!("{}: {}", path, err))
}

// =============================================================================
// Staging
// =============================================================================

/// Streams `entries` into container `container_id` under `path_prefix`,
/// owned by `uid:gid`.
pub async fn stage_entries(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    path_prefix: &str,
    uid: u32,
    gid: u32,
    entries: Vec<ContainerEntry>,
) -> Result<()> {
    validate_entries(&entries)?;
    debug!(
        "Staging {} entries into {}:/{} as {}:{}",
        entries.len(),
        container_id,
        path_prefix.trim_start_matches('/'),
        uid,
        gid
    );

    let (sender, stream) = ArchiveStream::channel(ARCHIVE_CHANNEL_DEPTH);
    let prefix = path_prefix.to_string();
    let producer = tokio::task::spawn_blocking(move || {
        let writer = sender.clone().into_writer();
        match write_archive(writer, &prefix, uid, gid, &entries) {
            Ok(mut writer) => writer.flush().map_err(|e| stream_error("<flush>", e)),
            Err(e) => {
                sender.blocking_fail(io::Error::new(io::ErrorKind::Other, e.to_string()));
                Err(e)
            }
        }
    });

    let consumer = runtime.copy_to_container(container_id, "/", stream);
    let (consumed, produced) = tokio::join!(consumer, producer);

    produced.map_err(|e| Error::Internal(format!("archive producer aborted: {}", e)))??;
    consumed
}

/// Streams `entries` into volume `volume` under `path_prefix` through a
/// throwaway container created from `anchor_image`.
pub async fn stage_to_volume(
    runtime: &dyn ContainerRuntime,
    volume: &str,
    anchor_image: &str,
    path_prefix: &str,
    uid: u32,
    gid: u32,
    entries: Vec<ContainerEntry>,
) -> Result<()> {
    validate_entries(&entries)?;

    let spec = ContainerSpec::new(anchor_image)
        .with_binding(VolumeBinding::new(volume, VOLUME_STAGING_MOUNT));
    let id = runtime.create_container(&spec).await?;

    let prefix = join_path(VOLUME_STAGING_MOUNT, path_prefix);
    let result = stage_entries(runtime, &id, &prefix, uid, gid, entries).await;
    discard_container(runtime, &id).await;
    result
}

// =============================================================================
// Reading Back
// =============================================================================

/// Copies a single file out of a container.
pub async fn read_container_file(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    path: &str,
) -> Result<Vec<u8>> {
    let archive = runtime.copy_from_container(container_id, path).await?;
    let bytes = archive.collect().await.map_err(|e| Error::ArchiveCopyFailed {
        container: container_id.to_string(),
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    first_file(&bytes).ok_or_else(|| Error::ArchiveCopyFailed {
        container: container_id.to_string(),
        path: path.to_string(),
        reason: "archive holds no regular file".to_string(),
    })
}

/// Copies a single file out of a volume through a throwaway container.
pub async fn read_volume_file(
    runtime: &dyn ContainerRuntime,
    volume: &str,
    anchor_image: &str,
    path: &str,
) -> Result<Vec<u8>> {
    let spec = ContainerSpec::new(anchor_image)
        .with_binding(VolumeBinding::new(volume, VOLUME_STAGING_MOUNT));
    let id = runtime.create_container(&spec).await?;
    let result = read_container_file(runtime, &id, &join_path(VOLUME_STAGING_MOUNT, path)).await;
    discard_container(runtime, &id).await;
    result
}

/// Returns the contents of the first regular file in an uncompressed tar.
fn first_file(archive: &[u8]) -> Option<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    let entries = archive.entries().ok()?;
    for entry in entries {
        let mut entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            let mut out = Vec::new();
            entry.read_to_end(&mut out).ok()?;
            return Some(out);
        }
    }
    None
}
