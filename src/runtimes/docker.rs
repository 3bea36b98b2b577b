//! Docker-compatible CLI gateway.
//!
//! Implements [`ContainerRuntime`] by spawning the configured CLI (`docker`,
//! `podman`, ...) with `tokio::process`. Archives are piped through the
//! CLI's `cp -` mode in both directions, so nothing is staged on the host
//! filesystem.
//!
//! | Operation | Command |
//! |-----------|---------|
//! | create | `create [--user] [-e] [--security-opt] [--network] [-v] [--entrypoint] IMAGE [ARGS]` |
//! | logs | `logs --follow [--timestamps] ID` |
//! | copy in / out | `cp - ID:PATH` / `cp ID:PATH -` |
//! | inspect | `image inspect REF` (JSON) |
//! | list | `image ls --no-trunc --format {{json .}}` |

use std::collections::HashMap;
use std::io;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::config::DockerConfig;
use crate::constants::{ARCHIVE_CHANNEL_DEPTH, ARCHIVE_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::runtime::{
    ArchiveStream, ContainerRuntime, ContainerSpec, ImageInfo, ImageSummary, LogLine, LogStream,
};

/// Placeholder the CLI prints for untagged or undigested images.
const NONE_MARKER: &str = "<none>";

/// [`ContainerRuntime`] backed by a Docker-compatible command line.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    binary: String,
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &DockerConfig) -> Self {
        Self::new(config.binary.as_str())
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Runs the CLI to completion, returning its output whatever the status.
    async fn output(&self, operation: &str, args: &[String]) -> Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        self.command(args)
            .output()
            .await
            .map_err(|e| Error::runtime(operation, format!("failed to spawn {}: {}", self.binary, e)))
    }

    /// Runs the CLI and returns trimmed stdout, failing on a nonzero status.
    async fn run(&self, operation: &str, args: Vec<String>) -> Result<String> {
        let output = self.output(operation, &args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::runtime(operation, stderr_of(&output)))
        }
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// `create` arguments for `spec`.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = owned(&["create"]);
    if let Some(user) = &spec.user {
        args.extend(owned(&["--user", user.as_str()]));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for option in &spec.security_options {
        args.extend(owned(&["--security-opt", option.as_str()]));
    }
    if let Some(network) = &spec.network {
        args.extend(owned(&["--network", network.as_str()]));
    }
    for binding in &spec.bindings {
        args.push("-v".to_string());
        args.push(format!("{}:{}", binding.source, binding.target));
    }
    match spec.command.split_first() {
        Some((entrypoint, rest)) => {
            args.extend(owned(&["--entrypoint", entrypoint.as_str()]));
            args.push(spec.image.clone());
            args.extend(rest.iter().cloned());
        }
        None => args.push(spec.image.clone()),
    }
    args
}

// =============================================================================
// JSON Formats
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    repo_tags: Option<Vec<String>>,
    repo_digests: Option<Vec<String>>,
    os: Option<String>,
    architecture: Option<String>,
    config: Option<InspectedConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    env: Option<Vec<String>>,
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedImage {
    #[serde(rename = "ID")]
    id: String,
    repository: String,
    tag: String,
    digest: Option<String>,
}

/// Parses `image inspect` output; `None` for an empty array.
pub fn parse_inspect(raw: &str) -> Result<Option<ImageInfo>> {
    let images: Vec<InspectedImage> =
        serde_json::from_str(raw).map_err(|e| Error::document("image inspect output", e))?;
    Ok(images.into_iter().next().map(|image| {
        let config = image.config.unwrap_or(InspectedConfig {
            env: None,
            labels: None,
        });
        ImageInfo {
            id: image.id,
            labels: config.labels.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            os: image.os.unwrap_or_default(),
            architecture: image.architecture.unwrap_or_default(),
            repo_tags: image.repo_tags.unwrap_or_default(),
            repo_digests: image.repo_digests.unwrap_or_default(),
        }
    }))
}

/// Parses `image ls --format {{json .}}` output, one object per line.
pub fn parse_image_list(raw: &str) -> Result<Vec<ImageSummary>> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let listed: ListedImage =
                serde_json::from_str(line).map_err(|e| Error::document("image ls output", e))?;
            let mut summary = ImageSummary {
                id: listed.id,
                ..Default::default()
            };
            if listed.repository != NONE_MARKER {
                if listed.tag != NONE_MARKER {
                    summary
                        .repo_tags
                        .push(format!("{}:{}", listed.repository, listed.tag));
                }
                if let Some(digest) = listed.digest.filter(|d| d != NONE_MARKER && !d.is_empty()) {
                    summary
                        .repo_digests
                        .push(format!("{}@{}", listed.repository, digest));
                }
            }
            Ok(summary)
        })
        .collect()
}

// =============================================================================
// Gateway
// =============================================================================

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.output("create", &create_args(spec)).await?;
        if !output.status.success() {
            return Err(Error::CreateFailed {
                image: spec.image.clone(),
                reason: stderr_of(&output),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Created container {} from {}", id, spec.image);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let output = self.output("start", &owned(&["start", id])).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::StartFailed {
                id: id.to_string(),
                reason: stderr_of(&output),
            })
        }
    }

    async fn stream_logs(
        &self,
        id: &str,
        timestamps: bool,
        sink: &mut (dyn FnMut(LogLine) + Send),
    ) -> Result<()> {
        let mut args = owned(&["logs", "--follow"]);
        if timestamps {
            args.push("--timestamps".to_string());
        }
        args.push(id.to_string());
        debug!("{} {}", self.binary, args.join(" "));

        let mut child = self
            .command(&args)
            .spawn()
            .map_err(|e| Error::runtime("logs", e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("log stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("log stderr not captured".to_string()))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(text)) => sink(LogLine { stream: LogStream::Stdout, text }),
                    Ok(None) => out_done = true,
                    Err(e) => return Err(Error::runtime("logs", e)),
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(text)) => sink(LogLine { stream: LogStream::Stderr, text }),
                    Ok(None) => err_done = true,
                    Err(e) => return Err(Error::runtime("logs", e)),
                },
            }
        }

        let status = child.wait().await.map_err(|e| Error::runtime("logs", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::runtime("logs", format!("{} logs exited with {}", self.binary, status)))
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let stdout = self.run("wait", owned(&["wait", id])).await?;
        stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| Error::runtime("wait", format!("unexpected exit status '{}'", stdout)))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let output = self.output("rm", &owned(&["rm", "--force", id])).await?;
        if output.status.success() {
            return Ok(());
        }
        let reason = stderr_of(&output);
        if is_missing(&reason) {
            Err(Error::ContainerNotFound(id.to_string()))
        } else {
            Err(Error::runtime("rm", reason))
        }
    }

    async fn copy_to_container(&self, id: &str, path: &str, mut archive: ArchiveStream) -> Result<()> {
        let target = format!("{}:{}", id, path);
        debug!("{} cp - {}", self.binary, target);
        let copy_error = |reason: String| Error::ArchiveCopyFailed {
            container: id.to_string(),
            path: path.to_string(),
            reason,
        };

        let mut cmd = self.command(["cp", "-", target.as_str()]);
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| copy_error(e.to_string()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("cp stdin not captured".to_string()))?;

        let mut failure = None;
        while let Some(chunk) = archive.recv().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(e) = stdin.write_all(&bytes).await {
                        failure = Some(e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(format!("archive producer failed: {}", e));
                    break;
                }
            }
        }
        if let Some(reason) = failure {
            // Kill while stdin is still open: EOF would let the CLI commit a
            // truncated archive.
            let _ = child.kill().await;
            drop(stdin);
            return Err(copy_error(reason));
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| copy_error(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let reason = stderr_of(&output);
        if is_missing(&reason) && reason.to_ascii_lowercase().contains("container") {
            Err(Error::ContainerNotFound(id.to_string()))
        } else {
            Err(copy_error(reason))
        }
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<ArchiveStream> {
        let source = format!("{}:{}", id, path);
        debug!("{} cp {} -", self.binary, source);

        let mut child = self
            .command(["cp", source.as_str(), "-"])
            .spawn()
            .map_err(|e| Error::ArchiveCopyFailed {
                container: id.to_string(),
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("cp stdout not captured".to_string()))?;

        let (sender, stream) = ArchiveStream::channel(ARCHIVE_CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut buf = vec![0u8; ARCHIVE_CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if !sender.send(buf[..n].to_vec()).await {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Err(e) => {
                        sender.fail(e).await;
                        return;
                    }
                }
            }
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    sender
                        .fail(io::Error::new(io::ErrorKind::Other, stderr_of(&output)))
                        .await
                }
                Err(e) => sender.fail(e).await,
            }
        });
        Ok(stream)
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.run("volume create", owned(&["volume", "create", name]))
            .await
            .map(|_| ())
            .map_err(|e| Error::VolumeFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let output = self
            .output("volume inspect", &owned(&["volume", "inspect", name]))
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let reason = stderr_of(&output);
        if is_missing(&reason) {
            Ok(false)
        } else {
            Err(Error::VolumeFailed {
                name: name.to_string(),
                reason,
            })
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run("volume rm", owned(&["volume", "rm", "--force", name]))
            .await
            .map(|_| ())
            .map_err(|e| Error::VolumeFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let output = self
            .output("image inspect", &owned(&["image", "inspect", reference]))
            .await?;
        if !output.status.success() {
            let reason = stderr_of(&output);
            return if is_missing(&reason) {
                Ok(None)
            } else {
                Err(Error::runtime("image inspect", reason))
            };
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<()> {
        let mut args = owned(&["pull"]);
        if let Some(platform) = platform {
            args.extend(owned(&["--platform", platform]));
        }
        args.push(reference.to_string());

        let output = self.output("pull", &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: stderr_of(&output),
            })
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let stdout = self
            .run(
                "image ls",
                owned(&["image", "ls", "--no-trunc", "--format", "{{json .}}"]),
            )
            .await?;
        parse_image_list(&stdout)
    }

    async fn commit_container(&self, id: &str) -> Result<String> {
        self.run("commit", owned(&["commit", id])).await
    }

    async fn tag_image(&self, image: &str, reference: &str) -> Result<()> {
        self.run("tag", owned(&["tag", image, reference])).await.map(|_| ())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.run("rmi", owned(&["rmi", "--force", reference]))
            .await
            .map(|_| ())
    }
}
