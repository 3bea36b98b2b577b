//! Recording in-memory container runtime shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use magikpack::error::{Error, Result};
use magikpack::runtime::{LogStream, VolumeBinding};
use magikpack::{
    ArchiveStream, ContainerRuntime, ContainerSpec, ImageInfo, ImageReference, ImageSummary, LogLine,
};

/// One archive received by `copy_to_container`.
#[derive(Debug, Clone)]
pub struct Upload {
    pub container: String,
    pub image: String,
    pub bindings: Vec<VolumeBinding>,
    pub path: String,
    pub bytes: Vec<u8>,
}

/// One tar member, as listed by [`tar_listing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub path: String,
    pub is_dir: bool,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub contents: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub images: HashMap<String, ImageInfo>,
    pub containers: HashMap<String, ContainerSpec>,
    pub created: Vec<(String, ContainerSpec)>,
    pub started: Vec<ContainerSpec>,
    pub removed_containers: Vec<String>,
    pub volumes: HashSet<String>,
    pub created_volumes: Vec<String>,
    pub removed_volumes: Vec<String>,
    pub removed_images: Vec<String>,
    pub committed: Vec<String>,
    pub tagged: Vec<(String, String)>,
    pub pulls: Vec<String>,
    pub uploads: Vec<Upload>,
    /// Raw tars served by `copy_from_container`, keyed by container path.
    pub archives: HashMap<String, Vec<u8>>,
    /// Exit codes keyed by lifecycle binary name. Missing means 0.
    pub exit_codes: HashMap<String, i64>,
    /// Lifecycle binary whose container never exits.
    pub hang_on: Option<String>,
    /// Number of upcoming pulls that fail.
    pub failing_pulls: u32,
    /// Pulls never complete.
    pub hang_pulls: bool,
    /// Every upload fails.
    pub fail_uploads: bool,
    /// Uploads into volume-bound containers never complete.
    pub hang_volume_uploads: bool,
    counter: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}-{}", prefix, self.counter)
    }
}

/// A [`ContainerRuntime`] that keeps everything in memory and records calls.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `f` against the locked state.
    pub fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Registers `info` under the canonical form of `reference`.
    pub fn add_image(&self, reference: &str, info: ImageInfo) {
        let key = canonical(reference);
        self.with(|s| s.images.insert(key, info));
    }

    /// Serves a single-file tar for `path`.
    pub fn serve_file(&self, path: &str, contents: &str) {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let tar = single_file_tar(&name, contents.as_bytes());
        self.with(|s| s.archives.insert(path.to_string(), tar));
    }

    /// Serves a tar holding a directory named after the last segment of
    /// `path` with one file in it.
    pub fn serve_directory(&self, path: &str, file: &str, contents: &str) {
        let dir = path.rsplit('/').next().unwrap_or(path).to_string();
        let tar = single_file_tar(&format!("{}/{}", dir, file), contents.as_bytes());
        self.with(|s| s.archives.insert(path.to_string(), tar));
    }

    pub fn set_exit_code(&self, binary: &str, code: i64) {
        self.with(|s| s.exit_codes.insert(binary.to_string(), code));
    }

    /// Lifecycle binaries started, in order, with `-kind` appended for the
    /// extender.
    pub fn phases(&self) -> Vec<String> {
        self.with(|s| s.started.iter().filter_map(phase_label).collect())
    }

    /// The started spec for lifecycle `binary`, first match.
    pub fn phase_spec(&self, binary: &str) -> Option<ContainerSpec> {
        self.with(|s| {
            s.started
                .iter()
                .find(|spec| lifecycle_binary(spec).as_deref() == Some(binary))
                .cloned()
        })
    }

    /// Every created container that was never removed.
    pub fn leaked_containers(&self) -> Vec<String> {
        self.with(|s| s.containers.keys().cloned().collect())
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.with(|s| s.uploads.clone())
    }
}

pub fn canonical(reference: &str) -> String {
    ImageReference::parse(reference).unwrap().canonical()
}

fn lifecycle_binary(spec: &ContainerSpec) -> Option<String> {
    spec.command
        .iter()
        .find_map(|part| part.strip_prefix("/cnb/lifecycle/"))
        .map(str::to_string)
}

fn phase_label(spec: &ContainerSpec) -> Option<String> {
    let binary = lifecycle_binary(spec)?;
    let kind = spec
        .command
        .iter()
        .position(|part| part == "-kind")
        .and_then(|i| spec.command.get(i + 1));
    Some(match kind {
        Some(kind) => format!("{}:{}", binary, kind),
        None => binary,
    })
}

fn missing(id: &str) -> Error {
    Error::ContainerNotFound(id.to_string())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.with(|s| {
            let id = s.next_id("ctr");
            s.containers.insert(id.clone(), spec.clone());
            s.created.push((id.clone(), spec.clone()));
            Ok(id)
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            let spec = s.containers.get(id).cloned().ok_or_else(|| missing(id))?;
            s.started.push(spec);
            Ok(())
        })
    }

    async fn stream_logs(
        &self,
        id: &str,
        _timestamps: bool,
        sink: &mut (dyn FnMut(LogLine) + Send),
    ) -> Result<()> {
        let spec = self.with(|s| s.containers.get(id).cloned()).ok_or_else(|| missing(id))?;
        if let Some(binary) = lifecycle_binary(&spec) {
            sink(LogLine {
                stream: LogStream::Stdout,
                text: format!("running {}", binary),
            });
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let (hang, code) = self.with(|s| {
            let spec = s.containers.get(id).cloned().ok_or_else(|| missing(id))?;
            let binary = lifecycle_binary(&spec);
            let hang = binary.is_some() && binary == s.hang_on;
            let code = binary
                .as_ref()
                .and_then(|b| s.exit_codes.get(b).copied())
                .unwrap_or(0);
            Ok::<_, Error>((hang, code))
        })?;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(code)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.containers.remove(id).ok_or_else(|| missing(id))?;
            s.removed_containers.push(id.to_string());
            Ok(())
        })
    }

    async fn copy_to_container(&self, id: &str, path: &str, archive: ArchiveStream) -> Result<()> {
        let collected = archive.collect().await;
        let hang = self.with(|s| {
            s.hang_volume_uploads
                && s.containers.get(id).map_or(false, |spec| !spec.bindings.is_empty())
        });
        if hang {
            std::future::pending::<()>().await;
        }
        self.with(|s| {
            let spec = s.containers.get(id).cloned().ok_or_else(|| missing(id))?;
            let fail = |reason: String| Error::ArchiveCopyFailed {
                container: id.to_string(),
                path: path.to_string(),
                reason,
            };
            if s.fail_uploads {
                return Err(fail("upload rejected".to_string()));
            }
            let bytes = collected.map_err(|e| fail(e.to_string()))?;
            s.uploads.push(Upload {
                container: id.to_string(),
                image: spec.image,
                bindings: spec.bindings,
                path: path.to_string(),
                bytes,
            });
            Ok(())
        })
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<ArchiveStream> {
        self.with(|s| {
            if !s.containers.contains_key(id) {
                return Err(missing(id));
            }
            s.archives
                .get(path)
                .cloned()
                .map(ArchiveStream::from_bytes)
                .ok_or_else(|| Error::ArchiveCopyFailed {
                    container: id.to_string(),
                    path: path.to_string(),
                    reason: "no such file".to_string(),
                })
        })
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.with(|s| {
            s.volumes.insert(name.to_string());
            s.created_volumes.push(name.to_string());
        });
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.with(|s| s.volumes.contains(name)))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.with(|s| {
            s.volumes.remove(name);
            s.removed_volumes.push(name.to_string());
        });
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        Ok(self.with(|s| s.images.get(reference).cloned()))
    }

    async fn pull_image(&self, reference: &str, _platform: Option<&str>) -> Result<()> {
        let hang = self.with(|s| {
            s.pulls.push(reference.to_string());
            s.hang_pulls
        });
        if hang {
            std::future::pending::<()>().await;
        }
        self.with(|s| {
            if s.failing_pulls > 0 {
                s.failing_pulls -= 1;
                return Err(Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: "registry unavailable".to_string(),
                });
            }
            s.images.entry(reference.to_string()).or_default();
            Ok(())
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.with(|s| {
            s.images
                .keys()
                .map(|name| ImageSummary {
                    id: format!("sha256:{}", name.len()),
                    repo_tags: vec![name.clone()],
                    repo_digests: Vec::new(),
                })
                .collect()
        }))
    }

    async fn commit_container(&self, id: &str) -> Result<String> {
        self.with(|s| {
            let spec = s.containers.get(id).cloned().ok_or_else(|| missing(id))?;
            let image_id = s.next_id("sha256:commit");
            let info = s.images.get(&spec.image).cloned().unwrap_or_default();
            s.images.insert(image_id.clone(), info);
            s.committed.push(id.to_string());
            Ok(image_id)
        })
    }

    async fn tag_image(&self, image_id: &str, reference: &str) -> Result<()> {
        self.with(|s| {
            let info = s.images.get(image_id).cloned().ok_or_else(|| Error::ImageNotFound {
                reference: image_id.to_string(),
            })?;
            s.images.insert(reference.to_string(), info);
            s.tagged.push((image_id.to_string(), reference.to_string()));
            Ok(())
        })
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.with(|s| {
            s.images.remove(reference);
            s.removed_images.push(reference.to_string());
        });
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A builder image declaring `levels` and a stack run image.
pub fn builder_info(levels: &[&str], run_image: &str, extensions: bool) -> ImageInfo {
    let levels: Vec<String> = levels.iter().map(|l| format!("\"{}\"", l)).collect();
    let metadata = format!(
        r#"{{"lifecycle":{{"apis":{{"platform":{{"supported":[{}]}}}}}},"stack":{{"runImage":{{"image":"{}","mirrors":["mirror.example.com/run:base"]}}}}}}"#,
        levels.join(","),
        run_image
    );
    let mut info = ImageInfo {
        id: "sha256:builder".to_string(),
        env: vec!["CNB_USER_ID=1001".to_string(), "CNB_GROUP_ID=1002".to_string()],
        os: "linux".to_string(),
        architecture: "amd64".to_string(),
        ..Default::default()
    };
    info.labels
        .insert("io.buildpacks.builder.metadata".to_string(), metadata);
    if extensions {
        info.labels.insert(
            "io.buildpacks.extension.layers".to_string(),
            r#"{"samples/curl":{"0.0.1":{"api":"0.10"}}}"#.to_string(),
        );
    }
    info
}

/// A lifecycle image declaring `levels`.
pub fn lifecycle_info(levels: &[&str]) -> ImageInfo {
    let levels: Vec<String> = levels.iter().map(|l| format!("\"{}\"", l)).collect();
    let mut info = ImageInfo::default();
    info.labels.insert(
        "io.buildpacks.lifecycle.apis".to_string(),
        format!(r#"{{"platform":{{"supported":[{}]}}}}"#, levels.join(",")),
    );
    info
}

pub fn single_file_tar(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

/// Lists a tar, gunzipping it first when it starts with the gzip magic.
pub fn tar_listing(bytes: &[u8]) -> Vec<Member> {
    let raw = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
        out
    } else {
        bytes.to_vec()
    };
    let mut archive = tar::Archive::new(raw.as_slice());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let header = entry.header().clone();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            Member {
                path: entry
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string(),
                is_dir: header.entry_type().is_dir(),
                uid: header.uid().unwrap(),
                gid: header.gid().unwrap(),
                mode: header.mode().unwrap(),
                contents,
            }
        })
        .collect()
}
