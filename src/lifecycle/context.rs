//! Per-build execution state.
//!
//! [`LifecycleExecutionContext`] lives for exactly one build. It owns the
//! volume set, the platform level and creator decision, the composed
//! builder, and the run-image switch discovered after detection.
//! [`BuildResources`] tracks what teardown has to remove, filled in by
//! [`TrackingRuntime`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::warn;

use crate::builder::BuilderImage;
use crate::config::{BuildConfig, CacheConfig, ValidatedRequest, VolumeConfig};
use crate::constants::{
    APP_DIR, CACHE_DIR, DEBUG_SCRIPT_PATH, DEFAULT_DOCKER_SOCKET, ENV_EXPERIMENTAL_MODE,
    ENV_PLATFORM_API, KANIKO_DIR, LAUNCH_CACHE_DIR, LAYERS_DIR, PLATFORM_DIR, PLATFORM_RUN_TOML,
    VOLUME_NAME_PREFIX,
};
use crate::error::Result;
use crate::reference::ImageReference;
use crate::runtime::{
    ArchiveStream, ContainerRuntime, ContainerSpec, ImageInfo, ImageSummary, LogLine, VolumeBinding,
};
use crate::version::Version;

use super::args::{self, ArgContext};
use super::phase::Phase;

// =============================================================================
// Volumes
// =============================================================================

/// A named volume and where phases see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVolume {
    pub name: String,
    pub target: &'static str,
    /// Survives teardown.
    pub retained: bool,
}

impl BuildVolume {
    fn configured(kind: &str, target: &'static str, config: &VolumeConfig) -> Self {
        Self {
            name: config.name.clone().unwrap_or_else(|| generated_name(kind)),
            target,
            retained: config.retained(),
        }
    }

    fn ephemeral(kind: &str, target: &'static str) -> Self {
        Self {
            name: generated_name(kind),
            target,
            retained: false,
        }
    }
}

fn generated_name(kind: &str) -> String {
    format!("{}-{}-{}", VOLUME_NAME_PREFIX, kind, uuid::Uuid::now_v7().simple())
}

/// Every volume a build binds into its phases.
#[derive(Debug, Clone)]
pub struct BuildVolumes {
    pub build_cache: BuildVolume,
    pub launch_cache: BuildVolume,
    pub kaniko: BuildVolume,
    pub app: BuildVolume,
    pub output: BuildVolume,
    pub platform: BuildVolume,
}

impl BuildVolumes {
    pub fn new(cache: &CacheConfig) -> Self {
        Self {
            build_cache: BuildVolume::configured("build-cache", CACHE_DIR, &cache.build),
            launch_cache: BuildVolume::configured("launch-cache", LAUNCH_CACHE_DIR, &cache.launch),
            kaniko: BuildVolume::configured("kaniko", KANIKO_DIR, &cache.kaniko),
            app: BuildVolume::ephemeral("app", APP_DIR),
            output: BuildVolume::ephemeral("layers", LAYERS_DIR),
            platform: BuildVolume::ephemeral("platform", PLATFORM_DIR),
        }
    }

    pub fn all(&self) -> [&BuildVolume; 6] {
        [
            &self.build_cache,
            &self.launch_cache,
            &self.kaniko,
            &self.app,
            &self.output,
            &self.platform,
        ]
    }
}

// =============================================================================
// Creator Decision
// =============================================================================

/// Whether to run the single creator phase.
///
/// An explicit `false` always wins. Trusting a builder that carries
/// extensions is refused with a warning. Unset trust means "creator when
/// there are no extensions".
pub fn decide_use_creator(trust_builder: Option<bool>, has_extensions: bool) -> bool {
    match trust_builder {
        Some(false) => false,
        Some(true) if has_extensions => {
            warn!("Builder has extensions and cannot be trusted; running the full phase sequence");
            false
        }
        Some(true) => true,
        None => !has_extensions,
    }
}

// =============================================================================
// Execution Context
// =============================================================================

/// State for one build.
#[derive(Debug, Clone)]
pub struct LifecycleExecutionContext {
    level: Version,
    use_creator: bool,
    builder: BuilderImage,
    volumes: BuildVolumes,
    run_extend: bool,
    run_extended: bool,
    debug: bool,
    request: ValidatedRequest,
    config: BuildConfig,
}

impl LifecycleExecutionContext {
    pub fn new(
        level: Version,
        builder: BuilderImage,
        volumes: BuildVolumes,
        request: ValidatedRequest,
        config: BuildConfig,
    ) -> Self {
        let use_creator = decide_use_creator(config.platform.trust_builder, builder.has_extensions());
        Self {
            level,
            use_creator,
            debug: request.debug_script.is_some(),
            builder,
            volumes,
            run_extend: false,
            run_extended: false,
            request,
            config,
        }
    }

    pub fn level(&self) -> Version {
        self.level
    }

    pub fn use_creator(&self) -> bool {
        self.use_creator
    }

    /// The composed builder phases run from.
    pub fn builder(&self) -> &BuilderImage {
        &self.builder
    }

    pub fn volumes(&self) -> &BuildVolumes {
        &self.volumes
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Extensions are present and the platform level supports them.
    pub fn extensions_active(&self) -> bool {
        self.arg_context().extensions_active()
    }

    /// Primary run image currently in effect.
    pub fn run_image(&self) -> Option<&ImageReference> {
        self.builder.resolved_run_images().and_then(|images| images.first())
    }

    /// Replaces the resolved run-image set with `run_image`.
    pub fn switch_run_image(&mut self, run_image: ImageReference) {
        self.builder = self.builder.with_run_images(vec![run_image]);
    }

    /// Records the analyzed document's `run-image.extend`; only honoured from 0.12.
    pub fn request_run_extend(&mut self, extend: bool) {
        self.run_extend = extend && self.level.at_least(PLATFORM_RUN_TOML);
    }

    pub fn run_extend_requested(&self) -> bool {
        self.run_extend
    }

    pub fn mark_run_extended(&mut self) {
        self.run_extended = true;
    }

    pub fn run_extended(&self) -> bool {
        self.run_extended
    }

    pub fn arg_context(&self) -> ArgContext<'_> {
        ArgContext {
            level: self.level,
            has_extensions: self.builder.has_extensions(),
            use_daemon: self.config.docker.use_daemon,
            clean_cache: self.config.platform.clean_cache,
            uid: self.builder.user_id(),
            gid: self.builder.group_id(),
            output: &self.request.output,
            tags: &self.request.tags,
            run_image: self.run_image(),
            run_image_override: self.builder.run_image_override().is_some(),
            run_extended: self.run_extended,
            builder_image: self.builder.reference(),
            log_level: self.config.log.level.as_deref(),
        }
    }

    /// Container spec for one phase.
    pub fn phase_spec(&self, phase: Phase) -> ContainerSpec {
        let ctx = self.arg_context();

        let mut command = Vec::new();
        if self.debug {
            command.push(DEBUG_SCRIPT_PATH.to_string());
        }
        command.push(phase.binary_path());
        command.extend(args::phase_args(phase, &ctx));

        let user = if phase.runs_as_root() {
            "root".to_string()
        } else {
            format!("{}:{}", ctx.uid, ctx.gid)
        };

        let mut spec = ContainerSpec::new(self.builder.reference().canonical())
            .with_command(command)
            .with_user(user)
            .with_env(ENV_PLATFORM_API, self.level.to_string());
        if ctx.extensions_active() {
            spec = spec.with_env(ENV_EXPERIMENTAL_MODE, "warn");
        }
        for volume in self.volumes.all() {
            spec = spec.with_binding(VolumeBinding::new(volume.name.as_str(), volume.target));
        }
        if args::daemon_access(phase, &ctx) {
            spec = spec.with_binding(VolumeBinding::new(
                self.config.docker.socket_path.as_str(),
                DEFAULT_DOCKER_SOCKET,
            ));
        }
        spec.network = self.config.docker.network.clone();
        spec.security_options = self.config.docker.security_options.clone();
        spec
    }
}

// =============================================================================
// Teardown Tracking
// =============================================================================

/// Resources a build created and teardown must reclaim.
#[derive(Debug, Default, Clone)]
pub struct BuildResources {
    volumes: Vec<BuildVolume>,
    containers: Vec<String>,
    images: Vec<String>,
}

impl BuildResources {
    pub fn track_volume(&mut self, volume: BuildVolume) {
        self.volumes.push(volume);
    }

    pub fn track_container(&mut self, id: &str) {
        self.containers.push(id.to_string());
    }

    pub fn release_container(&mut self, id: &str) {
        self.containers.retain(|c| c != id);
    }

    pub fn track_image(&mut self, reference: &str) {
        if !self.images.iter().any(|image| image == reference) {
            self.images.push(reference.to_string());
        }
    }

    pub fn volumes(&self) -> &[BuildVolume] {
        &self.volumes
    }

    /// Containers created and not yet removed.
    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    /// Images the build tagged.
    pub fn images(&self) -> &[String] {
        &self.images
    }
}

/// A [`ContainerRuntime`] that records into a [`BuildResources`] ledger.
///
/// Every container created through it stays in the ledger until a removal
/// succeeds, and every tagged image is kept for teardown. Cancelling a build
/// mid-operation therefore never hides a throwaway container from teardown.
pub struct TrackingRuntime {
    inner: Arc<dyn ContainerRuntime>,
    resources: Mutex<BuildResources>,
}

impl TrackingRuntime {
    pub fn new(inner: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            inner,
            resources: Mutex::new(BuildResources::default()),
        }
    }

    /// Records a volume before it is created.
    pub fn track_volume(&self, volume: BuildVolume) {
        self.ledger().track_volume(volume);
    }

    /// A snapshot of the ledger.
    pub fn resources(&self) -> BuildResources {
        self.ledger().clone()
    }

    fn ledger(&self) -> MutexGuard<'_, BuildResources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ContainerRuntime for TrackingRuntime {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.inner.create_container(spec).await?;
        self.ledger().track_container(&id);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.inner.start_container(id).await
    }

    async fn stream_logs(
        &self,
        id: &str,
        timestamps: bool,
        sink: &mut (dyn FnMut(LogLine) + Send),
    ) -> Result<()> {
        self.inner.stream_logs(id, timestamps, sink).await
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        self.inner.wait_container(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.inner.remove_container(id).await?;
        self.ledger().release_container(id);
        Ok(())
    }

    async fn copy_to_container(&self, id: &str, path: &str, archive: ArchiveStream) -> Result<()> {
        self.inner.copy_to_container(id, path, archive).await
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<ArchiveStream> {
        self.inner.copy_from_container(id, path).await
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.inner.create_volume(name).await
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.inner.volume_exists(name).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.inner.remove_volume(name).await
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        self.inner.inspect_image(reference).await
    }

    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<()> {
        self.inner.pull_image(reference, platform).await
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.inner.list_images().await
    }

    async fn commit_container(&self, id: &str) -> Result<String> {
        self.inner.commit_container(id).await
    }

    async fn tag_image(&self, image: &str, reference: &str) -> Result<()> {
        // Recorded first: a tag that lands after cancellation must still go.
        self.ledger().track_image(reference);
        self.inner.tag_image(image, reference).await
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.inner.remove_image(reference).await
    }
}
