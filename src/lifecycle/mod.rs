//! # Lifecycle Orchestrator
//!
//! Drives one build from request to exit code:
//!
//! ```text
//! validate ─► resolve builder ─► select platform level ─► compose builder
//!     ─► resolve run images ─► create volumes ─► stage app + platform env
//!     ─► phases ─► teardown (always)
//! ```
//!
//! ## Phase Sequences
//!
//! | Path | Sequence |
//! |------|----------|
//! | creator | `create` |
//! | < 0.7 | `detect` → `analyze` → `restore` → `build` → `export` |
//! | ≥ 0.7 | `analyze` → `detect` → `restore` → `build` → `export` |
//! | ≥ 0.10 + extensions | ... `restore` → `extend-build` → [`extend-run`, 0.12+] → `export` |
//!
//! A nonzero phase exit code ends the sequence and becomes the build's exit
//! code. It is not an error. Teardown removes every container and
//! non-retained volume the build created, plus the ephemeral builder image,
//! whatever the outcome.

mod args;
mod context;
mod phase;

pub use args::{daemon_access, phase_args, ArgContext};
pub use context::{
    decide_use_creator, BuildResources, BuildVolume, BuildVolumes, LifecycleExecutionContext,
    TrackingRuntime,
};
pub use phase::{opening_phases, Phase};

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::builder::{lifecycle_supported_platforms, select_platform_level, BuilderImage};
use crate::compositor::{self, CompositionPlan};
use crate::config::{BuildRequest, ValidatedRequest};
use crate::constants::{ANALYZED_PATH, LAYERS_DIR};
use crate::content::ContainerEntry;
use crate::document::AnalyzedMetadata;
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use crate::registry::ImagePuller;
use crate::runtime::{discard_container, ContainerRuntime, LogLine, LogStream};
use crate::streaming::{read_volume_file, stage_to_volume};
use crate::version::Version;

// =============================================================================
// Log Relay
// =============================================================================

/// Receives phase container output, line by line.
pub trait PhaseLogSink: Send + Sync {
    fn line(&self, phase: Phase, line: &LogLine);
}

/// Emits phase output as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl PhaseLogSink for TracingLogSink {
    fn line(&self, phase: Phase, line: &LogLine) {
        match line.stream {
            LogStream::Stdout => info!(phase = %phase, "{}", line.text),
            LogStream::Stderr => warn!(phase = %phase, "{}", line.text),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs builds against a [`ContainerRuntime`].
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    log_sink: Arc<dyn PhaseLogSink>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            log_sink: Arc::new(TracingLogSink),
        }
    }

    /// Replaces the default `tracing` log relay.
    pub fn with_log_sink(mut self, sink: Arc<dyn PhaseLogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Runs a build to completion and returns the last phase's exit code.
    pub async fn build(&self, request: &BuildRequest) -> Result<i64> {
        self.build_until(request, std::future::pending::<()>()).await
    }

    /// Like [`Orchestrator::build`], but gives up with [`Error::Interrupted`]
    /// once `shutdown` resolves. Teardown runs either way.
    pub async fn build_until<F>(&self, request: &BuildRequest, shutdown: F) -> Result<i64>
    where
        F: Future<Output = ()>,
    {
        let validated = request.validate()?;
        let tracker = TrackingRuntime::new(self.runtime.clone());

        let outcome = tokio::select! {
            result = self.run_build(&tracker, request, &validated) => result,
            _ = shutdown => {
                warn!("Shutdown requested, abandoning build of {}", validated.output);
                Err(Error::Interrupted)
            }
        };

        self.teardown(&tracker).await;
        match &outcome {
            Ok(0) => info!("Build of {} succeeded", validated.output),
            Ok(code) => warn!("Build of {} failed with exit code {}", validated.output, code),
            Err(e) => warn!("Build of {} failed: {}", validated.output, e),
        }
        outcome
    }

    async fn run_build(
        &self,
        runtime: &TrackingRuntime,
        request: &BuildRequest,
        validated: &ValidatedRequest,
    ) -> Result<i64> {
        let config = &request.config;
        let puller = ImagePuller::new(runtime, &config.docker);

        let original = BuilderImage::resolve(
            runtime,
            &puller,
            &validated.builder,
            &config.platform.environment,
            validated.run_image.clone(),
        )
        .await?;

        let level = select_level(runtime, &puller, &original, validated).await?;
        info!("Using platform API {}", level);

        let plan = CompositionPlan {
            lifecycle: validated.lifecycle_image.clone(),
            extensions: validated.extensions.clone(),
            buildpacks: validated.buildpacks.clone(),
            debug_script: validated.debug_script.clone(),
        };
        let builder = compositor::compose(runtime, &puller, &original, &plan).await?;

        let run_images = builder.get_run_images(runtime, level).await?;
        if config.docker.use_daemon {
            let primary = &run_images[..run_images.len().min(1)];
            puller.ensure(primary, builder.platform()).await?;
        }
        let builder = builder.with_run_images(run_images);

        let volumes = BuildVolumes::new(&config.cache);
        create_volumes(runtime, &volumes).await?;
        stage_inputs(runtime, request, &builder, &volumes).await?;

        let mut ctx = LifecycleExecutionContext::new(
            level,
            builder,
            volumes,
            validated.clone(),
            config.clone(),
        );
        self.run_phases(runtime, &mut ctx, &puller).await
    }

    async fn run_phases(
        &self,
        runtime: &dyn ContainerRuntime,
        ctx: &mut LifecycleExecutionContext,
        puller: &ImagePuller<'_>,
    ) -> Result<i64> {
        if ctx.use_creator() {
            return self.run_phase(runtime, ctx, Phase::Create).await;
        }

        for phase in opening_phases(ctx.level()) {
            let code = self.run_phase(runtime, ctx, phase).await?;
            if code != 0 {
                return Ok(code);
            }
            if phase == Phase::Detect && ctx.extensions_active() {
                apply_analyzed_run_image(runtime, ctx, puller).await?;
            }
        }

        let code = self.run_phase(runtime, ctx, Phase::Restore).await?;
        if code != 0 {
            return Ok(code);
        }

        if ctx.extensions_active() {
            let code = self.run_phase(runtime, ctx, Phase::ExtendBuild).await?;
            if code != 0 {
                return Ok(code);
            }
            if ctx.run_extend_requested() {
                let code = self.run_phase(runtime, ctx, Phase::ExtendRun).await?;
                if code != 0 {
                    return Ok(code);
                }
                ctx.mark_run_extended();
            }
        } else {
            let code = self.run_phase(runtime, ctx, Phase::Build).await?;
            if code != 0 {
                return Ok(code);
            }
        }

        self.run_phase(runtime, ctx, Phase::Export).await
    }

    async fn run_phase(
        &self,
        runtime: &dyn ContainerRuntime,
        ctx: &LifecycleExecutionContext,
        phase: Phase,
    ) -> Result<i64> {
        let spec = ctx.phase_spec(phase);
        info!("Running {} phase", phase);
        debug!("{} command: {}", phase, spec.command.join(" "));

        let id = runtime.create_container(&spec).await?;
        let result = self.drive_phase(runtime, phase, &id, ctx.config().log.timestamps).await;
        discard_container(runtime, &id).await;

        let code = result?;
        if code == 0 {
            info!("Phase {} completed", phase);
        } else {
            warn!("Phase {} exited with code {}", phase, code);
        }
        Ok(code)
    }

    async fn drive_phase(
        &self,
        runtime: &dyn ContainerRuntime,
        phase: Phase,
        id: &str,
        timestamps: bool,
    ) -> Result<i64> {
        runtime.start_container(id).await?;

        let sink = self.log_sink.as_ref();
        let mut relay = |line: LogLine| sink.line(phase, &line);
        runtime.stream_logs(id, timestamps, &mut relay).await?;

        runtime.wait_container(id).await
    }

    /// Best-effort removal of everything the build created.
    async fn teardown(&self, tracker: &TrackingRuntime) {
        let resources = tracker.resources();
        for id in resources.containers() {
            discard_container(tracker, id).await;
        }
        for volume in resources.volumes() {
            if volume.retained {
                debug!("Keeping volume {}", volume.name);
                continue;
            }
            if let Err(e) = tracker.remove_volume(&volume.name).await {
                warn!("Failed to remove volume {}: {}", volume.name, e);
            }
        }
        for image in resources.images() {
            if let Err(e) = tracker.remove_image(image).await {
                warn!("Failed to remove ephemeral builder {}: {}", image, e);
            }
        }
    }
}

async fn select_level(
    runtime: &dyn ContainerRuntime,
    puller: &ImagePuller<'_>,
    builder: &BuilderImage,
    validated: &ValidatedRequest,
) -> Result<Version> {
    match &validated.lifecycle_image {
        Some(lifecycle) => {
            let supported = lifecycle_supported_platforms(runtime, puller, lifecycle).await?;
            select_platform_level(
                validated.pinned_level,
                &format!("lifecycle image {}", lifecycle),
                &supported,
            )
        }
        None => select_platform_level(
            validated.pinned_level,
            &format!("builder {}", builder.reference()),
            builder.supported_platforms(),
        ),
    }
}

/// Creates the build's volumes. Each is recorded before creation so an
/// interrupted create is still reclaimed.
async fn create_volumes(runtime: &TrackingRuntime, volumes: &BuildVolumes) -> Result<()> {
    for volume in volumes.all() {
        if runtime.volume_exists(&volume.name).await? {
            debug!("Reusing volume {}", volume.name);
            continue;
        }
        runtime.track_volume(volume.clone());
        runtime.create_volume(&volume.name).await?;
        debug!("Created volume {} for {}", volume.name, volume.target);
    }
    Ok(())
}

/// Seeds the application and platform volumes.
async fn stage_inputs(
    runtime: &dyn ContainerRuntime,
    request: &BuildRequest,
    builder: &BuilderImage,
    volumes: &BuildVolumes,
) -> Result<()> {
    let anchor = builder.reference().canonical();
    let (uid, gid) = (builder.user_id(), builder.group_id());

    let mut app_entries = Vec::new();
    for content in &request.contents {
        app_entries.extend(content.entries()?);
    }
    info!("Staging {} application entries", app_entries.len());
    stage_to_volume(runtime, &volumes.app.name, &anchor, "", uid, gid, app_entries).await?;

    let env_entries: Vec<ContainerEntry> = request
        .config
        .platform
        .environment
        .iter()
        .map(|(key, value)| ContainerEntry::from_bytes(format!("env/{}", key), value.as_bytes(), None))
        .collect();
    if !env_entries.is_empty() {
        debug!("Staging {} platform environment entries", env_entries.len());
        stage_to_volume(runtime, &volumes.platform.name, &anchor, "", uid, gid, env_entries).await?;
    }
    Ok(())
}

/// Reads the detector's analyzed document and applies an extension-driven
/// run-image switch. The switch wins over a caller-chosen run image.
async fn apply_analyzed_run_image(
    runtime: &dyn ContainerRuntime,
    ctx: &mut LifecycleExecutionContext,
    puller: &ImagePuller<'_>,
) -> Result<()> {
    let path = ANALYZED_PATH.strip_prefix(LAYERS_DIR).unwrap_or(ANALYZED_PATH);
    let raw = read_volume_file(
        runtime,
        &ctx.volumes().output.name,
        &ctx.builder().reference().canonical(),
        path,
    )
    .await?;
    let analyzed = AnalyzedMetadata::parse(&String::from_utf8_lossy(&raw))?;

    if let Some(reference) = analyzed.run_image_reference() {
        let switched = ImageReference::parse(reference)?;
        if ctx.run_image() != Some(&switched) {
            info!("Extensions switched the run image to {}", switched);
            if ctx.config().docker.use_daemon {
                puller
                    .ensure(std::slice::from_ref(&switched), ctx.builder().platform())
                    .await?;
            }
            ctx.switch_run_image(switched);
        }
    }
    ctx.request_run_extend(analyzed.run_image_extend());
    Ok(())
}
