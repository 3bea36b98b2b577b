//! # Ephemeral Builder Compositor
//!
//! Recomposes a builder image at build time:
//!
//! ```text
//!   base builder ──create──► base container
//!                                 │  ◄── /cnb/lifecycle   (lifecycle image)
//!                                 │  ◄── /cnb/extensions  (each extension image)
//!                                 │  ◄── /cnb/buildpacks  (each buildpack image)
//!                                 │  ◄── mount dirs owned by uid:gid
//!                                 │  ◄── debug wrapper (optional)
//!                                 ▼
//!                    commit ──► tag magikpack-ephemeral-builder:<id>
//! ```
//!
//! Every auxiliary container is removed whatever happens to the copy, and
//! the base container is removed on every path once the image is tagged or
//! composition has failed.

use tracing::{debug, info};

use crate::builder::BuilderImage;
use crate::constants::{
    BUILDER_MOUNT_DIRS, BUILDPACKS_DIR, DEBUG_SCRIPT_PATH, EPHEMERAL_BUILDER_REPOSITORY,
    EXTENSIONS_DIR, LIFECYCLE_DIR,
};
use crate::content::ContainerEntry;
use crate::error::Result;
use crate::reference::ImageReference;
use crate::registry::ImagePuller;
use crate::runtime::{discard_container, ContainerRuntime, ContainerSpec};
use crate::streaming::stage_entries;

/// Mode of the injected debug wrapper.
const DEBUG_SCRIPT_MODE: u32 = 0o755;

/// What to merge into the base builder.
#[derive(Debug, Clone, Default)]
pub struct CompositionPlan {
    /// Image whose `/cnb/lifecycle` replaces the builder's.
    pub lifecycle: Option<ImageReference>,
    /// Images whose `/cnb/extensions` are merged in.
    pub extensions: Vec<ImageReference>,
    /// Images whose `/cnb/buildpacks` are merged in.
    pub buildpacks: Vec<ImageReference>,
    /// Wrapper script prefixed to every phase command.
    pub debug_script: Option<String>,
}

impl CompositionPlan {
    /// Every auxiliary image paired with the directory copied out of it.
    pub fn sources(&self) -> Vec<(&ImageReference, &'static str)> {
        self.lifecycle
            .iter()
            .map(|image| (image, LIFECYCLE_DIR))
            .chain(self.extensions.iter().map(|image| (image, EXTENSIONS_DIR)))
            .chain(self.buildpacks.iter().map(|image| (image, BUILDPACKS_DIR)))
            .collect()
    }
}

/// Composes an ephemeral builder from `base` and returns it, derived from
/// `base` under its new tag.
pub async fn compose(
    runtime: &dyn ContainerRuntime,
    puller: &ImagePuller<'_>,
    base: &BuilderImage,
    plan: &CompositionPlan,
) -> Result<BuilderImage> {
    let auxiliary: Vec<ImageReference> = plan.sources().into_iter().map(|(image, _)| image.clone()).collect();
    if !auxiliary.is_empty() {
        puller.ensure(&auxiliary, base.platform()).await?;
    }

    let spec = ContainerSpec::new(base.reference().canonical());
    let base_id = runtime.create_container(&spec).await?;
    debug!("Composing ephemeral builder in container {}", base_id);

    let result = populate_and_commit(runtime, base, plan, &base_id).await;
    discard_container(runtime, &base_id).await;
    let tag = result?;

    info!("Composed ephemeral builder {}", tag);
    Ok(base.derive(tag, !plan.extensions.is_empty()))
}

async fn populate_and_commit(
    runtime: &dyn ContainerRuntime,
    base: &BuilderImage,
    plan: &CompositionPlan,
    base_id: &str,
) -> Result<ImageReference> {
    for (image, directory) in plan.sources() {
        copy_directory(runtime, image, directory, base_id).await?;
    }

    let mount_dirs = BUILDER_MOUNT_DIRS
        .iter()
        .map(|dir| ContainerEntry::directory(*dir, None))
        .collect();
    stage_entries(runtime, base_id, "", base.user_id(), base.group_id(), mount_dirs).await?;

    if let Some(script) = &plan.debug_script {
        debug!("Injecting debug wrapper at {}", DEBUG_SCRIPT_PATH);
        let entry = ContainerEntry::from_bytes(DEBUG_SCRIPT_PATH, script.as_bytes(), Some(DEBUG_SCRIPT_MODE));
        stage_entries(runtime, base_id, "", 0, 0, vec![entry]).await?;
    }

    let image_id = runtime.commit_container(base_id).await?;
    let tag = ephemeral_tag()?;
    runtime.tag_image(&image_id, &tag.canonical()).await?;
    Ok(tag)
}

/// Copies `directory` out of `image` and into `/cnb` of `target_id`.
async fn copy_directory(
    runtime: &dyn ContainerRuntime,
    image: &ImageReference,
    directory: &str,
    target_id: &str,
) -> Result<()> {
    info!("Merging {} from {}", directory, image);
    let id = runtime.create_container(&ContainerSpec::new(image.canonical())).await?;

    let result = async {
        let archive = runtime.copy_from_container(&id, directory).await?;
        runtime.copy_to_container(target_id, parent_of(directory), archive).await
    }
    .await;

    discard_container(runtime, &id).await;
    result
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// A fresh `magikpack-ephemeral-builder:<id>` reference.
pub fn ephemeral_tag() -> Result<ImageReference> {
    let suffix = uuid::Uuid::now_v7().simple().to_string();
    ImageReference::parse(EPHEMERAL_BUILDER_REPOSITORY)?.with_tag(&suffix)
}
