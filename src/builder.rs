//! Builder image metadata.
//!
//! A [`BuilderImage`] is a snapshot of the facts a build needs from its
//! builder: build uid/gid, whether extensions are present, the platform API
//! levels its lifecycle supports, and the run images it points at.
//!
//! ## Where Facts Come From
//!
//! | Fact | Source |
//! |------|--------|
//! | uid / gid | 1000/1000, then image env `CNB_USER_ID`/`CNB_GROUP_ID`, then platform env |
//! | extensions | `io.buildpacks.extension.layers` label, non-empty |
//! | platform levels | `io.buildpacks.builder.metadata` → `lifecycle.apis.platform.supported` |
//! | run images (< 0.12) | same label → `stack.runImage.image` (+ mirrors) |
//! | run images (≥ 0.12) | `/cnb/run.toml` → `images[].image` |
//!
//! A builder recomposed at build time is [`BuilderImage::derive`]d from the
//! original: same identity and metadata, new reference.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::constants::{
    BUILDER_METADATA_LABEL, DEFAULT_BUILD_GID, DEFAULT_BUILD_UID, ENV_GROUP_ID, ENV_USER_ID,
    EXTENSION_LAYERS_LABEL, LIFECYCLE_APIS_LABEL, PLATFORM_RUN_TOML, RUN_TOML_PATH,
    SUPPORTED_PLATFORM_LEVELS,
};
use crate::document::{self, RunMetadata};
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use crate::registry::ImagePuller;
use crate::runtime::{discard_container, ContainerRuntime, ContainerSpec, ImageInfo};
use crate::streaming::read_container_file;
use crate::version::Version;

/// Build-relevant facts about one builder image.
#[derive(Debug, Clone)]
pub struct BuilderImage {
    reference: ImageReference,
    user_id: u32,
    group_id: u32,
    has_extensions: bool,
    platform: Option<String>,
    supported_platforms: Vec<Version>,
    stack_run_images: Vec<String>,
    run_image_override: Option<ImageReference>,
    run_images: Option<Vec<ImageReference>>,
}

impl BuilderImage {
    /// Pulls (per policy) and inspects `reference`.
    pub async fn resolve(
        runtime: &dyn ContainerRuntime,
        puller: &ImagePuller<'_>,
        reference: &ImageReference,
        platform_env: &BTreeMap<String, String>,
        run_image_override: Option<ImageReference>,
    ) -> Result<Self> {
        puller.ensure(std::slice::from_ref(reference), None).await?;
        let info = inspect_required(runtime, reference).await?;
        let builder = Self::from_image_info(reference.clone(), &info, platform_env, run_image_override)?;
        info!(
            "Builder {}: uid={} gid={} extensions={} platforms=[{}]",
            builder.reference,
            builder.user_id,
            builder.group_id,
            builder.has_extensions,
            join_versions(&builder.supported_platforms)
        );
        Ok(builder)
    }

    /// Builds the snapshot from an inspected image.
    pub fn from_image_info(
        reference: ImageReference,
        info: &ImageInfo,
        platform_env: &BTreeMap<String, String>,
        run_image_override: Option<ImageReference>,
    ) -> Result<Self> {
        let id_from = |key: &str, fallback: u32| -> Result<u32> {
            let value = platform_env
                .get(key)
                .map(String::as_str)
                .or_else(|| info.env_value(key));
            match value {
                Some(raw) => raw.trim().parse().map_err(|_| Error::BuilderMetadata {
                    image: reference.canonical(),
                    reason: format!("{} is not a numeric id: '{}'", key, raw),
                }),
                None => Ok(fallback),
            }
        };
        let user_id = id_from(ENV_USER_ID, DEFAULT_BUILD_UID)?;
        let group_id = id_from(ENV_GROUP_ID, DEFAULT_BUILD_GID)?;

        let has_extensions = info
            .label(EXTENSION_LAYERS_LABEL)
            .is_some_and(document::label_has_content);

        let metadata_error = |reason: String| Error::BuilderMetadata {
            image: reference.canonical(),
            reason,
        };
        let raw = info
            .label(BUILDER_METADATA_LABEL)
            .ok_or_else(|| metadata_error(format!("missing label {}", BUILDER_METADATA_LABEL)))?;
        let metadata = document::parse_json(BUILDER_METADATA_LABEL, raw)
            .map_err(|e| metadata_error(e.to_string()))?;

        // Older builders carry a single `lifecycle.api.platform` value.
        let levels = document::string_array_at(&metadata, "lifecycle/apis/platform/supported")
            .or_else(|| document::string_at(&metadata, "lifecycle/api/platform").map(|v| vec![v]))
            .ok_or_else(|| metadata_error("no supported platform levels declared".to_string()))?;
        let supported_platforms = parse_levels(&levels).map_err(|e| metadata_error(e.to_string()))?;
        if supported_platforms.is_empty() {
            return Err(metadata_error("supported platform level list is empty".to_string()));
        }

        let mut stack_run_images: Vec<String> = document::string_at(&metadata, "stack/runImage/image")
            .into_iter()
            .collect();
        if !stack_run_images.is_empty() {
            stack_run_images.extend(
                document::string_array_at(&metadata, "stack/runImage/mirrors").unwrap_or_default(),
            );
        }

        Ok(Self {
            reference,
            user_id,
            group_id,
            has_extensions,
            platform: info.platform(),
            supported_platforms,
            stack_run_images,
            run_image_override,
            run_images: None,
        })
    }

    /// The same logical builder under a new reference, after composition.
    pub fn derive(&self, reference: ImageReference, extensions_added: bool) -> Self {
        Self {
            reference,
            has_extensions: self.has_extensions || extensions_added,
            ..self.clone()
        }
    }

    /// Replaces the resolved run-image set.
    pub fn with_run_images(&self, run_images: Vec<ImageReference>) -> Self {
        Self {
            run_images: Some(run_images),
            ..self.clone()
        }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn has_extensions(&self) -> bool {
        self.has_extensions
    }

    /// `os/arch` declared by the image.
    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn supported_platforms(&self) -> &[Version] {
        &self.supported_platforms
    }

    pub fn run_image_override(&self) -> Option<&ImageReference> {
        self.run_image_override.as_ref()
    }

    /// Already-resolved run images, if any.
    pub fn resolved_run_images(&self) -> Option<&[ImageReference]> {
        self.run_images.as_deref()
    }

    /// Run-image candidates for `level`.
    ///
    /// A caller override is returned alone. Otherwise the resolved set is
    /// reused, or discovered from `/cnb/run.toml` (0.12+) or the builder
    /// metadata label (earlier levels).
    pub async fn get_run_images(
        &self,
        runtime: &dyn ContainerRuntime,
        level: Version,
    ) -> Result<Vec<ImageReference>> {
        if let Some(run_image) = &self.run_image_override {
            return Ok(vec![run_image.clone()]);
        }
        if let Some(run_images) = &self.run_images {
            return Ok(run_images.clone());
        }

        let names = if level.at_least(PLATFORM_RUN_TOML) {
            self.read_run_toml(runtime).await?
        } else {
            self.stack_run_images.clone()
        };
        if names.is_empty() {
            return Err(Error::NoRunImage {
                builder: self.reference.canonical(),
            });
        }
        debug!("Run images for {}: {}", self.reference, names.join(", "));
        names.iter().map(|name| ImageReference::parse(name)).collect()
    }

    async fn read_run_toml(&self, runtime: &dyn ContainerRuntime) -> Result<Vec<String>> {
        let spec = ContainerSpec::new(self.reference.canonical());
        let id = runtime.create_container(&spec).await?;
        let result = read_container_file(runtime, &id, RUN_TOML_PATH).await;
        discard_container(runtime, &id).await;

        let raw = result?;
        Ok(RunMetadata::parse(&String::from_utf8_lossy(&raw))?.image_names())
    }
}

// =============================================================================
// Lifecycle Image
// =============================================================================

/// Platform levels declared by a standalone lifecycle image.
pub async fn lifecycle_supported_platforms(
    runtime: &dyn ContainerRuntime,
    puller: &ImagePuller<'_>,
    reference: &ImageReference,
) -> Result<Vec<Version>> {
    puller.ensure(std::slice::from_ref(reference), None).await?;
    let info = inspect_required(runtime, reference).await?;
    parse_lifecycle_platforms(reference, &info)
}

/// Reads `io.buildpacks.lifecycle.apis` → `platform.supported`.
pub fn parse_lifecycle_platforms(reference: &ImageReference, info: &ImageInfo) -> Result<Vec<Version>> {
    let metadata_error = |reason: String| Error::BuilderMetadata {
        image: reference.canonical(),
        reason,
    };
    let raw = info
        .label(LIFECYCLE_APIS_LABEL)
        .ok_or_else(|| metadata_error(format!("missing label {}", LIFECYCLE_APIS_LABEL)))?;
    let apis = document::parse_json(LIFECYCLE_APIS_LABEL, raw).map_err(|e| metadata_error(e.to_string()))?;
    let levels = document::string_array_at(&apis, "platform/supported")
        .ok_or_else(|| metadata_error("no supported platform levels declared".to_string()))?;
    parse_levels(&levels).map_err(|e| metadata_error(e.to_string()))
}

// =============================================================================
// Platform Level Selection
// =============================================================================

/// Picks the platform level to drive.
///
/// Candidates are every level this crate understands, newest first, narrowed
/// to the pinned level when there is one. A pin outside that list leaves no
/// candidates. The first candidate in `supported` wins; `origin` names
/// whatever `supported` came from (builder or lifecycle image) for the error.
pub fn select_platform_level(
    pinned: Option<Version>,
    origin: &str,
    supported: &[Version],
) -> Result<Version> {
    let candidates: Vec<Version> = SUPPORTED_PLATFORM_LEVELS
        .iter()
        .copied()
        .filter(|level| pinned.map_or(true, |pin| pin == *level))
        .collect();
    candidates
        .iter()
        .find(|candidate| supported.contains(candidate))
        .copied()
        .ok_or_else(|| Error::IncompatiblePlatform {
            origin: origin.to_string(),
            requested: match pinned {
                Some(pin) => vec![pin.to_string()],
                None => candidates.iter().map(ToString::to_string).collect(),
            },
            supported: supported.iter().map(ToString::to_string).collect(),
        })
}

async fn inspect_required(runtime: &dyn ContainerRuntime, reference: &ImageReference) -> Result<ImageInfo> {
    runtime
        .inspect_image(&reference.canonical())
        .await?
        .ok_or_else(|| Error::ImageNotFound {
            reference: reference.canonical(),
        })
}

fn parse_levels(levels: &[String]) -> Result<Vec<Version>> {
    levels.iter().map(|level| Version::parse(level)).collect()
}

fn join_versions(levels: &[Version]) -> String {
    levels
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(json: &str) -> ImageInfo {
        let mut info = ImageInfo {
            id: "sha256:builder".to_string(),
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            ..Default::default()
        };
        info.labels
            .insert(BUILDER_METADATA_LABEL.to_string(), json.to_string());
        info
    }

    fn builder_ref() -> ImageReference {
        ImageReference::parse("example.com/builder:1").unwrap()
    }

    const META: &str = r#"{
        "stack": {"runImage": {"image": "example.com/run:1", "mirrors": ["mirror.io/run:1"]}},
        "lifecycle": {"apis": {"platform": {"supported": ["0.9", "0.10", "0.11"]}}}
    }"#;

    #[test]
    fn test_ids_default_then_image_env_then_platform_env() {
        let info = metadata(META);
        let builder = BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).unwrap();
        assert_eq!((builder.user_id(), builder.group_id()), (1000, 1000));

        let mut info = metadata(META);
        info.env = vec!["CNB_USER_ID=1001".to_string(), "CNB_GROUP_ID=1002".to_string()];
        let builder = BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).unwrap();
        assert_eq!((builder.user_id(), builder.group_id()), (1001, 1002));

        let env: BTreeMap<String, String> = [("CNB_GROUP_ID".to_string(), "2000".to_string())].into();
        let builder = BuilderImage::from_image_info(builder_ref(), &info, &env, None).unwrap();
        assert_eq!((builder.user_id(), builder.group_id()), (1001, 2000));
    }

    #[test]
    fn test_extension_label_presence() {
        let mut info = metadata(META);
        info.labels
            .insert(EXTENSION_LAYERS_LABEL.to_string(), "{}".to_string());
        let builder = BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).unwrap();
        assert!(!builder.has_extensions());

        info.labels.insert(
            EXTENSION_LAYERS_LABEL.to_string(),
            r#"{"samples/curl":{"0.0.1":{}}}"#.to_string(),
        );
        let builder = BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).unwrap();
        assert!(builder.has_extensions());
    }

    #[test]
    fn test_missing_metadata_is_fatal() {
        let info = ImageInfo::default();
        assert!(matches!(
            BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None),
            Err(Error::BuilderMetadata { .. })
        ));
        let info = metadata("not json");
        assert!(BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).is_err());
        let info = metadata(r#"{"lifecycle":{}}"#);
        assert!(BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).is_err());
    }

    #[test]
    fn test_legacy_single_platform_api() {
        let info = metadata(r#"{"lifecycle":{"api":{"platform":"0.4"}},"stack":{"runImage":{"image":"run"}}}"#);
        let builder = BuilderImage::from_image_info(builder_ref(), &info, &BTreeMap::new(), None).unwrap();
        assert_eq!(builder.supported_platforms(), [Version::new(0, 4)]);
    }

    #[test]
    fn test_derive_keeps_identity_and_ors_extensions() {
        let builder = BuilderImage::from_image_info(builder_ref(), &metadata(META), &BTreeMap::new(), None).unwrap();
        let derived = builder.derive(ImageReference::parse("ephemeral:abc").unwrap(), true);
        assert_eq!(derived.reference().canonical(), "docker.io/library/ephemeral:abc");
        assert!(derived.has_extensions());
        assert_eq!(derived.supported_platforms(), builder.supported_platforms());
        assert_eq!(derived.user_id(), builder.user_id());

        let not_added = builder.derive(ImageReference::parse("ephemeral:def").unwrap(), false);
        assert!(!not_added.has_extensions());
    }

    #[test]
    fn test_select_highest_common_level() {
        let supported = [Version::new(0, 9), Version::new(0, 10), Version::new(0, 11)];
        assert_eq!(
            select_platform_level(None, "builder", &supported).unwrap(),
            Version::new(0, 11)
        );
    }

    #[test]
    fn test_select_pinned_level() {
        let supported = [Version::new(0, 9), Version::new(0, 10)];
        assert_eq!(
            select_platform_level(Some(Version::new(0, 9)), "builder", &supported).unwrap(),
            Version::new(0, 9)
        );
        let err = select_platform_level(Some(Version::new(0, 12)), "lifecycle image x", &supported)
            .unwrap_err();
        assert!(err.to_string().contains("lifecycle image x"));
    }

    #[test]
    fn test_select_pinned_level_outside_known_levels() {
        for pin in [Version::new(0, 3), Version::new(0, 13)] {
            match select_platform_level(Some(pin), "builder", &[pin]) {
                Err(Error::IncompatiblePlatform { requested, .. }) => {
                    assert_eq!(requested, vec![pin.to_string()])
                }
                other => panic!("pinned {} accepted: {:?}", pin, other),
            }
        }
    }

    #[test]
    fn test_select_no_overlap() {
        let supported = [Version::new(0, 2), Version::new(0, 3)];
        assert!(matches!(
            select_platform_level(None, "builder", &supported),
            Err(Error::IncompatiblePlatform { .. })
        ));
    }

    #[test]
    fn test_parse_lifecycle_platforms() {
        let mut info = ImageInfo::default();
        info.labels.insert(
            LIFECYCLE_APIS_LABEL.to_string(),
            r#"{"buildpack":{"supported":["0.2"]},"platform":{"deprecated":[],"supported":["0.11","0.12"]}}"#
                .to_string(),
        );
        let reference = ImageReference::parse("buildpacksio/lifecycle:0.17").unwrap();
        assert_eq!(
            parse_lifecycle_platforms(&reference, &info).unwrap(),
            [Version::new(0, 11), Version::new(0, 12)]
        );
    }
}
