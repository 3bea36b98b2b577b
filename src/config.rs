//! Build request surface and settings.
//!
//! [`BuildConfig`] holds every tunable and can be loaded from TOML:
//!
//! ```toml
//! [docker]
//! pull-policy = "if-not-present"
//! pull-retry-count = 5
//!
//! [platform]
//! level = "0.12"
//! trust-builder = true
//! environment = { BP_JVM_VERSION = "21" }
//!
//! [cache.build]
//! name = "my-app-build-cache"
//! ```
//!
//! [`BuildRequest`] adds what differs per build (builder, output image,
//! application content) and validates the lot before any container exists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_DOCKER_SOCKET, DEFAULT_PULL_RETRY_COUNT, DEFAULT_PULL_RETRY_INCREASE,
    DEFAULT_PULL_TIMEOUT, ENV_LIFECYCLE_DEBUG,
};
use crate::content::Content;
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use crate::version::Version;

/// Wrapper used when debugging is switched on without an explicit script.
pub const DEFAULT_DEBUG_SCRIPT: &str = r#"#!/bin/sh
echo "[magikpack-debug] user: $(id)"
echo "[magikpack-debug] exec: $*"
env | sort | sed 's/^/[magikpack-debug] env: /'
exec "$@"
"#;

// =============================================================================
// Settings
// =============================================================================

/// When to pull images the runtime already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull every time.
    Always,
    /// Pull only images the runtime does not have.
    #[default]
    IfNotPresent,
    /// Never pull; missing images are an error.
    Never,
}

/// Container engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DockerConfig {
    /// Docker-compatible CLI to drive.
    pub binary: String,
    /// Engine socket bound into daemon-mode phases.
    pub socket_path: String,
    /// Export to the engine instead of a registry.
    pub use_daemon: bool,
    pub network: Option<String>,
    pub security_options: Vec<String>,
    pub pull_policy: PullPolicy,
    pub pull_timeout_secs: u64,
    pub pull_retry_count: u32,
    pub pull_retry_increase_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            socket_path: DEFAULT_DOCKER_SOCKET.to_string(),
            use_daemon: true,
            network: None,
            security_options: Vec::new(),
            pull_policy: PullPolicy::default(),
            pull_timeout_secs: DEFAULT_PULL_TIMEOUT.as_secs(),
            pull_retry_count: DEFAULT_PULL_RETRY_COUNT,
            pull_retry_increase_secs: DEFAULT_PULL_RETRY_INCREASE.as_secs(),
        }
    }
}

impl DockerConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn pull_retry_increase(&self) -> Duration {
        Duration::from_secs(self.pull_retry_increase_secs)
    }
}

/// Lifecycle and builder settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlatformConfig {
    /// Pin a platform API level.
    pub level: Option<String>,
    /// Run the single creator phase. Unset means "when the builder allows it".
    pub trust_builder: Option<bool>,
    /// Image whose `/cnb/lifecycle` replaces the builder's.
    pub lifecycle_image: Option<String>,
    /// Images whose `/cnb/extensions` are merged into the builder.
    pub extensions: Vec<String>,
    /// Images whose `/cnb/buildpacks` are merged into the builder.
    pub buildpacks: Vec<String>,
    /// Platform environment, written to `/platform/env`.
    pub environment: BTreeMap<String, String>,
    /// Host path of a wrapper script prefixed to every phase command.
    pub debug_script: Option<PathBuf>,
    /// Ignore cached layers.
    pub clean_cache: bool,
}

impl PlatformConfig {
    /// The pinned level, if any.
    pub fn pinned_level(&self) -> Result<Option<Version>> {
        self.level.as_deref().map(Version::parse).transpose()
    }

    /// Debug wrapper contents: the configured script, else the built-in one
    /// when `MAGIKPACK_LIFECYCLE_DEBUG` is set.
    pub fn debug_script_contents(&self) -> Result<Option<String>> {
        if let Some(path) = &self.debug_script {
            return std::fs::read_to_string(path).map(Some).map_err(|e| {
                Error::InvalidConfig(format!("debug script {}: {}", path.display(), e))
            });
        }
        let enabled = std::env::var(ENV_LIFECYCLE_DEBUG)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        Ok(enabled.then(|| DEFAULT_DEBUG_SCRIPT.to_string()))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// One cache volume.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VolumeConfig {
    /// Fixed volume name. Generated when unset.
    pub name: Option<String>,
    /// Override whether the volume is removed after the build.
    pub delete_after_build: Option<bool>,
}

impl VolumeConfig {
    /// Named volumes survive the build unless told otherwise; generated ones
    /// are removed unless told otherwise.
    pub fn retained(&self) -> bool {
        match self.delete_after_build {
            Some(delete) => !delete,
            None => self.name.is_some(),
        }
    }
}

/// Cache volumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    pub build: VolumeConfig,
    pub launch: VolumeConfig,
    pub kaniko: VolumeConfig,
}

/// Phase log relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    /// Passed to every phase as `-log-level`.
    pub level: Option<String>,
    /// Ask the runtime to timestamp relayed lines.
    pub timestamps: bool,
}

/// All settings for a build.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BuildConfig {
    pub docker: DockerConfig,
    pub platform: PlatformConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl BuildConfig {
    /// Loads settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::document("build configuration", e))
    }
}

// =============================================================================
// Build Request
// =============================================================================

/// What a caller asks to have built.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub builder: String,
    pub output: String,
    /// Additional tags for the output image.
    pub tags: Vec<String>,
    /// Application content, staged into `/workspace`.
    pub contents: Vec<Arc<dyn Content>>,
    /// Run image override.
    pub run_image: Option<String>,
    pub config: BuildConfig,
}

impl BuildRequest {
    pub fn new(builder: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            output: output.into(),
            tags: Vec::new(),
            contents: Vec::new(),
            run_image: None,
            config: BuildConfig::default(),
        }
    }

    pub fn with_content(mut self, content: impl Content + 'static) -> Self {
        self.contents.push(Arc::new(content));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_run_image(mut self, run_image: impl Into<String>) -> Self {
        self.run_image = Some(run_image.into());
        self
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Checks the request and parses every reference in it.
    pub fn validate(&self) -> Result<ValidatedRequest> {
        if self.output.trim().is_empty() {
            return Err(Error::InvalidConfig("output image is required".to_string()));
        }
        if self.contents.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one application content source is required".to_string(),
            ));
        }
        if self.builder.trim().is_empty() {
            return Err(Error::InvalidConfig("builder image is required".to_string()));
        }
        for key in self.config.platform.environment.keys() {
            if key.is_empty() || key.contains('/') || key == "." || key == ".." {
                return Err(Error::InvalidConfig(format!(
                    "invalid platform environment key '{}'",
                    key
                )));
            }
        }

        let platform = &self.config.platform;
        Ok(ValidatedRequest {
            builder: ImageReference::parse(&self.builder)?,
            output: ImageReference::parse(&self.output)?,
            tags: parse_all(&self.tags)?,
            run_image: self.run_image.as_deref().map(ImageReference::parse).transpose()?,
            lifecycle_image: platform
                .lifecycle_image
                .as_deref()
                .map(ImageReference::parse)
                .transpose()?,
            extensions: parse_all(&platform.extensions)?,
            buildpacks: parse_all(&platform.buildpacks)?,
            pinned_level: platform.pinned_level()?,
            debug_script: platform.debug_script_contents()?,
        })
    }
}

fn parse_all(values: &[String]) -> Result<Vec<ImageReference>> {
    values.iter().map(|v| ImageReference::parse(v)).collect()
}

/// A request whose references and settings have been checked.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub builder: ImageReference,
    pub output: ImageReference,
    pub tags: Vec<ImageReference>,
    pub run_image: Option<ImageReference>,
    pub lifecycle_image: Option<ImageReference>,
    pub extensions: Vec<ImageReference>,
    pub buildpacks: Vec<ImageReference>,
    pub pinned_level: Option<Version>,
    pub debug_script: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::StringContent;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::default();
        assert_eq!(config.docker.binary, "docker");
        assert!(config.docker.use_daemon);
        assert_eq!(config.docker.pull_policy, PullPolicy::IfNotPresent);
        assert_eq!(config.docker.pull_retry_count, DEFAULT_PULL_RETRY_COUNT);
        assert!(config.platform.trust_builder.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let config = BuildConfig::from_toml_str(
            r#"
            [docker]
            pull-policy = "never"
            security-options = ["label=disable"]

            [platform]
            level = "0.10"
            trust-builder = false
            environment = { BP_NODE_VERSION = "20" }

            [cache.build]
            name = "app-cache"

            [cache.launch]
            name = "launch"
            delete-after-build = true
            "#,
        )
        .unwrap();
        assert_eq!(config.docker.pull_policy, PullPolicy::Never);
        assert_eq!(config.docker.security_options, ["label=disable"]);
        assert_eq!(config.platform.pinned_level().unwrap(), Some(Version::new(0, 10)));
        assert_eq!(config.platform.trust_builder, Some(false));
        assert_eq!(config.platform.environment["BP_NODE_VERSION"], "20");
        assert!(config.cache.build.retained());
        assert!(!config.cache.launch.retained());
        assert!(!config.cache.kaniko.retained());
    }

    #[test]
    fn test_validate_requires_output_and_content() {
        let missing_output = BuildRequest::new("builder", "").with_content(StringContent::new("a", "b"));
        assert!(matches!(missing_output.validate(), Err(Error::InvalidConfig(_))));

        let missing_content = BuildRequest::new("builder", "app");
        assert!(matches!(missing_content.validate(), Err(Error::InvalidConfig(_))));

        let bad_ref = BuildRequest::new("builder", "Not Valid").with_content(StringContent::new("a", "b"));
        assert!(matches!(
            bad_ref.validate(),
            Err(Error::InvalidImageReference { .. })
        ));
    }

    #[test]
    fn test_validate_parses_references() {
        let request = BuildRequest::new("paketobuildpacks/builder-jammy-base", "my-app")
            .with_content(StringContent::new("index.js", "console.log(1)"))
            .with_tag("my-app:v1")
            .with_run_image("paketobuildpacks/run-jammy-base");
        let validated = request.validate().unwrap();
        assert_eq!(validated.output.canonical(), "docker.io/library/my-app:latest");
        assert_eq!(validated.tags.len(), 1);
        assert!(validated.run_image.is_some());
        assert!(validated.pinned_level.is_none());
    }
}
