//! # Image Pulling
//!
//! Makes sure the images a build needs are present in the runtime before any
//! container is created from them.
//!
//! ## Pull Policy
//!
//! | Policy | Behaviour |
//! |--------|-----------|
//! | `always` | Pull every requested image |
//! | `if-not-present` | Pull only images missing from the runtime's image list |
//! | `never` | Fail if any requested image is missing |
//!
//! ## Retries
//!
//! Pulls are retried up to `pull-retry-count` times. Attempt `n` (0-based)
//! is bounded by `pull-timeout + n × pull-retry-increase`. After each attempt
//! the runtime's image list is re-read; the last error is only raised when
//! every attempt is spent and images are still missing.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{DockerConfig, PullPolicy};
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use crate::runtime::ContainerRuntime;

/// Pulls images through a [`ContainerRuntime`] according to a pull policy.
pub struct ImagePuller<'a> {
    runtime: &'a dyn ContainerRuntime,
    policy: PullPolicy,
    timeout: Duration,
    retry_increase: Duration,
    retries: u32,
}

impl<'a> ImagePuller<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, config: &DockerConfig) -> Self {
        Self {
            runtime,
            policy: config.pull_policy,
            timeout: config.pull_timeout(),
            retry_increase: config.pull_retry_increase(),
            retries: config.pull_retry_count.max(1),
        }
    }

    /// Ensures every image in `images` is present, pulling for `platform`
    /// (`os/arch`) where needed.
    pub async fn ensure(&self, images: &[ImageReference], platform: Option<&str>) -> Result<()> {
        let mut pending = match self.policy {
            PullPolicy::Always => dedup(images),
            PullPolicy::IfNotPresent | PullPolicy::Never => self.missing(images).await?,
        };
        if pending.is_empty() {
            debug!("All {} image(s) already present", images.len());
            return Ok(());
        }
        if self.policy == PullPolicy::Never {
            return Err(Error::ImagePullFailed {
                reference: pending[0].canonical(),
                reason: "image not present and pull policy is 'never'".to_string(),
            });
        }

        let mut last_error = None;
        for attempt in 0..self.retries {
            let limit = self.timeout + self.retry_increase * attempt;
            for image in &pending {
                let reference = image.canonical();
                info!(
                    "Pulling image {} (attempt {}/{}, timeout {:?})",
                    reference,
                    attempt + 1,
                    self.retries,
                    limit
                );
                match tokio::time::timeout(limit, self.runtime.pull_image(&reference, platform)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Pull of {} failed: {}", reference, e);
                        last_error = Some(e);
                    }
                    Err(_) => {
                        warn!("Pull of {} timed out after {:?}", reference, limit);
                        last_error = Some(Error::Timeout {
                            operation: format!("pull {}", reference),
                            duration: limit,
                        });
                    }
                }
            }

            pending = self.missing(&pending).await?;
            if pending.is_empty() {
                return Ok(());
            }
        }

        Err(last_error.unwrap_or_else(|| Error::ImagePullFailed {
            reference: pending[0].canonical(),
            reason: "image still missing after pull".to_string(),
        }))
    }

    /// Images from `images` the runtime does not list.
    pub async fn missing(&self, images: &[ImageReference]) -> Result<Vec<ImageReference>> {
        let known = self.known_images().await?;
        Ok(dedup(images)
            .into_iter()
            .filter(|image| !is_known(&known, image))
            .collect())
    }

    async fn known_images(&self) -> Result<HashSet<ImageReference>> {
        let summaries = self.runtime.list_images().await?;
        Ok(summaries
            .iter()
            .flat_map(|s| s.repo_tags.iter().chain(s.repo_digests.iter()))
            .filter_map(|name| ImageReference::parse(name).ok())
            .collect())
    }
}

/// Tag matches compare canonical forms; digest references also match a
/// known digest of the same repository whatever its tag.
fn is_known(known: &HashSet<ImageReference>, image: &ImageReference) -> bool {
    if known.contains(image) {
        return true;
    }
    image.digest().is_some_and(|digest| {
        known.iter().any(|k| {
            k.digest() == Some(digest)
                && k.repository() == image.repository()
                && k.registry() == image.registry()
        })
    })
}

fn dedup(images: &[ImageReference]) -> Vec<ImageReference> {
    let mut seen = HashSet::new();
    images
        .iter()
        .filter(|image| seen.insert((*image).clone()))
        .cloned()
        .collect()
}
