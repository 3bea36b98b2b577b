//! Container image references.
//!
//! Parses the usual registry grammar
//! `[host[:port]/]repo[/repo...][:tag][@digest]` into a canonical form
//! `host[:port]/repo[:tag][@digest]`. Two references are equal exactly when
//! their canonical forms match, so `nginx`, `docker.io/library/nginx:latest`
//! and `index.docker.io/library/nginx` all compare equal.

use std::fmt;
use std::str::FromStr;

use crate::constants::{IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};

/// Registry host assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Legacy aliases that normalize to [`DEFAULT_REGISTRY`].
const LEGACY_REGISTRY_ALIASES: &[&str] = &["index.docker.io"];

/// Namespace implied for single-component repositories on the default registry.
const OFFICIAL_NAMESPACE: &str = "library";

/// Tag assumed when neither tag nor digest is present.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed, canonicalized image reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    host: String,
    port: Option<u16>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parses and canonicalizes an image reference.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: value.to_string(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(invalid("empty reference"));
        }
        if value.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
        }
        if !value.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(invalid("contains invalid characters"));
        }

        let (name, digest) = match value.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|r| invalid(r))?;
                (name, Some(digest.to_string()))
            }
            None => (value, None),
        };

        // The first segment is a host only if something follows it and it
        // looks like one.
        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first), rest)
            }
            _ => (None, name),
        };

        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) => {
                validate_tag(tag).map_err(|r| invalid(r))?;
                (repo, Some(tag.to_string()))
            }
            None => (remainder, None),
        };
        validate_repository(repository).map_err(|r| invalid(r))?;

        let (mut host, port) = match registry {
            Some(registry) => split_host_port(registry).map_err(|r| invalid(r))?,
            None => (DEFAULT_REGISTRY.to_string(), None),
        };
        if LEGACY_REGISTRY_ALIASES.contains(&host.as_str()) {
            host = DEFAULT_REGISTRY.to_string();
        }

        let repository = if host == DEFAULT_REGISTRY && port.is_none() && !repository.contains('/')
        {
            format!("{}/{}", OFFICIAL_NAMESPACE, repository)
        } else {
            repository.to_string()
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            host,
            port,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host without port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Registry as `host[:port]`.
    pub fn registry(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Canonical `host[:port]/repo[:tag][@digest]` form.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.registry(), self.repository);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Returns a copy pointing at `tag`, dropping any digest.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        validate_tag(tag).map_err(|reason| Error::InvalidImageReference {
            reference: format!("{}:{}", self.repository, tag),
            reason: reason.to_string(),
        })?;
        Ok(Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        })
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn split_host_port(registry: &str) -> std::result::Result<(String, Option<u16>), &'static str> {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| "invalid registry port")?;
            (host, Some(port))
        }
        None => (registry, None),
    };
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err("invalid registry host");
    }
    Ok((host.to_ascii_lowercase(), port))
}

fn validate_repository(repository: &str) -> std::result::Result<(), &'static str> {
    if repository.is_empty() {
        return Err("missing repository");
    }
    for component in repository.split('/') {
        let bytes = component.as_bytes();
        let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
            return Err("empty repository component");
        };
        if !bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(b))
        {
            return Err("repository must be lowercase alphanumerics and separators");
        }
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err("repository components must start and end alphanumeric");
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), &'static str> {
    if tag.is_empty() || tag.len() > 128 {
        return Err("tag must be 1-128 characters");
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err("tag must not start with '.' or '-'");
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err("tag contains invalid characters");
    }
    Ok(())
}

fn validate_digest(digest: &str) -> std::result::Result<(), &'static str> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err("digest must be algorithm:hex");
    };
    if algorithm.is_empty() || !algorithm.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("invalid digest algorithm");
    }
    if hex.len() < 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("invalid digest encoding");
    }
    Ok(())
}
