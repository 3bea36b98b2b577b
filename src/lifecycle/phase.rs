//! Lifecycle phases.

use std::fmt;

use crate::constants::{LIFECYCLE_DIR, PLATFORM_ANALYZE_FIRST};
use crate::version::Version;

/// One lifecycle step, run in its own container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Detect,
    Analyze,
    Restore,
    /// Extender applying build-image Dockerfiles.
    ExtendBuild,
    /// Extender applying run-image Dockerfiles (0.12+).
    ExtendRun,
    Build,
    Export,
    /// Single-shot creator; excludes every other phase.
    Create,
}

impl Phase {
    /// Lifecycle binary under `/cnb/lifecycle`.
    pub fn binary(self) -> &'static str {
        match self {
            Self::Detect => "detector",
            Self::Analyze => "analyzer",
            Self::Restore => "restorer",
            Self::ExtendBuild | Self::ExtendRun => "extender",
            Self::Build => "builder",
            Self::Export => "exporter",
            Self::Create => "creator",
        }
    }

    pub fn binary_path(self) -> String {
        format!("{}/{}", LIFECYCLE_DIR, self.binary())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Analyze => "analyze",
            Self::Restore => "restore",
            Self::ExtendBuild => "extend-build",
            Self::ExtendRun => "extend-run",
            Self::Build => "build",
            Self::Export => "export",
            Self::Create => "create",
        }
    }

    /// Creator and extender need root for their filesystem work; every other
    /// phase runs as the build user.
    pub fn runs_as_root(self) -> bool {
        matches!(self, Self::Create | Self::ExtendBuild | Self::ExtendRun)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two phases that open a full sequence, in the order `level` runs them.
pub fn opening_phases(level: Version) -> [Phase; 2] {
    if level.at_least(PLATFORM_ANALYZE_FIRST) {
        [Phase::Analyze, Phase::Detect]
    } else {
        [Phase::Detect, Phase::Analyze]
    }
}
