//! Dotted `major.minor` protocol versions.
//!
//! Platform API levels gate which lifecycle phases run and which flags they
//! receive. Only `(major, minor)` participates in comparison; any patch or
//! suffix after the minor component is accepted and ignored.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    major: u32,
    minor: u32,
}

impl Version {
    /// Creates a version from its components.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses `major.minor[.*]`.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion {
            value: value.to_string(),
        };

        let trimmed = value.trim();
        let (major, rest) = trimmed.split_once('.').ok_or_else(invalid)?;
        if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let minor_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        if minor_len == 0 {
            return Err(invalid());
        }

        let major = major.parse().map_err(|_| invalid())?;
        let minor = rest[..minor_len].parse().map_err(|_| invalid())?;
        Ok(Self { major, minor })
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Three-way comparison on `(major, minor)`.
    pub fn compare(&self, other: &Version) -> Ordering {
        self.cmp(other)
    }

    /// `self >= other`
    pub fn at_least(&self, other: Version) -> bool {
        *self >= other
    }

    /// `self < other`
    pub fn less_than(&self, other: Version) -> bool {
        *self < other
    }

    /// `self > other`
    pub fn greater_than(&self, other: Version) -> bool {
        *self > other
    }

    /// `self <= other`
    pub fn at_most(&self, other: Version) -> bool {
        *self <= other
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
