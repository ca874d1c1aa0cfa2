//! Daemon version parsing and capability derivation
//!
//! The daemon reports its version in the `server.connected` handshake. A
//! capability is a boolean derived by comparing that version against a
//! feature threshold under semantic-version ordering, where a pre-release
//! (`0.1.0-beta`) orders before its release (`0.1.0`).

use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatterVersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),
}

/// Parsed semantic version as reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatterVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Pre-release identifiers after the dash, e.g. "beta.2"
    pub pre_release: Option<String>,
}

impl FormatterVersion {
    /// Parse a `major.minor.patch[-pre]` version string
    ///
    /// Build metadata after `+` is accepted and ignored; it does not
    /// participate in ordering.
    pub fn parse(input: &str) -> Result<Self, FormatterVersionError> {
        let input = input.trim();

        // Strip build metadata first
        let without_build = input.split('+').next().unwrap_or(input);

        let (triple, pre_release) = match without_build.split_once('-') {
            Some((triple, pre)) if !pre.is_empty() => (triple, Some(pre.to_string())),
            Some((triple, _)) => (triple, None),
            None => (without_build, None),
        };

        let mut parts = triple.splitn(3, '.');

        let major = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| FormatterVersionError::InvalidFormat(input.to_string()))?;

        let minor = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| FormatterVersionError::InvalidFormat(input.to_string()))?;

        let patch = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| FormatterVersionError::InvalidFormat(input.to_string()))?;

        Ok(Self {
            major,
            minor,
            patch,
            pre_release,
        })
    }

    /// `version >= threshold` under semantic-version ordering
    pub fn is_at_least(&self, threshold: &FormatterVersion) -> bool {
        self >= threshold
    }

    fn compare_pre_release(a: &str, b: &str) -> Ordering {
        // Identifier-wise comparison: numeric identifiers compare numerically
        // and order below alphanumeric ones; a shorter list orders first when
        // it is a prefix of the longer
        let mut left = a.split('.');
        let mut right = b.split('.');

        loop {
            match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(l), Some(r)) => {
                    let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                        (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                        (Ok(_), Err(_)) => Ordering::Less,
                        (Err(_), Ok(_)) => Ordering::Greater,
                        (Err(_), Err(_)) => l.cmp(r),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
            }
        }
    }
}

impl Ord for FormatterVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                // A release orders above any of its pre-releases
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => Self::compare_pre_release(a, b),
            })
    }
}

impl PartialOrd for FormatterVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for FormatterVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// Capability flags derived from the daemon's reported version
///
/// Starts empty (version 0.0.0, every capability false) and is populated
/// exactly once when the `server.connected` handshake arrives.
#[derive(Debug, Clone)]
pub struct FormatterCapabilities {
    version: FormatterVersion,
}

impl FormatterCapabilities {
    /// Capabilities before the handshake: version 0.0.0, nothing supported
    pub fn empty() -> Self {
        Self {
            version: FormatterVersion {
                major: 0,
                minor: 0,
                patch: 0,
                pre_release: None,
            },
        }
    }

    /// Capabilities for a reported version string
    ///
    /// An unparseable version is treated as empty so a misbehaving daemon
    /// degrades to no capabilities instead of failing the handshake.
    pub fn from_version(version: &str) -> Self {
        match FormatterVersion::parse(version) {
            Ok(version) => Self { version },
            Err(e) => {
                tracing::warn!("Unparseable daemon version '{}': {}", version, e);
                Self::empty()
            }
        }
    }

    pub fn version(&self) -> &FormatterVersion {
        &self.version
    }

    fn at_least(&self, threshold: &str) -> bool {
        // Thresholds are compile-time constants; parse failure is a bug here,
        // not daemon input
        FormatterVersion::parse(threshold)
            .map(|threshold| self.version.is_at_least(&threshold))
            .unwrap_or(false)
    }

    /// Whether the daemon supports the custom format profile parameters
    pub fn has_custom_format1(&self) -> bool {
        self.at_least("0.1.0")
    }
}

impl Default for FormatterCapabilities {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
