//! Version compatibility collaborator.
//!
//! Wraps [`semver::Version`] with the subsystem's compatibility rule instead
//! of semver's own (stricter) `VersionReq` matching, since the rule here
//! treats `0.x` releases as mutually incompatible across minor versions
//! while still allowing the patch to vary, and ignores build metadata
//! entirely.

use semver::Version as SemverVersion;
use std::fmt;

/// A parsed `major.minor.patch[+build]` version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(SemverVersion);

impl Version {
    /// Parses a version string of the form `major.minor.patch[-pre][+build]`.
    pub fn parse(s: &str) -> Result<Self, semver::Error> {
        Ok(Self(SemverVersion::parse(s)?))
    }

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(SemverVersion::new(major, minor, patch))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Applies the subsystem's compatibility rule: a symbol exported at
    /// version `self` satisfies an import that requires `required` iff
    /// `self.major == required.major`, and (`self.major > 0` or
    /// `self.minor == required.minor`), and `self >= required`
    /// (comparing major.minor.patch only; build metadata is ignored and
    /// pre-release tags do not participate in the comparison).
    pub fn is_compatible_with(&self, required: &Version) -> bool {
        if self.0.major != required.0.major {
            return false;
        }
        if self.0.major == 0 && self.0.minor != required.0.minor {
            return false;
        }
        self.numeric_triple() >= required.numeric_triple()
    }

    fn numeric_triple(&self) -> (u64, u64, u64) {
        (self.0.major, self.0.minor, self.0.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0.major, self.0.minor, self.0.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_major_minor_patch_newer_is_compatible() {
        let got = Version::new(1, 2, 0);
        let req = Version::new(1, 2, 0);
        assert!(got.is_compatible_with(&req));

        let got = Version::new(1, 3, 0);
        assert!(got.is_compatible_with(&req));
    }

    #[test]
    fn major_mismatch_is_incompatible() {
        let got = Version::new(2, 0, 0);
        let req = Version::new(1, 2, 0);
        assert!(!got.is_compatible_with(&req));
    }

    #[test]
    fn zero_major_requires_matching_minor() {
        let got = Version::new(0, 1, 5);
        let req = Version::new(0, 2, 0);
        assert!(!got.is_compatible_with(&req));

        let got = Version::new(0, 2, 5);
        assert!(got.is_compatible_with(&req));
    }

    #[test]
    fn older_patch_is_incompatible() {
        let got = Version::new(1, 2, 0);
        let req = Version::new(1, 2, 3);
        assert!(!got.is_compatible_with(&req));
    }
}
