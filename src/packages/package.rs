// src/packages/package.rs

//! Package identity, dependencies and selector helpers

use crate::error::{Error, Result};
use crate::version::{self, VersionSelector};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key over (name, category, version), unique within a database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Fingerprint(s.to_string())
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}

/// A package, either concrete (`version` is a plain version) or a selector
/// (`version` carries a condition such as `>=1.0`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub version: String,
    /// Runtime dependencies, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Package>,
    /// Packages that cannot be installed alongside this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Package>,
    /// Needed only while building
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_requires: Vec<Package>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Upstream locations (homepage, sources)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uri: Vec<String>,
}

impl Package {
    /// Create a new Package without dependencies
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_requires(mut self, requires: Vec<Package>) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_conflicts(mut self, conflicts: Vec<Package>) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn with_build_requires(mut self, build_requires: Vec<Package>) -> Self {
        self.build_requires = build_requires;
        self
    }

    /// Parse a CLI atom such as `>=sys-libs/zlib-1.2`, `app/foo-1.0_p1` or
    /// `app/foo`.
    ///
    /// An atom without a version selects every version (`>=0`).
    pub fn from_atom(atom: &str) -> Result<Self> {
        let atom = atom.trim();
        let prefix_len = atom
            .bytes()
            .take_while(|b| matches!(b, b'<' | b'>' | b'=' | b'!' | b'~'))
            .count();
        let (prefix, rest) = atom.split_at(prefix_len);

        let (category, name_version) = rest.split_once('/').unwrap_or(("", rest));
        let (name, version) = split_name_version(name_version);

        if name.is_empty() {
            return Err(Error::ParseError(format!(
                "Invalid package string '{}'",
                atom
            )));
        }

        let version = match version {
            Some(v) => format!("{}{}", prefix, v),
            None if prefix.is_empty() => ">=0".to_string(),
            None => {
                return Err(Error::ParseError(format!(
                    "Package string '{}' has a condition but no version",
                    atom
                )));
            }
        };

        Ok(Self::new(name, category, version))
    }

    /// Database key for this exact package
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(format!("{}-{}-{}", self.name, self.category, self.version))
    }

    /// `category/name` key shared by every version of this package
    pub fn package_key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// `category/name-version`
    pub fn human_readable(&self) -> String {
        if self.category.is_empty() {
            format!("{}-{}", self.name, self.version)
        } else {
            format!("{}/{}-{}", self.category, self.name, self.version)
        }
    }

    /// Same category and name, version ignored
    pub fn same_package(&self, other: &Package) -> bool {
        self.name == other.name && self.category == other.category
    }

    /// True when the version carries a condition prefix
    pub fn is_selector(&self) -> bool {
        version::has_condition_prefix(&self.version)
    }

    /// The version field parsed as a selector
    pub fn version_selector(&self) -> VersionSelector {
        version::parse_version(&self.version)
    }

    /// Check a concrete version string against this package's selector
    pub fn selector_match_version(&self, v: &str) -> Result<bool> {
        if !self.is_selector() {
            return Err(Error::NotASelector(self.human_readable()));
        }
        version::admit(&self.version_selector(), &version::parse_version(v))
    }

    /// Check this package's version against a selector string
    pub fn version_match_selector(&self, selector: &str) -> Result<bool> {
        version::admit(
            &version::parse_version(selector),
            &self.version_selector(),
        )
    }

    /// Check a concrete package against this selector package
    pub fn admits(&self, candidate: &Package) -> Result<bool> {
        if !self.is_selector() {
            return Err(Error::NotASelector(self.human_readable()));
        }
        self.matches(candidate)
    }

    /// Like `admits`, but a plain version on this side means an exact
    /// requirement instead of an error
    pub fn matches(&self, candidate: &Package) -> Result<bool> {
        if !self.same_package(candidate) {
            return Ok(false);
        }
        version::admit(&self.version_selector(), &candidate.version_selector())
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human_readable())
    }
}

/// Split `name-1.0` into name and version at the leftmost dash whose
/// remainder is a complete version
fn split_name_version(input: &str) -> (&str, Option<&str>) {
    for (idx, _) in input.match_indices('-') {
        let candidate = &input[idx + 1..];
        let bare = candidate.strip_suffix('*').unwrap_or(candidate);
        if !bare.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let parsed = version::parse_version(bare);
        if !parsed.version.is_empty()
            && parsed.version.len() + parsed.version_suffix.len() == bare.len()
        {
            return (&input[..idx], Some(candidate));
        }
    }
    (input, None)
}

/// File ownership manifest for an installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    pub fingerprint: Fingerprint,
    pub files: Vec<String>,
}

impl PackageFile {
    pub fn new(fingerprint: Fingerprint, files: Vec<String>) -> Self {
        Self { fingerprint, files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let pkg = Package::new("zlib", "sys-libs", "1.2.13");
        assert_eq!(pkg.fingerprint().as_str(), "zlib-sys-libs-1.2.13");
        assert_eq!(pkg.human_readable(), "sys-libs/zlib-1.2.13");
    }

    #[test]
    fn test_from_atom() {
        let pkg = Package::from_atom(">=sys-libs/zlib-1.2").unwrap();
        assert_eq!(pkg.category, "sys-libs");
        assert_eq!(pkg.name, "zlib");
        assert_eq!(pkg.version, ">=1.2");

        let pkg = Package::from_atom("app/foo-bar-1.0_p1").unwrap();
        assert_eq!(pkg.name, "foo-bar");
        assert_eq!(pkg.version, "1.0_p1");

        let pkg = Package::from_atom("app/foo").unwrap();
        assert_eq!(pkg.name, "foo");
        assert_eq!(pkg.version, ">=0");

        let pkg = Package::from_atom("=dev-lang/python-3.1*").unwrap();
        assert_eq!(pkg.name, "python");
        assert_eq!(pkg.version, "=3.1*");
    }

    #[test]
    fn test_from_atom_rejects_condition_without_version() {
        assert!(Package::from_atom(">=app/foo").is_err());
        assert!(Package::from_atom("app/").is_err());
    }

    #[test]
    fn test_selector_wrappers() {
        let selector = Package::new("foo", "app", ">=1.0");
        assert!(selector.selector_match_version("1.5").unwrap());
        assert!(!selector.selector_match_version("0.9").unwrap());

        let concrete = Package::new("foo", "app", "1.2");
        assert!(concrete.version_match_selector(">=1.0").unwrap());
        assert!(selector.admits(&concrete).unwrap());

        let other = Package::new("bar", "app", "1.2");
        assert!(!selector.admits(&other).unwrap());
    }

    #[test]
    fn test_not_a_selector() {
        let concrete = Package::new("foo", "app", "1.2");
        assert!(matches!(
            concrete.selector_match_version("1.2"),
            Err(Error::NotASelector(_))
        ));
        assert!(matches!(
            concrete.admits(&concrete),
            Err(Error::NotASelector(_))
        ));
        // Exact requirement via matches
        assert!(concrete.matches(&concrete).unwrap());
    }

    #[test]
    fn test_package_json_shape() {
        let pkg = Package::new("foo", "app", "1.0")
            .with_requires(vec![Package::new("bar", "lib", ">=2")]);
        let json = serde_json::to_string(&pkg).unwrap();
        assert!(!json.contains("conflicts"));
        let back: Package = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pkg);
    }
}
