// src/compiler/spec.rs

//! Compile specs, their lifecycle and build recipes

use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Artifact compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
}

impl CompressionType {
    /// Archive file extension, without the leading `.package`
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "tar",
            CompressionType::Gzip => "tar.gz",
        }
    }
}

impl FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(CompressionType::None),
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            other => Err(Error::ConfigError(format!(
                "Unsupported compression '{}' (expected none or gzip)",
                other
            ))),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::None => f.write_str("none"),
            CompressionType::Gzip => f.write_str("gzip"),
        }
    }
}

/// What a backend runs to build one package
///
/// `prelude` prepares the build root; only what `steps` change ends up in
/// the artifact. `env` entries are `KEY=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInstructions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prelude: Vec<String>,
    pub steps: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

impl BuildInstructions {
    /// `env` split into pairs; entries without `=` get an empty value
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }
}

/// Build recipes by package fingerprint
#[derive(Debug, Clone, Default)]
pub struct RecipeBook {
    recipes: HashMap<Fingerprint, BuildInstructions>,
}

impl RecipeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: Fingerprint, instructions: BuildInstructions) {
        self.recipes.insert(fingerprint, instructions);
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&BuildInstructions> {
        self.recipes.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Instructions for a package; a package without a recipe builds nothing
    pub fn instructions_for(&self, package: &Package) -> BuildInstructions {
        self.get(&package.fingerprint()).cloned().unwrap_or_default()
    }
}

/// Lifecycle of a compile spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileState {
    #[default]
    Pending,
    Resolving,
    Scheduled,
    Building,
    Packaging,
    Done,
    Failed,
}

impl CompileState {
    pub fn can_transition_to(self, next: CompileState) -> bool {
        use CompileState::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Resolving, Scheduled)
                | (Scheduled, Building)
                | (Building, Packaging)
                | (Packaging, Done)
                | (Resolving | Scheduled | Building | Packaging, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CompileState::Done | CompileState::Failed)
    }
}

impl fmt::Display for CompileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileState::Pending => "pending",
            CompileState::Resolving => "resolving",
            CompileState::Scheduled => "scheduled",
            CompileState::Building => "building",
            CompileState::Packaging => "packaging",
            CompileState::Done => "done",
            CompileState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A package bound to its build instructions and output location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub package: Package,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub compression: CompressionType,
    #[serde(default)]
    pub instructions: BuildInstructions,
    #[serde(skip)]
    state: CompileState,
}

impl CompileSpec {
    pub fn new(package: Package, instructions: BuildInstructions) -> Self {
        Self {
            package,
            output_path: None,
            compression: CompressionType::None,
            instructions,
            state: CompileState::Pending,
        }
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn set_output_path(&mut self, path: impl Into<PathBuf>) {
        self.output_path = Some(path.into());
    }

    /// Output directory; required from `Building` onwards
    pub fn output_path(&self) -> Result<&Path> {
        self.output_path.as_deref().ok_or_else(|| Error::BuildError {
            package: self.package.human_readable(),
            reason: "no output path set".to_string(),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.package.fingerprint()
    }

    pub fn state(&self) -> CompileState {
        self.state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: CompileState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                package: self.package.human_readable(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == CompileState::Building {
            self.output_path()?;
        }
        self.state = next;
        Ok(())
    }

    /// Content hash of the package and its recipe, used as image tag
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.package.fingerprint().as_str().as_bytes());
        if let Ok(encoded) = serde_json::to_vec(&self.instructions) {
            hasher.update(&encoded);
        }
        format!("{:x}", hasher.finalize())
    }

    /// `{repository}:{hash}`
    pub fn image_name(&self, repository: &str) -> String {
        format!("{}:{}", repository, self.hash())
    }

    /// `{name}-{category}-{version}`, the stem of every output file
    pub fn artifact_stem(&self) -> String {
        format!(
            "{}-{}-{}",
            self.package.name, self.package.category, self.package.version
        )
    }

    pub fn artifact_file_name(&self) -> String {
        format!(
            "{}.package.{}",
            self.artifact_stem(),
            self.compression.extension()
        )
    }

    pub fn metadata_file_name(&self) -> String {
        format!("{}.metadata.json", self.artifact_stem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CompileSpec {
        CompileSpec::new(Package::new("zlib", "sys-libs", "1.2.13"), BuildInstructions::default())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut spec = spec().with_output_path("/tmp/out");
        for next in [
            CompileState::Resolving,
            CompileState::Scheduled,
            CompileState::Building,
            CompileState::Packaging,
            CompileState::Done,
        ] {
            spec.transition(next).unwrap();
        }
        assert!(spec.state().is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut spec = spec();
        assert!(matches!(
            spec.transition(CompileState::Building),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            spec.transition(CompileState::Failed),
            Err(Error::InvalidTransition { .. })
        ));

        spec.transition(CompileState::Resolving).unwrap();
        spec.transition(CompileState::Failed).unwrap();
        assert!(spec.transition(CompileState::Resolving).is_err());
    }

    #[test]
    fn test_building_requires_output_path() {
        let mut spec = spec();
        spec.transition(CompileState::Resolving).unwrap();
        spec.transition(CompileState::Scheduled).unwrap();
        assert!(matches!(
            spec.transition(CompileState::Building),
            Err(Error::BuildError { .. })
        ));
        assert_eq!(spec.state(), CompileState::Scheduled);

        spec.set_output_path("/tmp/out");
        spec.transition(CompileState::Building).unwrap();
    }

    #[test]
    fn test_artifact_names() {
        let mut spec = spec();
        assert_eq!(spec.artifact_file_name(), "zlib-sys-libs-1.2.13.package.tar");
        spec.compression = CompressionType::Gzip;
        assert_eq!(spec.artifact_file_name(), "zlib-sys-libs-1.2.13.package.tar.gz");
        assert_eq!(spec.metadata_file_name(), "zlib-sys-libs-1.2.13.metadata.json");
    }

    #[test]
    fn test_image_name_tracks_recipe() {
        let plain = spec();
        let mut changed = spec();
        changed.instructions.steps.push("make".into());

        assert!(plain.image_name("kiln/cache").starts_with("kiln/cache:"));
        assert_ne!(plain.hash(), changed.hash());
        assert_eq!(plain.hash(), spec().hash());
    }

    #[test]
    fn test_recipe_book() {
        let pkg = Package::new("foo", "app", "1.0");
        let mut book = RecipeBook::new();
        assert!(book.instructions_for(&pkg).steps.is_empty());

        book.insert(
            pkg.fingerprint(),
            BuildInstructions {
                steps: vec!["make install".into()],
                env: vec!["CFLAGS=-O2".into(), "BARE".into()],
                ..Default::default()
            },
        );
        let instructions = book.instructions_for(&pkg);
        assert_eq!(instructions.steps, vec!["make install".to_string()]);
        assert_eq!(
            instructions.env_pairs(),
            vec![
                ("CFLAGS".to_string(), "-O2".to_string()),
                ("BARE".to_string(), String::new())
            ]
        );
    }

    #[test]
    fn test_compression_parsing() {
        assert_eq!("gzip".parse::<CompressionType>().unwrap(), CompressionType::Gzip);
        assert_eq!("none".parse::<CompressionType>().unwrap(), CompressionType::None);
        assert!("zstd".parse::<CompressionType>().is_err());
    }
}
