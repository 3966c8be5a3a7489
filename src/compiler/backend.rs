// src/compiler/backend.rs

//! Build backend contract

use super::spec::CompileSpec;
use crate::error::Result;
use std::path::{Path, PathBuf};

/// Result of a successful build: an image the backend can export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Image name, `{repository}:{hash}`
    pub image: String,
    /// Backend-specific location of the built root
    pub root: PathBuf,
}

/// Isolated build executor
///
/// Implementations must be usable from several scheduler workers at once.
pub trait Backend: Send + Sync {
    /// Run the spec's build instructions into an image called `image`
    fn build(&self, spec: &CompileSpec, image: &str, privileged: bool) -> Result<BuildOutput>;

    /// Write the content produced by the build into `destination`
    fn export(&self, output: &BuildOutput, destination: &Path) -> Result<()>;

    /// Fetch a previously built image; `Ok(None)` when it is not available
    fn pull(&self, image: &str) -> Result<Option<BuildOutput>>;

    /// Publish an image for reuse by other builds
    fn push(&self, image: &str) -> Result<()>;

    fn remove_image(&self, image: &str) -> Result<()>;

    /// Drop everything the backend still holds
    fn clean(&self) -> Result<()>;
}
