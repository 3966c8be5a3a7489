// src/compiler/local.rs

//! Filesystem snapshot backend
//!
//! Images are plain directories in a local store:
//!
//! ```text
//! store/
//!   kiln_cache_<hash>/
//!     rootfs/          build root, steps run here with `sh -c`
//!     baseline.json    file hashes after the prelude
//! ```
//!
//! Exporting copies every file the steps added or changed relative to the
//! baseline. A registry is just another directory images are pushed to and
//! pulled from.

use super::artifact::file_checksum;
use super::backend::{Backend, BuildOutput};
use super::spec::CompileSpec;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const ROOTFS_DIR: &str = "rootfs";
const BASELINE_FILE: &str = "baseline.json";
const SHELL: &str = "sh";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Relative path -> content hash (symlinks hash their target)
type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    store: PathBuf,
    registry: Option<PathBuf>,
}

impl LocalBackend {
    pub fn new(store: impl Into<PathBuf>) -> Self {
        Self {
            store: store.into(),
            registry: None,
        }
    }

    /// Directory that `push` publishes to and `pull` falls back on
    pub fn with_registry(mut self, registry: impl Into<PathBuf>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    fn image_dir(&self, image: &str) -> PathBuf {
        self.store.join(sanitize(image))
    }

    fn run_step(&self, spec: &CompileSpec, step: &str, rootfs: &Path, privileged: bool) -> Result<()> {
        debug!("[{}] running `{}`", spec.package, step);

        let mut command = Command::new(SHELL);
        command.arg("-c").arg(step).current_dir(rootfs);
        if !privileged {
            command
                .env_clear()
                .env("PATH", DEFAULT_PATH)
                .env("HOME", rootfs);
        }
        command
            .env("KILN_PACKAGE_NAME", &spec.package.name)
            .env("KILN_PACKAGE_CATEGORY", &spec.package.category)
            .env("KILN_PACKAGE_VERSION", &spec.package.version)
            .env("KILN_ROOTFS", rootfs);
        for (key, value) in spec.instructions.env_pairs() {
            command.env(key, value);
        }

        let output = command.output().map_err(|e| Error::BuildError {
            package: spec.package.human_readable(),
            reason: format!("failed to spawn `{}`: {}", step, e),
        })?;

        if !output.status.success() {
            return Err(Error::BuildError {
                package: spec.package.human_readable(),
                reason: format!(
                    "step `{}` failed ({}): {}",
                    step,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("[{}] {}", spec.package, stdout.trim());
        }
        Ok(())
    }

    fn run_build(&self, spec: &CompileSpec, image_dir: &Path, privileged: bool) -> Result<PathBuf> {
        let rootfs = image_dir.join(ROOTFS_DIR);
        fs::create_dir_all(&rootfs)?;

        if let Some(base) = &spec.instructions.image {
            let base_root = self.image_dir(base).join(ROOTFS_DIR);
            if base_root.is_dir() {
                copy_tree(&base_root, &rootfs)?;
            } else {
                warn!("Base image {} is not in the local store, starting empty", base);
            }
        }

        for step in &spec.instructions.prelude {
            self.run_step(spec, step, &rootfs, privileged)?;
        }

        let baseline = snapshot(&rootfs)?;
        fs::write(image_dir.join(BASELINE_FILE), serde_json::to_vec(&baseline)?)?;

        for step in &spec.instructions.steps {
            self.run_step(spec, step, &rootfs, privileged)?;
        }

        Ok(rootfs)
    }
}

impl Backend for LocalBackend {
    fn build(&self, spec: &CompileSpec, image: &str, privileged: bool) -> Result<BuildOutput> {
        let image_dir = self.image_dir(image);
        if image_dir.exists() {
            fs::remove_dir_all(&image_dir)?;
        }

        info!("Building {} as {}", spec.package, image);
        match self.run_build(spec, &image_dir, privileged) {
            Ok(root) => Ok(BuildOutput {
                image: image.to_string(),
                root,
            }),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&image_dir) {
                    debug!("Could not remove {}: {}", image_dir.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    fn export(&self, output: &BuildOutput, destination: &Path) -> Result<()> {
        let image_dir = self.image_dir(&output.image);
        let baseline: Snapshot = match fs::read(image_dir.join(BASELINE_FILE)) {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Snapshot::new(),
            Err(e) => return Err(e.into()),
        };

        fs::create_dir_all(destination)?;
        let current = snapshot(&output.root)?;
        let mut exported = 0;

        for (relative, hash) in &current {
            if baseline.get(relative) == Some(hash) {
                continue;
            }
            let source = output.root.join(relative);
            let target = destination.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_entry(&source, &target)?;
            exported += 1;
        }

        debug!(
            "Exported {} of {} files from {} to {}",
            exported,
            current.len(),
            output.image,
            destination.display()
        );
        Ok(())
    }

    fn pull(&self, image: &str) -> Result<Option<BuildOutput>> {
        let image_dir = self.image_dir(image);
        let rootfs = image_dir.join(ROOTFS_DIR);

        if !rootfs.is_dir() {
            let Some(registry) = &self.registry else {
                return Ok(None);
            };
            let published = registry.join(sanitize(image));
            if !published.join(ROOTFS_DIR).is_dir() {
                return Ok(None);
            }
            info!("Pulling {} from {}", image, registry.display());
            copy_tree(&published, &image_dir)?;
        }

        Ok(Some(BuildOutput {
            image: image.to_string(),
            root: rootfs,
        }))
    }

    fn push(&self, image: &str) -> Result<()> {
        let Some(registry) = &self.registry else {
            return Err(Error::BuildError {
                package: image.to_string(),
                reason: "no registry configured to push to".to_string(),
            });
        };

        let image_dir = self.image_dir(image);
        if !image_dir.is_dir() {
            return Err(Error::NotFoundError(format!("Image {} not found", image)));
        }

        let published = registry.join(sanitize(image));
        if published.exists() {
            fs::remove_dir_all(&published)?;
        }
        info!("Pushing {} to {}", image, registry.display());
        copy_tree(&image_dir, &published)
    }

    fn remove_image(&self, image: &str) -> Result<()> {
        let image_dir = self.image_dir(image);
        if image_dir.exists() {
            debug!("Removing image {}", image);
            fs::remove_dir_all(image_dir)?;
        }
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        if self.store.exists() {
            fs::remove_dir_all(&self.store)?;
        }
        Ok(())
    }
}

fn sanitize(image: &str) -> String {
    image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

fn snapshot(root: &Path) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let hash = if entry.file_type().is_symlink() {
            format!("link:{}", fs::read_link(entry.path())?.display())
        } else {
            file_checksum(entry.path())?
        };
        snapshot.insert(relative.to_string_lossy().into_owned(), hash);
    }
    Ok(snapshot)
}

fn copy_entry(source: &Path, target: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        if fs::symlink_metadata(target).is_ok() {
            fs::remove_file(target)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(link, target)?;
        #[cfg(not(unix))]
        fs::copy(source.parent().unwrap_or(source).join(link), target)?;
    } else {
        fs::copy(source, target)?;
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_entry(entry.path(), &dest)?;
        }
    }
    Ok(())
}
