// src/installer/mod.rs

//! Installing artifacts into a target root
//!
//! The installer resolves requests against the indexes of its
//! repositories, downloads what the system lacks in parallel, then unpacks
//! sequentially in dependency order and records each package with its
//! file manifest in the system database. Older versions of the installed
//! packages are removed last.

use crate::compiler::Artifact;
use crate::config::Config;
use crate::db::PackageStore;
use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package, PackageFile};
use crate::repository::{DownloadClient, Repository};
use crate::solver::Solver;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A target root and the database describing what is installed in it
#[derive(Clone)]
pub struct System {
    pub database: Arc<dyn PackageStore>,
    pub target: PathBuf,
}

impl System {
    pub fn new(database: Arc<dyn PackageStore>, target: impl Into<PathBuf>) -> Self {
        Self {
            database,
            target: target.into(),
        }
    }

    /// Resolve a manifest entry below the target, refusing escapes
    fn target_path(&self, file: &str) -> Result<PathBuf> {
        let relative = Path::new(file);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::ParseError(format!("Unsafe file path {}", file)));
        }
        Ok(self.target.join(relative))
    }

    /// Delete a package's files, then any directories left empty
    ///
    /// Files listed in `keep` stay in place.
    fn remove_files(&self, fingerprint: &Fingerprint, keep: &HashSet<String>) -> Result<usize> {
        let files = match self.database.get_package_files(fingerprint) {
            Ok(files) => files,
            Err(Error::NotFoundError(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        let mut parents = HashSet::new();
        for file in files.iter().filter(|f| !keep.contains(*f)) {
            let path = self.target_path(file)?;
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    debug!("Skipping directory in manifest: {}", file);
                    continue;
                }
                Ok(_) => {
                    fs::remove_file(&path)?;
                    debug!("Removed file: {}", file);
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("File already removed: {}", file);
                }
                Err(e) => return Err(e.into()),
            }
            let mut parent = Path::new(file).parent();
            while let Some(dir) = parent.filter(|d| !d.as_os_str().is_empty()) {
                parents.insert(dir.to_path_buf());
                parent = dir.parent();
            }
        }

        // Deepest first so nested empty directories collapse
        let mut parents: Vec<PathBuf> = parents.into_iter().collect();
        parents.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for dir in parents {
            match fs::remove_dir(self.target.join(&dir)) {
                Ok(()) => debug!("Removed directory: {}", dir.display()),
                Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
            }
        }

        Ok(removed)
    }
}

/// What an install would do, in dependency order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallPlan {
    pub to_install: Vec<Package>,
    pub already_installed: Vec<Package>,
    /// Installed packages superseded by another version in `to_install`
    pub to_replace: Vec<Package>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.to_install.is_empty() && self.to_replace.is_empty()
    }
}

/// A synced repository and the client used to reach its mirrors
struct Source {
    repository: Repository,
    client: Box<dyn DownloadClient>,
}

pub struct Installer {
    sources: Vec<Source>,
    solver: Solver,
    concurrency: usize,
}

impl Installer {
    /// Sync every configured repository, lowest priority value first
    pub fn new(config: &Config) -> Result<Self> {
        let mut installer = Self {
            sources: Vec::new(),
            solver: Solver::new(config.solver.clone()),
            concurrency: config.general.concurrency.max(1),
        };

        for repository in config.repositories_by_priority() {
            let client = repository.client()?;
            let synced = repository.sync_with(client.as_ref())?;
            installer.add_repository(synced, client);
        }

        Ok(installer)
    }

    /// Register an already synced repository
    ///
    /// Sources stay sorted by priority; ties keep insertion order.
    pub fn add_repository(&mut self, repository: Repository, client: Box<dyn DownloadClient>) {
        info!(
            "Using repository {} (revision {}, {} artifacts)",
            repository.name,
            repository.revision,
            repository.index.len()
        );
        let at = self
            .sources
            .partition_point(|s| s.repository.priority <= repository.priority);
        self.sources.insert(at, Source { repository, client });
    }

    /// Every package offered by the repositories
    ///
    /// A fingerprint offered by several repositories is taken from the
    /// first one.
    fn world(&self) -> Vec<Package> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .flat_map(|s| s.repository.world())
            .filter(|p| seen.insert(p.fingerprint()))
            .collect()
    }

    fn locate(&self, package: &Package) -> Result<(&Source, &Artifact)> {
        let fingerprint = package.fingerprint();
        self.sources
            .iter()
            .find_map(|s| s.repository.find_artifact(&fingerprint).map(|a| (s, a)))
            .ok_or_else(|| {
                Error::NotFoundError(format!("No repository provides {}", package.human_readable()))
            })
    }

    pub fn plan(&self, requests: &[Package], system: &System) -> Result<InstallPlan> {
        let world = self.world();
        let solution = self.solver.solve(requests, &world)?;
        let ordered = Solver::order(&solution, false)?;
        let installed = system.database.world()?;

        let mut plan = InstallPlan::default();
        let mut replaced = HashSet::new();
        for package in ordered {
            if system.database.has_package(&package.fingerprint())? {
                plan.already_installed.push(package);
                continue;
            }

            for old in installed
                .iter()
                .filter(|old| old.same_package(&package) && old.version != package.version)
            {
                if replaced.insert(old.fingerprint()) {
                    plan.to_replace.push(old.clone());
                }
            }
            plan.to_install.push(package);
        }

        debug!(
            "Install plan: {} to install, {} installed, {} to replace",
            plan.to_install.len(),
            plan.already_installed.len(),
            plan.to_replace.len()
        );
        Ok(plan)
    }

    pub fn install(&self, requests: &[Package], system: &System) -> Result<InstallPlan> {
        let plan = self.plan(requests, system)?;
        for package in &plan.already_installed {
            info!("{} is already installed", package);
        }
        if plan.to_install.is_empty() {
            info!("Nothing to install");
            return Ok(plan);
        }

        let located = plan
            .to_install
            .iter()
            .map(|p| self.locate(p))
            .collect::<Result<Vec<_>>>()?;

        let downloaded = self.download(&located)?;

        let mut new_files = HashSet::new();
        for (package, artifact) in plan.to_install.iter().zip(&downloaded) {
            let files = artifact.unpack(&system.target)?;
            match system.database.create_package(package) {
                Ok(_) => {}
                Err(Error::AlreadyExists(_)) => {
                    warn!("{} was registered concurrently", package);
                }
                Err(e) => return Err(e),
            }
            system
                .database
                .set_package_files(&PackageFile::new(package.fingerprint(), files.clone()))?;
            new_files.extend(files);
            info!("Installed {}", package);
        }

        for old in &plan.to_replace {
            let removed = system.remove_files(&old.fingerprint(), &new_files)?;
            system.database.remove_package(&old.fingerprint())?;
            info!("Replaced {} ({} files removed)", old, removed);
        }

        Ok(plan)
    }

    /// Fetch and verify artifacts with bounded concurrency, keeping order
    fn download(&self, located: &[(&Source, &Artifact)]) -> Result<Vec<Artifact>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to start download pool: {}", e)))?;

        info!("Downloading {} artifacts", located.len());
        let results: Vec<Result<Artifact>> = pool.install(|| {
            located
                .par_iter()
                .map(|(source, artifact)| -> Result<Artifact> {
                    let fetched = source.client.download_artifact(artifact)?;
                    fetched.verify()?;
                    Ok(fetched)
                })
                .collect()
        });

        let mut artifacts = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (result, (_, artifact)) in results.into_iter().zip(located) {
            match result {
                Ok(fetched) => artifacts.push(fetched),
                Err(e) => {
                    error!("Failed to download {}: {}", artifact.package(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(artifacts),
        }
    }
}

/// Remove every installed package matching `package`
///
/// A plain version removes that exact package, a selector removes all
/// installed versions it admits.
pub fn uninstall(package: &Package, system: &System) -> Result<Vec<Package>> {
    let targets = if package.is_selector() {
        system.database.find_packages(package)?
    } else {
        vec![system.database.get_package(&package.fingerprint())?]
    };

    if targets.is_empty() {
        return Err(Error::NotFoundError(format!(
            "{} is not installed",
            package.human_readable()
        )));
    }

    for target in &targets {
        let fingerprint = target.fingerprint();
        let removed = system.remove_files(&fingerprint, &HashSet::new())?;
        system.database.remove_package(&fingerprint)?;
        info!("Uninstalled {} ({} files removed)", target, removed);
    }

    Ok(targets)
}

/// Record an artifact as installed without unpacking it
pub fn register_artifact(artifact: &Artifact, system: &System) -> Result<Fingerprint> {
    let package = artifact.package();
    let fingerprint = system.database.create_package(package)?;
    system
        .database
        .set_package_files(&PackageFile::new(fingerprint.clone(), artifact.files.clone()))?;
    info!("{} registered", package);
    Ok(fingerprint)
}
