// src/compiler/mod.rs

//! Build pipeline
//!
//! Requested specs are expanded through the solver into their build
//! closure, ordered, and handed to the scheduler. Each spec then moves
//! through `Building` (backend build or cached image) and `Packaging`
//! (export, archive, metadata) on its own worker.
//!
//! Both entry points return every artifact produced and every error met;
//! one failing package only takes down the specs that depend on it.

mod artifact;
mod backend;
mod local;
mod scheduler;
mod spec;

pub use artifact::{Artifact, file_checksum, list_files, unpack_archive, verify_checksum};
pub use backend::{Backend, BuildOutput};
pub use local::LocalBackend;
pub use spec::{BuildInstructions, CompileSpec, CompileState, CompressionType, RecipeBook};

use crate::db::PackageStore;
use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package};
use crate::solver::{Solver, SolverOptions};
use crate::version;
use scheduler::{Outcome, Scheduler};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Default image repository for intermediate images
pub const DEFAULT_IMAGE_REPOSITORY: &str = "kiln/cache";

/// Compiler configuration
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub solver: SolverOptions,
    pub concurrency: usize,
    pub compression: CompressionType,
    /// Build only the named specs, assuming dependencies are available
    pub no_deps: bool,
    /// Build the dependencies of the named specs but not the specs
    pub only_deps: bool,
    /// Try to pull `{image_repository}:{hash}` before building
    pub pull_first: bool,
    pub push: bool,
    pub keep_img: bool,
    pub keep_exported_images: bool,
    pub image_repository: String,
    /// When false, specs with an artifact already in the output path are
    /// not rebuilt
    pub clean: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            concurrency: default_concurrency(),
            compression: CompressionType::None,
            no_deps: false,
            only_deps: false,
            pull_first: false,
            push: false,
            keep_img: true,
            keep_exported_images: false,
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            clean: true,
        }
    }
}

/// Number of CPUs, or 1 when it cannot be determined
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub struct Compiler {
    backend: Arc<dyn Backend>,
    database: Arc<dyn PackageStore>,
    recipes: RecipeBook,
    options: CompilerOptions,
}

impl Compiler {
    pub fn new(
        backend: Arc<dyn Backend>,
        database: Arc<dyn PackageStore>,
        options: CompilerOptions,
    ) -> Self {
        Self {
            backend,
            database,
            recipes: RecipeBook::default(),
            options,
        }
    }

    /// Build instructions looked up by `from_package`
    pub fn with_recipes(mut self, recipes: RecipeBook) -> Self {
        self.recipes = recipes;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Resolve a (possibly selector) package to the newest matching
    /// package in the database and wrap it in a spec
    pub fn from_package(&self, package: &Package) -> Result<CompileSpec> {
        let found = self
            .database
            .find_packages(package)?
            .into_iter()
            .max_by(|a, b| version::compare_versions(&a.version, &b.version))
            .ok_or_else(|| {
                Error::NotFoundError(format!("No package matches {}", package.human_readable()))
            })?;

        debug!("Selected {} for {}", found, package.human_readable());
        Ok(self.spec_for(found))
    }

    fn spec_for(&self, package: Package) -> CompileSpec {
        let instructions = self.recipes.instructions_for(&package);
        let mut spec = CompileSpec::new(package, instructions);
        spec.compression = self.options.compression;
        spec
    }

    /// Build every spec and its dependency closure
    pub fn compile_parallel(
        &self,
        privileged: bool,
        specs: Vec<CompileSpec>,
    ) -> (Vec<Artifact>, Vec<Error>) {
        self.compile(privileged, specs, false)
    }

    /// Like `compile_parallel`, also rebuilding everything in the database
    /// that depends on the specs
    pub fn compile_with_reverse_deps(
        &self,
        privileged: bool,
        specs: Vec<CompileSpec>,
    ) -> (Vec<Artifact>, Vec<Error>) {
        self.compile(privileged, specs, true)
    }

    /// Drop the backend's images unless `keep_img` is set
    pub fn clean_images(&self) -> Result<()> {
        if self.options.keep_img {
            return Ok(());
        }
        debug!("Removing build images");
        self.backend.clean()
    }

    fn compile(
        &self,
        privileged: bool,
        specs: Vec<CompileSpec>,
        reverse_deps: bool,
    ) -> (Vec<Artifact>, Vec<Error>) {
        let (plan, mut errors) = self.plan(specs, reverse_deps);
        if plan.is_empty() {
            return (Vec::new(), errors);
        }

        let (artifacts, build_errors) = self.execute(privileged, plan);
        errors.extend(build_errors);
        (artifacts, errors)
    }

    /// The ordered set of specs a compile would build, all `Scheduled`
    ///
    /// Specs that could not be resolved are reported as errors and left out.
    pub fn plan(
        &self,
        specs: Vec<CompileSpec>,
        reverse_deps: bool,
    ) -> (Vec<CompileSpec>, Vec<Error>) {
        let mut errors = Vec::new();

        let world = match self.database.world() {
            Ok(world) => world,
            Err(e) => return (Vec::new(), vec![e]),
        };

        let mut requested = specs;
        if reverse_deps {
            let targets: Vec<Package> = requested.iter().map(|s| s.package.clone()).collect();
            match Solver::reverse_dependencies(&targets, &world) {
                Ok(dependents) => {
                    let template = requested.first().cloned();
                    for package in dependents {
                        info!("Adding reverse dependency {}", package);
                        let mut spec = self.spec_for(package);
                        if let Some(template) = &template {
                            spec.output_path = template.output_path.clone();
                            spec.compression = template.compression;
                        }
                        requested.push(spec);
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        let solver = Solver::new(self.options.solver.clone());
        let targets: HashSet<Fingerprint> = requested.iter().map(|s| s.fingerprint()).collect();
        let mut closure: Vec<CompileSpec> = Vec::new();
        let mut included: HashSet<Fingerprint> = HashSet::new();

        for mut spec in requested {
            if let Err(e) = spec.transition(CompileState::Resolving) {
                errors.push(e);
                continue;
            }

            let members = if self.options.no_deps {
                Ok(vec![spec.package.clone()])
            } else {
                solver.solve_build(std::slice::from_ref(&spec.package), &world)
            };

            let members = match members {
                Ok(members) => members,
                Err(e) => {
                    error!("Cannot resolve {}: {}", spec.package, e);
                    // Resolving -> Failed is always legal
                    let _ = spec.transition(CompileState::Failed);
                    errors.push(e);
                    continue;
                }
            };

            for package in members {
                let fingerprint = package.fingerprint();
                if included.contains(&fingerprint) {
                    continue;
                }
                let mut member = if fingerprint == spec.fingerprint() {
                    spec.clone()
                } else {
                    let mut dep = self.spec_for(package);
                    dep.output_path = spec.output_path.clone();
                    dep.compression = spec.compression;
                    if let Err(e) = dep.transition(CompileState::Resolving) {
                        errors.push(e);
                        continue;
                    }
                    dep
                };
                if let Err(e) = member.transition(CompileState::Scheduled) {
                    errors.push(e);
                    continue;
                }
                included.insert(fingerprint);
                closure.push(member);
            }
        }

        if self.options.only_deps {
            closure.retain(|s| !targets.contains(&s.fingerprint()));
        }

        let packages: Vec<Package> = closure.iter().map(|s| s.package.clone()).collect();
        let ordered = match Solver::order(&packages, true) {
            Ok(ordered) => ordered,
            Err(e) => {
                errors.push(e);
                return (Vec::new(), errors);
            }
        };

        let mut by_fingerprint: HashMap<Fingerprint, CompileSpec> =
            closure.into_iter().map(|s| (s.fingerprint(), s)).collect();
        let plan: Vec<CompileSpec> = ordered
            .iter()
            .filter_map(|p| by_fingerprint.remove(&p.fingerprint()))
            .collect();

        info!(
            "Build plan: {}",
            plan.iter()
                .map(|s| s.package.human_readable())
                .collect::<Vec<_>>()
                .join(" ")
        );
        (plan, errors)
    }

    fn execute(&self, privileged: bool, plan: Vec<CompileSpec>) -> (Vec<Artifact>, Vec<Error>) {
        let packages: Vec<Package> = plan.iter().map(|s| s.package.clone()).collect();
        let dependencies = match Solver::dependency_graph(&packages, true) {
            Ok(dependencies) => dependencies,
            Err(e) => return (Vec::new(), vec![e]),
        };
        let scheduler = match Scheduler::new(self.options.concurrency) {
            Ok(scheduler) => scheduler,
            Err(e) => return (Vec::new(), vec![e]),
        };

        let labels: Vec<String> = packages.iter().map(|p| p.human_readable()).collect();
        let slots: Vec<Mutex<CompileSpec>> = plan.into_iter().map(Mutex::new).collect();

        let outcomes = scheduler.run(&labels, &dependencies, |i| {
            let mut spec = slots[i].lock().map_err(|_| Error::BuildError {
                package: labels[i].clone(),
                reason: "spec lock poisoned".to_string(),
            })?;
            let result = self.build_one(&mut spec, privileged);
            if result.is_err() {
                let _ = spec.transition(CompileState::Failed);
            }
            result
        });

        let mut artifacts = Vec::new();
        let mut errors = Vec::new();
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Outcome::Done(artifact) => artifacts.push(artifact),
                Outcome::Failed(e) => {
                    error!("{}", e);
                    errors.push(e);
                }
                Outcome::Skipped { dependency } => {
                    if let Ok(mut spec) = slots[i].lock() {
                        let _ = spec.transition(CompileState::Failed);
                    }
                    warn!("Skipping {}: {} failed", labels[i], labels[dependency]);
                    errors.push(Error::DependencyFailed {
                        package: labels[i].clone(),
                        dependency: labels[dependency].clone(),
                    });
                }
            }
        }

        info!(
            "Compiled {} artifacts, {} errors",
            artifacts.len(),
            errors.len()
        );
        (artifacts, errors)
    }

    fn build_one(&self, spec: &mut CompileSpec, privileged: bool) -> Result<Artifact> {
        let package = spec.package.human_readable();
        self.run_stages(spec, privileged).map_err(|e| match e {
            Error::BuildError { .. } => e,
            other => Error::BuildError {
                package,
                reason: other.to_string(),
            },
        })
    }

    fn run_stages(&self, spec: &mut CompileSpec, privileged: bool) -> Result<Artifact> {
        if !self.options.clean {
            if let Some(artifact) = self.existing_artifact(spec)? {
                info!("Reusing {} for {}", artifact.path.display(), spec.package);
                spec.transition(CompileState::Building)?;
                spec.transition(CompileState::Packaging)?;
                spec.transition(CompileState::Done)?;
                return Ok(artifact);
            }
        }

        spec.transition(CompileState::Building)?;
        let output_dir = spec.output_path()?.to_path_buf();
        let image = spec.image_name(&self.options.image_repository);

        let cached = if self.options.pull_first {
            self.backend.pull(&image)?
        } else {
            None
        };
        let output = match cached {
            Some(output) => {
                info!("Using cached image {} for {}", image, spec.package);
                output
            }
            None => self.backend.build(spec, &image, privileged)?,
        };

        spec.transition(CompileState::Packaging)?;
        let export_dir = output_dir.join(format!("{}.export", spec.artifact_stem()));
        if export_dir.exists() {
            fs::remove_dir_all(&export_dir)?;
        }
        self.backend.export(&output, &export_dir)?;

        let artifact = Artifact::create(spec, &export_dir, &output_dir)?;
        artifact.write_metadata()?;

        if self.options.push {
            self.backend.push(&image)?;
        }
        if !self.options.keep_exported_images {
            fs::remove_dir_all(&export_dir)?;
        }
        if !self.options.keep_img {
            self.backend.remove_image(&image)?;
        }

        spec.transition(CompileState::Done)?;
        Ok(artifact)
    }

    /// Artifact left in the output path by an earlier build of this spec
    fn existing_artifact(&self, spec: &CompileSpec) -> Result<Option<Artifact>> {
        let metadata = spec.output_path()?.join(spec.metadata_file_name());
        if !metadata.is_file() {
            return Ok(None);
        }
        let artifact = Artifact::load_metadata(&metadata)?;
        if !artifact.path.is_file() {
            debug!("Metadata {} has no archive, rebuilding", metadata.display());
            return Ok(None);
        }
        Ok(Some(artifact))
    }
}
