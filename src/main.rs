// src/main.rs

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use kiln::compiler::{
    Artifact, CompileSpec, Compiler, CompilerOptions, CompressionType, DEFAULT_IMAGE_REPOSITORY,
    LocalBackend,
};
use kiln::config::Config;
use kiln::installer::{self, Installer, System};
use kiln::packages::{Package, Tree};
use kiln::repository::{Repository, RepositoryType};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Source-based package manager with dependency solving and parallel builds", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build packages from a package tree
    Build(BuildArgs),
    /// Install packages from the configured repositories
    Install {
        /// Packages in [category]/[name]-[version] form
        #[arg(required = true)]
        packages: Vec<String>,
        #[command(flatten)]
        system: SystemArgs,
    },
    /// Remove installed packages and their files
    Uninstall {
        /// Package in [category]/[name]-[version] form, or a selector
        package: String,
        #[command(flatten)]
        system: SystemArgs,
    },
    /// Generate repository metadata from a build output directory
    CreateRepo {
        /// Packages folder (output from build)
        #[arg(long, default_value = ".")]
        packages: PathBuf,
        /// Destination folder for repository.json
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Repository name
        #[arg(long, default_value = "kiln")]
        name: String,
        /// Repository description
        #[arg(long, default_value = "kiln")]
        descr: String,
        /// Repository URLs
        #[arg(long, value_delimiter = ',')]
        urls: Vec<String>,
        /// Repository type (http, local)
        #[arg(long = "type", default_value = "local")]
        repo_type: String,
    },
    /// Insert packages into the system database from artifact metadata
    DatabaseCreate {
        /// Artifact metadata files
        #[arg(required = true)]
        metadata: Vec<PathBuf>,
        #[command(flatten)]
        system: SystemArgs,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[derive(Args)]
struct SystemArgs {
    /// System database directory (default: system.database_path)
    #[arg(long = "system-dbpath")]
    dbpath: Option<PathBuf>,
    /// System root (default: system.rootfs)
    #[arg(long = "system-target")]
    target: Option<PathBuf>,
}

#[derive(Args)]
struct BuildArgs {
    /// Packages in [category]/[name]-[version] form
    packages: Vec<String>,
    /// Rebuild packages already present in the destination
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    clean: bool,
    /// Source package tree
    #[arg(long, default_value = ".")]
    tree: PathBuf,
    /// Destination folder
    #[arg(long, default_value = ".")]
    destination: PathBuf,
    /// Run build steps with the caller's environment
    #[arg(long)]
    privileged: bool,
    /// Database used for solving (memory, sqlite)
    #[arg(long, default_value = "memory")]
    database: String,
    /// Also rebuild packages depending on the requested ones
    #[arg(long)]
    revdeps: bool,
    /// Build every package in the tree
    #[arg(long)]
    all: bool,
    /// Artifact compression (none, gzip)
    #[arg(long, default_value = "none")]
    compression: String,
    /// Build only the requested packages
    #[arg(long)]
    nodeps: bool,
    /// Build only the dependencies of the requested packages
    #[arg(long)]
    onlydeps: bool,
    /// Repository name of intermediate images
    #[arg(long, default_value = DEFAULT_IMAGE_REPOSITORY)]
    image_repository: String,
    /// Directory holding build images
    #[arg(long)]
    image_store: Option<PathBuf>,
    /// Directory images are pushed to and pulled from
    #[arg(long)]
    image_registry: Option<PathBuf>,
    /// Push images after building
    #[arg(long)]
    push: bool,
    /// Pull images before building
    #[arg(long)]
    pull: bool,
    /// Keep built images
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    keep_images: bool,
    /// Keep exported image folders
    #[arg(long)]
    keep_exported_images: bool,
    /// Solver type (exact, stochastic)
    #[arg(long)]
    solver_type: Option<String>,
    /// Stochastic solver learning rate
    #[arg(long)]
    solver_rate: Option<f32>,
    /// Stochastic solver discount
    #[arg(long)]
    solver_discount: Option<f32>,
    /// Stochastic solver iteration budget
    #[arg(long)]
    solver_attempts: Option<usize>,
    /// Parallel builds (default: general.concurrency)
    #[arg(long)]
    concurrency: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let level = if cli.debug || config.general.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Some(Commands::Build(args)) => build(&config, args),
        Some(Commands::Install { packages, system }) => {
            let requests = parse_atoms(&packages)?;
            let system = open_system(&config, system)?;
            let installer = Installer::new(&config)?;

            let plan = installer.install(&requests, &system)?;
            for package in &plan.to_install {
                println!("Installed {}", package);
            }
            for package in &plan.to_replace {
                println!("Replaced {}", package);
            }
            if plan.to_install.is_empty() {
                println!("Nothing to do");
            }
            Ok(())
        }
        Some(Commands::Uninstall { package, system }) => {
            let package = Package::from_atom(&package)?;
            let system = open_system(&config, system)?;

            for removed in installer::uninstall(&package, &system)? {
                println!("Removed {}", removed);
            }
            Ok(())
        }
        Some(Commands::CreateRepo {
            packages,
            output,
            name,
            descr,
            urls,
            repo_type,
        }) => {
            let repo_type: RepositoryType = repo_type.parse()?;
            let repository = Repository::new(name, repo_type, urls)
                .with_description(descr)
                .generate(&packages)?;
            let path = repository.write(&output)?;
            println!(
                "Repository {} revision {} written to {}",
                repository.name,
                repository.revision,
                path.display()
            );
            Ok(())
        }
        Some(Commands::DatabaseCreate { metadata, system }) => {
            let system = open_system(&config, system)?;
            for path in metadata {
                let artifact = Artifact::load_metadata(&path)
                    .with_context(|| format!("Failed reading {}", path.display()))?;
                installer::register_artifact(&artifact, &system)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                println!("{} created", artifact.package());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "kiln", &mut std::io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("Kiln Package Manager v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'kiln --help' for usage information");
            Ok(())
        }
    }
}

fn parse_atoms(atoms: &[String]) -> Result<Vec<Package>> {
    atoms
        .iter()
        .map(|a| Package::from_atom(a).with_context(|| format!("Invalid package string {}", a)))
        .collect()
}

fn open_system(config: &Config, args: SystemArgs) -> Result<System> {
    let dbpath = args
        .dbpath
        .unwrap_or_else(|| config.system.database_path.clone());
    let target = args.target.unwrap_or_else(|| config.system.rootfs.clone());

    let database = kiln::db::open_system_store(&config.system.database_engine, Some(&dbpath))?;
    Ok(System::new(database, target))
}

fn build(config: &Config, args: BuildArgs) -> Result<()> {
    let mut solver = config.solver.clone();
    if let Some(solver_type) = &args.solver_type {
        solver.solver_type = solver_type.parse()?;
    }
    if let Some(rate) = args.solver_rate {
        solver.learn_rate = rate;
    }
    if let Some(discount) = args.solver_discount {
        solver.discount = discount;
    }
    if let Some(attempts) = args.solver_attempts {
        solver.max_attempts = attempts;
    }
    tracing::debug!("Solver {}", solver);

    let compression: CompressionType = args.compression.parse()?;
    let options = CompilerOptions {
        solver,
        concurrency: args.concurrency.unwrap_or(config.general.concurrency).max(1),
        compression,
        no_deps: args.nodeps,
        only_deps: args.onlydeps,
        pull_first: args.pull,
        push: args.push,
        keep_img: args.keep_images,
        keep_exported_images: args.keep_exported_images,
        image_repository: args.image_repository,
        clean: args.clean,
    };

    let database = kiln::db::open_store(&args.database, None)?;
    info!("Loading {}", args.tree.display());
    info!("Building in {}", args.destination.display());

    let tree = Tree::load(&args.tree)?;
    tree.populate(database.as_ref())?;

    let store = args
        .image_store
        .unwrap_or_else(|| std::env::temp_dir().join("kiln-images"));
    let mut backend = LocalBackend::new(store);
    if let Some(registry) = args.image_registry {
        backend = backend.with_registry(registry);
    }

    let compiler = Compiler::new(Arc::new(backend), Arc::clone(&database), options)
        .with_recipes(tree.recipes);

    let selected = if args.all {
        database.world()?
    } else {
        parse_atoms(&args.packages)?
    };

    let mut specs: Vec<CompileSpec> = Vec::with_capacity(selected.len());
    for package in &selected {
        let mut spec = compiler.from_package(package)?;
        info!("Selecting {}", spec.package);
        spec.set_output_path(&args.destination);
        specs.push(spec);
    }

    let (artifacts, errors) = if args.revdeps {
        compiler.compile_with_reverse_deps(args.privileged, specs)
    } else {
        compiler.compile_parallel(args.privileged, specs)
    };
    database.clean()?;
    compiler.clean_images()?;

    if !errors.is_empty() {
        for e in &errors {
            error!("Error: {}", e);
        }
        bail!("Bailing out: {} build errors", errors.len());
    }

    for artifact in &artifacts {
        info!("Artifact generated: {}", artifact.path.display());
    }
    Ok(())
}
