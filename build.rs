// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn system_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("system_dbpath")
            .long("system-dbpath")
            .value_name("PATH")
            .help("System database directory (default: system.database_path)"),
    )
    .arg(
        Arg::new("system_target")
            .long("system-target")
            .value_name("PATH")
            .help("System root (default: system.rootfs)"),
    )
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("kiln")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Kiln Contributors")
        .about("Source-based package manager with dependency solving and parallel builds")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .value_name("FILE")
                .help("Configuration file (TOML)"),
        )
        .arg(flag("debug", "Verbose logging").global(true))
        .subcommand(
            Command::new("build")
                .about("Build packages from a package tree")
                .arg(
                    Arg::new("packages")
                        .num_args(0..)
                        .help("Packages in [category]/[name]-[version] form"),
                )
                .arg(
                    Arg::new("clean")
                        .long("clean")
                        .default_value("true")
                        .help("Rebuild packages already present in the destination"),
                )
                .arg(Arg::new("tree").long("tree").default_value(".").help("Source package tree"))
                .arg(
                    Arg::new("destination")
                        .long("destination")
                        .default_value(".")
                        .help("Destination folder"),
                )
                .arg(flag("privileged", "Run build steps with the caller's environment"))
                .arg(
                    Arg::new("database")
                        .long("database")
                        .default_value("memory")
                        .help("Database used for solving (memory, sqlite)"),
                )
                .arg(flag("revdeps", "Also rebuild packages depending on the requested ones"))
                .arg(flag("all", "Build every package in the tree"))
                .arg(
                    Arg::new("compression")
                        .long("compression")
                        .default_value("none")
                        .help("Artifact compression (none, gzip)"),
                )
                .arg(flag("nodeps", "Build only the requested packages"))
                .arg(flag("onlydeps", "Build only the dependencies of the requested packages"))
                .arg(
                    Arg::new("image-repository")
                        .long("image-repository")
                        .default_value("kiln/cache")
                        .help("Repository name of intermediate images"),
                )
                .arg(Arg::new("image-store").long("image-store").help("Directory holding build images"))
                .arg(
                    Arg::new("image-registry")
                        .long("image-registry")
                        .help("Directory images are pushed to and pulled from"),
                )
                .arg(flag("push", "Push images after building"))
                .arg(flag("pull", "Pull images before building"))
                .arg(
                    Arg::new("keep-images")
                        .long("keep-images")
                        .default_value("true")
                        .help("Keep built images"),
                )
                .arg(flag("keep-exported-images", "Keep exported image folders"))
                .arg(Arg::new("solver-type").long("solver-type").help("Solver type (exact, stochastic)"))
                .arg(Arg::new("solver-rate").long("solver-rate").help("Stochastic solver learning rate"))
                .arg(Arg::new("solver-discount").long("solver-discount").help("Stochastic solver discount"))
                .arg(
                    Arg::new("solver-attempts")
                        .long("solver-attempts")
                        .help("Stochastic solver iteration budget"),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .help("Parallel builds (default: general.concurrency)"),
                ),
        )
        .subcommand(system_args(
            Command::new("install")
                .about("Install packages from the configured repositories")
                .arg(
                    Arg::new("packages")
                        .required(true)
                        .num_args(1..)
                        .help("Packages in [category]/[name]-[version] form"),
                ),
        ))
        .subcommand(system_args(
            Command::new("uninstall")
                .about("Remove installed packages and their files")
                .arg(
                    Arg::new("package")
                        .required(true)
                        .help("Package in [category]/[name]-[version] form, or a selector"),
                ),
        ))
        .subcommand(
            Command::new("create-repo")
                .about("Generate repository metadata from a build output directory")
                .arg(
                    Arg::new("packages")
                        .long("packages")
                        .default_value(".")
                        .help("Packages folder (output from build)"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .default_value(".")
                        .help("Destination folder for repository.json"),
                )
                .arg(Arg::new("name").long("name").default_value("kiln").help("Repository name"))
                .arg(
                    Arg::new("descr")
                        .long("descr")
                        .default_value("kiln")
                        .help("Repository description"),
                )
                .arg(
                    Arg::new("urls")
                        .long("urls")
                        .value_delimiter(',')
                        .help("Repository URLs"),
                )
                .arg(
                    Arg::new("type")
                        .long("type")
                        .default_value("local")
                        .help("Repository type (http, local)"),
                ),
        )
        .subcommand(system_args(
            Command::new("database-create")
                .about("Insert packages into the system database from artifact metadata")
                .arg(
                    Arg::new("metadata")
                        .required(true)
                        .num_args(1..)
                        .help("Artifact metadata files"),
                ),
        ))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("kiln.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
