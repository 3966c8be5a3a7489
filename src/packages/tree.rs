// src/packages/tree.rs

//! Package tree loader
//!
//! A tree is a directory where every package lives in its own folder:
//!
//! ```text
//! tree/
//!   sys-libs/zlib/1.2.13/definition.json
//!   sys-libs/zlib/1.2.13/build.json
//!   app/foo/definition.json
//! ```
//!
//! `definition.json` holds the serialized `Package`; the optional
//! `build.json` next to it holds the `BuildInstructions` for that package.

use crate::compiler::{BuildInstructions, RecipeBook};
use crate::db::PackageStore;
use crate::error::{Error, Result};
use crate::packages::Package;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File name of a package definition inside a tree
pub const DEFINITION_FILE: &str = "definition.json";

/// File name of the build instructions next to a definition
pub const BUILD_FILE: &str = "build.json";

/// Packages and build recipes loaded from a tree
#[derive(Debug, Default)]
pub struct Tree {
    pub packages: Vec<Package>,
    pub recipes: RecipeBook,
}

impl Tree {
    /// Load every definition below `root`, in file-name order
    pub fn load(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::NotFoundError(format!(
                "Tree directory {} does not exist",
                root.display()
            )));
        }

        let mut tree = Tree::default();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() || entry.file_name() != DEFINITION_FILE {
                continue;
            }

            let content = fs::read_to_string(entry.path())?;
            let package: Package = serde_json::from_str(&content).map_err(|e| {
                Error::ParseError(format!("{}: {}", entry.path().display(), e))
            })?;

            let build_path = entry.path().with_file_name(BUILD_FILE);
            if build_path.is_file() {
                let content = fs::read_to_string(&build_path)?;
                let instructions: BuildInstructions =
                    serde_json::from_str(&content).map_err(|e| {
                        Error::ParseError(format!("{}: {}", build_path.display(), e))
                    })?;
                tree.recipes.insert(package.fingerprint(), instructions);
            }

            debug!("Loaded {} from {}", package, entry.path().display());
            tree.packages.push(package);
        }

        info!(
            "Loaded {} packages ({} with build instructions) from {}",
            tree.packages.len(),
            tree.recipes.len(),
            root.display()
        );
        Ok(tree)
    }

    /// Insert all loaded packages into a database, skipping duplicates
    pub fn populate(&self, store: &dyn PackageStore) -> Result<usize> {
        let mut created = 0;
        for package in &self.packages {
            match store.create_package(package) {
                Ok(_) => created += 1,
                Err(Error::AlreadyExists(fp)) => {
                    warn!("Skipping duplicate package {}", fp);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use tempfile::TempDir;

    fn write_definition(root: &Path, dir: &str, package: &Package, build: Option<&str>) {
        let pkg_dir = root.join(dir);
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(
            pkg_dir.join(DEFINITION_FILE),
            serde_json::to_string_pretty(package).unwrap(),
        )
        .unwrap();
        if let Some(build) = build {
            fs::write(pkg_dir.join(BUILD_FILE), build).unwrap();
        }
    }

    #[test]
    fn test_load_tree() {
        let temp = TempDir::new().unwrap();
        let zlib = Package::new("zlib", "sys-libs", "1.2.13");
        let app = Package::new("app", "apps", "1.0")
            .with_requires(vec![Package::new("zlib", "sys-libs", ">=1.2")]);

        write_definition(temp.path(), "sys-libs/zlib", &zlib, Some(r#"{"steps": ["make"]}"#));
        write_definition(temp.path(), "apps/app", &app, None);

        let tree = Tree::load(temp.path()).unwrap();
        assert_eq!(tree.packages.len(), 2);
        assert_eq!(tree.recipes.len(), 1);
        assert_eq!(
            tree.recipes.get(&zlib.fingerprint()).unwrap().steps,
            vec!["make".to_string()]
        );

        let store = MemoryStore::new();
        assert_eq!(tree.populate(&store).unwrap(), 2);
        // Second population only hits duplicates
        assert_eq!(tree.populate(&store).unwrap(), 0);
    }

    #[test]
    fn test_load_missing_tree() {
        let result = Tree::load(Path::new("/nonexistent/kiln/tree"));
        assert!(matches!(result, Err(Error::NotFoundError(_))));
    }

    #[test]
    fn test_load_invalid_definition() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DEFINITION_FILE), "{ not json").unwrap();

        assert!(matches!(Tree::load(temp.path()), Err(Error::ParseError(_))));
    }
}
