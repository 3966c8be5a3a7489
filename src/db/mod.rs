// src/db/mod.rs

//! Package database layer for Kiln
//!
//! This module defines the `PackageStore` contract and its two backends:
//! - `MemoryStore`: ephemeral, optionally shared for the whole process run
//! - `SqliteStore`: durable, one directory per database instance
//!
//! Both are safe to share between builder and installer workers.

mod memory;
pub mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package, PackageFile};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the SQLite database inside a durable store directory
pub const DATABASE_FILE: &str = "kiln.db";

/// Key/value store of package metadata and file manifests
pub trait PackageStore: Send + Sync {
    /// Store a package; fails with `AlreadyExists` if its fingerprint is taken
    fn create_package(&self, package: &Package) -> Result<Fingerprint>;

    /// Fetch a package by fingerprint
    fn get_package(&self, fingerprint: &Fingerprint) -> Result<Package>;

    /// Every package, in insertion order
    fn world(&self) -> Result<Vec<Package>>;

    /// Attach or replace the file manifest of a package
    fn set_package_files(&self, files: &PackageFile) -> Result<()>;

    /// Files owned by a package (empty if no manifest was recorded)
    fn get_package_files(&self, fingerprint: &Fingerprint) -> Result<Vec<String>>;

    /// Drop a package and its file manifest
    fn remove_package(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Release backend resources
    fn clean(&self) -> Result<()>;

    /// World entries with the same category/name admitted by `selector`
    fn find_packages(&self, selector: &Package) -> Result<Vec<Package>> {
        let mut found = Vec::new();
        for package in self.world()? {
            if selector.matches(&package)? {
                found.push(package);
            }
        }
        Ok(found)
    }

    /// True when the fingerprint is present
    fn has_package(&self, fingerprint: &Fingerprint) -> Result<bool> {
        match self.get_package(fingerprint) {
            Ok(_) => Ok(true),
            Err(Error::NotFoundError(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Open a store by engine name (`memory` or `sqlite`)
///
/// For `sqlite`, `path` is the database directory; `None` gives a
/// temporary directory removed on `clean`.
pub fn open_store(engine: &str, path: Option<&Path>) -> Result<Arc<dyn PackageStore>> {
    match engine {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "sqlite" | "boltdb" => match path {
            Some(dir) => Ok(Arc::new(SqliteStore::open(dir)?)),
            None => Ok(Arc::new(SqliteStore::temporary()?)),
        },
        other => Err(Error::ConfigError(format!(
            "Unknown database engine '{}'",
            other
        ))),
    }
}

/// Open the store describing an installed system
///
/// Like `open_store`, except that a `memory` system database keeps its
/// entries on `clean` for the rest of the run.
pub fn open_system_store(engine: &str, path: Option<&Path>) -> Result<Arc<dyn PackageStore>> {
    match engine {
        "memory" => Ok(Arc::new(MemoryStore::persistent())),
        other => open_store(other, path),
    }
}

/// Initialize a new SQLite database at the specified path
///
/// Creates the database file, sets pragmas and applies the schema.
/// This is idempotent - calling it on an existing database is safe.
pub fn init(db_path: &Path) -> Result<Connection> {
    debug!("Initializing database at: {}", db_path.display());

    // Create parent directories if they don't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    // Set pragmas for better performance and reliability
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;

    info!("Database initialized at {}", db_path.display());
    Ok(conn)
}

/// Open an existing SQLite database
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_path_buf();

        // Remove the temp file so init can create it
        drop(temp_file);

        let result = init(&db_path);
        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path();

        init(db_path).unwrap();
        assert!(open(db_path).is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open(Path::new("/nonexistent/path/kiln.db"));
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    #[test]
    fn test_open_store_by_engine() {
        let store = open_store("memory", None).unwrap();
        assert!(store.world().unwrap().is_empty());

        let store = open_store("sqlite", None).unwrap();
        let pkg = Package::new("foo", "app", "1.0");
        store.create_package(&pkg).unwrap();
        assert!(store.has_package(&pkg.fingerprint()).unwrap());
        store.clean().unwrap();

        assert!(matches!(
            open_store("etcd", None),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_system_store_in_memory_survives_clean() {
        let pkg = Package::new("foo", "app", "1.0");

        let system = open_system_store("memory", None).unwrap();
        system.create_package(&pkg).unwrap();
        system.clean().unwrap();
        assert!(system.has_package(&pkg.fingerprint()).unwrap());

        let scratch = open_store("memory", None).unwrap();
        scratch.create_package(&pkg).unwrap();
        scratch.clean().unwrap();
        assert!(!scratch.has_package(&pkg.fingerprint()).unwrap());

        assert!(matches!(
            open_system_store("etcd", None),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_find_packages_filters_by_selector() {
        let store = MemoryStore::new();
        for version in ["1.0", "1.5", "2.0"] {
            store
                .create_package(&Package::new("foo", "app", version))
                .unwrap();
        }
        store
            .create_package(&Package::new("bar", "app", "1.5"))
            .unwrap();

        let found = store
            .find_packages(&Package::new("foo", "app", ">=1.5"))
            .unwrap();
        let versions: Vec<_> = found.iter().map(|p| p.version.as_str()).collect();
        assert_eq!(versions, vec!["1.5", "2.0"]);
    }
}
