// src/db/sqlite.rs

//! Durable package store backed by an embedded SQLite database
//!
//! Each store owns a directory containing `kiln.db`. A temporary store
//! lives in a scratch directory that `clean` removes.

use super::{DATABASE_FILE, PackageStore};
use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package, PackageFile};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use tracing::{debug, info};

/// SQLite-backed store
#[derive(Debug)]
pub struct SqliteStore {
    dir: PathBuf,
    conn: Mutex<Option<Connection>>,
    scratch: Mutex<Option<TempDir>>,
}

impl SqliteStore {
    /// Open (creating if needed) the store in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::InitError(format!(
                "Failed to create database directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let conn = super::init(&dir.join(DATABASE_FILE))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            conn: Mutex::new(Some(conn)),
            scratch: Mutex::new(None),
        })
    }

    /// A store in a fresh temporary directory
    pub fn temporary() -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("kiln-db").tempdir()?;
        let mut store = Self::open(scratch.path())?;
        store.scratch = Mutex::new(Some(scratch));
        Ok(store)
    }

    /// Directory holding the database files
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| Error::InitError("Database lock poisoned".to_string()))?;
        let conn = guard.as_ref().ok_or_else(|| {
            Error::InitError(format!("Database at {} is closed", self.dir.display()))
        })?;
        f(conn)
    }
}

fn decode_package(metadata: &str) -> Result<Package> {
    Ok(serde_json::from_str(metadata)?)
}

impl PackageStore for SqliteStore {
    fn create_package(&self, package: &Package) -> Result<Fingerprint> {
        let fingerprint = package.fingerprint();
        let metadata = serde_json::to_string(package)?;

        self.with_conn(|conn| {
            // First writer wins; the UNIQUE constraint arbitrates
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO packages (fingerprint, category, name, version, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fingerprint.as_str(),
                    &package.category,
                    &package.name,
                    &package.version,
                    &metadata,
                ],
            )?;

            if inserted == 0 {
                return Err(Error::AlreadyExists(fingerprint.to_string()));
            }
            debug!("Stored {} in {}", fingerprint, self.dir.display());
            Ok(fingerprint.clone())
        })
    }

    fn get_package(&self, fingerprint: &Fingerprint) -> Result<Package> {
        let metadata: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT metadata FROM packages WHERE fingerprint = ?1",
                    [fingerprint.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match metadata {
            Some(metadata) => decode_package(&metadata),
            None => Err(Error::NotFoundError(format!(
                "Package {} not found",
                fingerprint
            ))),
        }
    }

    fn world(&self) -> Result<Vec<Package>> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT metadata FROM packages ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.iter().map(|m| decode_package(m)).collect()
    }

    fn set_package_files(&self, files: &PackageFile) -> Result<()> {
        let encoded = serde_json::to_string(&files.files)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO package_files (fingerprint, files) VALUES (?1, ?2)",
                params![files.fingerprint.as_str(), &encoded],
            )?;
            Ok(())
        })
    }

    fn get_package_files(&self, fingerprint: &Fingerprint) -> Result<Vec<String>> {
        let encoded: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT files FROM package_files WHERE fingerprint = ?1",
                    [fingerprint.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match encoded {
            Some(encoded) => Ok(serde_json::from_str(&encoded)?),
            None => Ok(Vec::new()),
        }
    }

    fn remove_package(&self, fingerprint: &Fingerprint) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::InitError("Database lock poisoned".to_string()))?;
        let conn = guard.as_mut().ok_or_else(|| {
            Error::InitError(format!("Database at {} is closed", self.dir.display()))
        })?;

        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM packages WHERE fingerprint = ?1",
            [fingerprint.as_str()],
        )?;
        if removed == 0 {
            return Err(Error::NotFoundError(format!(
                "Package {} not found",
                fingerprint
            )));
        }
        tx.execute(
            "DELETE FROM package_files WHERE fingerprint = ?1",
            [fingerprint.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        let scratch = self
            .scratch
            .lock()
            .map_err(|_| Error::InitError("Database lock poisoned".to_string()))?
            .take();

        // Only scratch databases are torn down; durable ones stay usable
        if let Some(scratch) = scratch {
            if let Ok(mut conn) = self.conn.lock() {
                conn.take();
            }
            info!("Removing temporary database {}", self.dir.display());
            scratch.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let pkg = Package::new("zlib", "sys-libs", "1.2.13")
            .with_requires(vec![Package::new("glibc", "sys-libs", ">=2.30")]);

        {
            let store = SqliteStore::open(temp.path()).unwrap();
            let fp = store.create_package(&pkg).unwrap();
            store
                .set_package_files(&PackageFile::new(fp, vec!["usr/lib/libz.so".into()]))
                .unwrap();
            store.clean().unwrap();
        }

        let store = SqliteStore::open(temp.path()).unwrap();
        assert!(temp.path().join(DATABASE_FILE).exists());
        assert_eq!(store.get_package(&pkg.fingerprint()).unwrap(), pkg);
        assert_eq!(
            store.get_package_files(&pkg.fingerprint()).unwrap(),
            vec!["usr/lib/libz.so"]
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = SqliteStore::temporary().unwrap();
        let pkg = Package::new("foo", "app", "1.0");
        store.create_package(&pkg).unwrap();

        let mut altered = pkg.clone();
        altered.description = Some("second".into());
        assert!(matches!(
            store.create_package(&altered),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(store.get_package(&pkg.fingerprint()).unwrap().description, None);
        store.clean().unwrap();
    }

    #[test]
    fn test_concurrent_creates_have_single_winner() {
        let store = Arc::new(SqliteStore::temporary().unwrap());
        let pkg = Package::new("foo", "app", "1.0");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let pkg = pkg.clone();
                thread::spawn(move || store.create_package(&pkg).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.world().unwrap(), vec![pkg]);
        store.clean().unwrap();
    }

    #[test]
    fn test_world_order_and_remove() {
        let store = SqliteStore::temporary().unwrap();
        for name in ["b", "a", "c"] {
            store.create_package(&Package::new(name, "x", "1")).unwrap();
        }
        let names: Vec<_> = store.world().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);

        let fp = Package::new("a", "x", "1").fingerprint();
        store.remove_package(&fp).unwrap();
        assert!(matches!(
            store.get_package(&fp),
            Err(Error::NotFoundError(_))
        ));
        assert!(matches!(
            store.remove_package(&fp),
            Err(Error::NotFoundError(_))
        ));
        store.clean().unwrap();
    }

    #[test]
    fn test_clean_removes_temporary_directory() {
        let store = SqliteStore::temporary().unwrap();
        let dir = store.path().to_path_buf();
        assert!(dir.exists());

        store.clean().unwrap();
        assert!(!dir.exists());
        assert!(store.world().is_err());
    }
}
