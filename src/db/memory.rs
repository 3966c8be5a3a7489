// src/db/memory.rs

//! Ephemeral in-memory package store

use super::PackageStore;
use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package, PackageFile};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
    order: Vec<Fingerprint>,
    packages: HashMap<Fingerprint, Package>,
    files: HashMap<Fingerprint, Vec<String>>,
}

/// In-memory store
///
/// Clones share the same entries. A persistent store keeps its entries on
/// `clean`, so one handle can serve several operations of the same run
/// (the installed-system view); a plain store is emptied.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    persistent: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose entries survive `clean` for the rest of the run
    pub fn persistent() -> Self {
        Self {
            state: Arc::default(),
            persistent: true,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| Error::InitError("Memory database lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| Error::InitError("Memory database lock poisoned".to_string()))
    }
}

impl PackageStore for MemoryStore {
    fn create_package(&self, package: &Package) -> Result<Fingerprint> {
        let fingerprint = package.fingerprint();
        let mut state = self.write()?;

        if state.packages.contains_key(&fingerprint) {
            return Err(Error::AlreadyExists(fingerprint.to_string()));
        }

        state.order.push(fingerprint.clone());
        state.packages.insert(fingerprint.clone(), package.clone());
        debug!("Stored {} in memory database", fingerprint);
        Ok(fingerprint)
    }

    fn get_package(&self, fingerprint: &Fingerprint) -> Result<Package> {
        self.read()?
            .packages
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| Error::NotFoundError(format!("Package {} not found", fingerprint)))
    }

    fn world(&self) -> Result<Vec<Package>> {
        let state = self.read()?;
        Ok(state
            .order
            .iter()
            .filter_map(|fp| state.packages.get(fp).cloned())
            .collect())
    }

    fn set_package_files(&self, files: &PackageFile) -> Result<()> {
        self.write()?
            .files
            .insert(files.fingerprint.clone(), files.files.clone());
        Ok(())
    }

    fn get_package_files(&self, fingerprint: &Fingerprint) -> Result<Vec<String>> {
        Ok(self.read()?.files.get(fingerprint).cloned().unwrap_or_default())
    }

    fn remove_package(&self, fingerprint: &Fingerprint) -> Result<()> {
        let mut state = self.write()?;
        if state.packages.remove(fingerprint).is_none() {
            return Err(Error::NotFoundError(format!(
                "Package {} not found",
                fingerprint
            )));
        }
        state.order.retain(|fp| fp != fingerprint);
        state.files.remove(fingerprint);
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        if self.persistent {
            return Ok(());
        }
        let mut state = self.write()?;
        *state = MemoryState::default();
        Ok(())
    }
}
