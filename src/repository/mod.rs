// src/repository/mod.rs

//! Artifact repositories
//!
//! This module provides functionality for:
//! - Describing repositories (name, mirrors, priority)
//! - Generating the `repository.json` index from a build output directory
//! - Synchronizing an index from the repository mirrors
//! - Downloading artifacts (see `client`)

pub mod client;

pub use client::{DownloadClient, HttpClient, LocalClient};

use crate::compiler::Artifact;
use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the repository index
pub const REPOSITORY_INDEX: &str = "repository.json";

/// Suffix of artifact metadata files picked up by `generate`
const METADATA_SUFFIX: &str = ".metadata.json";

/// Transport used to reach a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    #[default]
    Http,
    #[serde(alias = "disk")]
    Local,
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryType::Http => f.write_str("http"),
            RepositoryType::Local => f.write_str("local"),
        }
    }
}

impl std::str::FromStr for RepositoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" | "https" => Ok(RepositoryType::Http),
            "local" | "disk" => Ok(RepositoryType::Local),
            other => Err(Error::ConfigError(format!(
                "Unknown repository type '{}'",
                other
            ))),
        }
    }
}

/// Repository descriptor plus its artifact index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub repo_type: RepositoryType,
    /// Mirrors, tried in order
    #[serde(default)]
    pub urls: Vec<String>,
    /// Lower values are consulted first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub revision: u64,
    /// RFC 3339 time of the last index generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    #[serde(default)]
    pub index: Vec<Artifact>,
}

impl Repository {
    pub fn new(name: impl Into<String>, repo_type: RepositoryType, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            repo_type,
            urls,
            priority: 0,
            revision: 0,
            last_update: None,
            index: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Build the index from every `*.metadata.json` in `dir`
    ///
    /// The revision continues from an index already present in `dir`.
    /// Artifact paths are reduced to file names, relative to the mirrors.
    pub fn generate(mut self, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::NotFoundError(format!(
                "Artifact directory {} does not exist",
                dir.display()
            )));
        }

        let previous = dir.join(REPOSITORY_INDEX);
        let revision = if previous.is_file() {
            match Self::load(&previous) {
                Ok(old) => old.revision,
                Err(e) => {
                    warn!("Ignoring unreadable index {}: {}", previous.display(), e);
                    0
                }
            }
        } else {
            0
        };

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().ends_with(METADATA_SUFFIX))
            })
            .collect();
        entries.sort();

        let mut index = Vec::with_capacity(entries.len());
        for path in entries {
            let artifact = Artifact::load_metadata(&path)?;
            let file_name = artifact.file_name();
            if !dir.join(&file_name).is_file() {
                warn!("{} has no archive {}, skipping", path.display(), file_name);
                continue;
            }
            debug!("Indexing {}", artifact.package());
            index.push(artifact.with_path(file_name));
        }

        self.index = index;
        self.revision = revision + 1;
        self.last_update = Some(chrono::Utc::now().to_rfc3339());

        info!(
            "Generated repository {} revision {} with {} artifacts",
            self.name,
            self.revision,
            self.index.len()
        );
        Ok(self)
    }

    /// Write `repository.json` into `dir`
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(REPOSITORY_INDEX);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Download client for this repository's mirrors
    pub fn client(&self) -> Result<Box<dyn DownloadClient>> {
        match self.repo_type {
            RepositoryType::Http => Ok(Box::new(HttpClient::new(self.urls.clone())?)),
            RepositoryType::Local => Ok(Box::new(LocalClient::new(
                self.urls.iter().map(PathBuf::from).collect(),
            )?)),
        }
    }

    /// Fetch the remote index through `client`
    ///
    /// Name, mirrors, type and priority stay as configured locally.
    pub fn sync_with(&self, client: &dyn DownloadClient) -> Result<Self> {
        info!("Synchronizing repository: {}", self.name);
        let path = client.download_file(REPOSITORY_INDEX)?;
        let remote = Self::load(&path)?;

        Ok(Self {
            name: self.name.clone(),
            description: if self.description.is_empty() {
                remote.description
            } else {
                self.description.clone()
            },
            repo_type: self.repo_type,
            urls: self.urls.clone(),
            priority: self.priority,
            revision: remote.revision,
            last_update: remote.last_update,
            index: remote.index,
        })
    }

    pub fn sync(&self) -> Result<Self> {
        let client = self.client()?;
        self.sync_with(client.as_ref())
    }

    /// Packages described by the index
    pub fn world(&self) -> Vec<Package> {
        self.index.iter().map(|a| a.package().clone()).collect()
    }

    pub fn find_artifact(&self, fingerprint: &Fingerprint) -> Option<&Artifact> {
        self.index
            .iter()
            .find(|a| &a.package().fingerprint() == fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{BuildInstructions, CompileSpec};
    use tempfile::TempDir;

    fn build_artifact(dir: &Path, name: &str) -> Artifact {
        let source = dir.join(format!("{}-src", name));
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(name), name).unwrap();

        let spec = CompileSpec::new(Package::new(name, "app", "1.0"), BuildInstructions::default());
        let artifact = Artifact::create(&spec, &source, dir).unwrap();
        artifact.write_metadata().unwrap();
        fs::remove_dir_all(&source).unwrap();
        artifact
    }

    #[test]
    fn test_generate_and_reload() {
        let temp = TempDir::new().unwrap();
        build_artifact(temp.path(), "foo");
        build_artifact(temp.path(), "bar");
        // Metadata without archive is left out
        let ghost = build_artifact(temp.path(), "ghost");
        fs::remove_file(&ghost.path).unwrap();

        let repo = Repository::new("main", RepositoryType::Local, vec![])
            .with_description("test repo")
            .generate(temp.path())
            .unwrap();
        assert_eq!(repo.revision, 1);
        assert_eq!(repo.index.len(), 2);
        assert!(repo.last_update.is_some());
        assert_eq!(repo.index[0].path, PathBuf::from("bar-app-1.0.package.tar"));

        let path = repo.write(temp.path()).unwrap();
        let loaded = Repository::load(&path).unwrap();
        assert_eq!(loaded, repo);

        let again = Repository::new("main", RepositoryType::Local, vec![])
            .generate(temp.path())
            .unwrap();
        assert_eq!(again.revision, 2);

        let fp = Package::new("foo", "app", "1.0").fingerprint();
        assert!(repo.find_artifact(&fp).is_some());
        assert_eq!(repo.world().len(), 2);
    }

    #[test]
    fn test_sync_from_local_mirror() {
        let temp = TempDir::new().unwrap();
        build_artifact(temp.path(), "foo");
        Repository::new("upstream", RepositoryType::Local, vec![])
            .with_description("remote description")
            .generate(temp.path())
            .unwrap()
            .write(temp.path())
            .unwrap();

        let configured = Repository::new(
            "mine",
            RepositoryType::Local,
            vec![temp.path().to_string_lossy().into_owned()],
        )
        .with_priority(5);

        let synced = configured.sync().unwrap();
        assert_eq!(synced.name, "mine");
        assert_eq!(synced.priority, 5);
        assert_eq!(synced.description, "remote description");
        assert_eq!(synced.revision, 1);
        assert_eq!(synced.index.len(), 1);
    }

    #[test]
    fn test_repository_from_toml() {
        let repo: Repository = toml::from_str(
            r#"
            name = "main"
            type = "disk"
            urls = ["/srv/kiln"]
            priority = 1
            "#,
        )
        .unwrap();
        assert_eq!(repo.repo_type, RepositoryType::Local);
        assert!(repo.index.is_empty());

        assert_eq!("disk".parse::<RepositoryType>().unwrap(), RepositoryType::Local);
        assert!("ftp".parse::<RepositoryType>().is_err());
    }
}
