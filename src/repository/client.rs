// src/repository/client.rs

//! Download clients
//!
//! Every client walks its mirror list in order and stops at the first
//! success. Files are fetched into the client's staging directory as
//! `<name>.part` and only renamed to `<name>` once complete (and verified,
//! when a checksum is known). A failed mirror never leaves a partial file
//! behind, and the staging directory is removed when the client is dropped.

use crate::compiler::{Artifact, verify_checksum};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts per mirror
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Fetches repository files from a list of mirrors
pub trait DownloadClient: Send + Sync {
    /// Download an artifact archive, returning the record with its local path
    fn download_artifact(&self, artifact: &Artifact) -> Result<Artifact>;

    /// Download a file by name, returning its local path
    fn download_file(&self, name: &str) -> Result<PathBuf>;
}

fn staging_dir() -> Result<TempDir> {
    Ok(tempfile::Builder::new().prefix("kiln-download").tempdir()?)
}

/// Only the last path component of a remote name is used locally
fn local_name(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::DownloadError(format!("Invalid file name '{}'", name)))
}

fn remove_partial(part: &Path) {
    match fs::remove_file(part) {
        Ok(()) => debug!("Removed partial download {}", part.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", part.display(), e),
    }
}

/// Try `fetch` against each mirror until one yields a complete file
fn try_mirrors<F>(
    staging: &Path,
    mirrors: &[String],
    name: &str,
    checksum: Option<&str>,
    mut fetch: F,
) -> Result<PathBuf>
where
    F: FnMut(&str, &Path) -> Result<()>,
{
    let local = local_name(name)?;
    let dest = staging.join(&local);
    let part = staging.join(format!("{}.part", local));
    let mut last_error = None;

    for mirror in mirrors {
        info!("Downloading {} from {}", name, mirror);

        let attempt = fetch(mirror, &part).and_then(|()| match checksum {
            Some(expected) if !expected.is_empty() => verify_checksum(&part, expected),
            _ => Ok(()),
        });

        match attempt {
            Ok(()) => {
                fs::rename(&part, &dest)?;
                debug!("Stored {} at {}", name, dest.display());
                return Ok(dest);
            }
            Err(e) => {
                warn!("Mirror {} failed for {}: {}", mirror, name, e);
                remove_partial(&part);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e @ Error::ChecksumMismatch { .. }) => Err(e),
        Some(e) => Err(Error::DownloadError(format!(
            "{}: every mirror failed, last error: {}",
            name, e
        ))),
        None => Err(Error::DownloadError(format!(
            "{}: no mirrors configured",
            name
        ))),
    }
}

/// HTTP(S) client with retry support
pub struct HttpClient {
    client: Client,
    mirrors: Vec<String>,
    max_retries: u32,
    staging: TempDir,
}

impl HttpClient {
    /// Create a new HTTP client over `mirrors`
    pub fn new(mirrors: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            mirrors,
            max_retries: MAX_RETRIES,
            staging: staging_dir()?,
        })
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Download one URL into `dest`, retrying transport failures
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let mut file = File::create(dest)?;
                    io::copy(&mut response, &mut file)?;
                    file.sync_all()?;
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    fn retrieve(&self, name: &str, checksum: Option<&str>) -> Result<PathBuf> {
        try_mirrors(self.staging.path(), &self.mirrors, name, checksum, |mirror, part| {
            let url = format!("{}/{}", mirror.trim_end_matches('/'), name);
            self.fetch(&url, part)
        })
    }
}

impl DownloadClient for HttpClient {
    fn download_artifact(&self, artifact: &Artifact) -> Result<Artifact> {
        let path = self.retrieve(&artifact.file_name(), Some(artifact.checksum.as_str()))?;
        Ok(artifact.with_path(path))
    }

    fn download_file(&self, name: &str) -> Result<PathBuf> {
        self.retrieve(name, None)
    }
}

/// Client for repositories on a local or mounted filesystem
pub struct LocalClient {
    mirrors: Vec<String>,
    staging: TempDir,
}

impl LocalClient {
    pub fn new(roots: Vec<PathBuf>) -> Result<Self> {
        let mirrors = roots
            .into_iter()
            .map(|root| {
                let root = root.to_string_lossy().into_owned();
                root.strip_prefix("file://").map(str::to_string).unwrap_or(root)
            })
            .collect();
        Ok(Self {
            mirrors,
            staging: staging_dir()?,
        })
    }

    fn retrieve(&self, name: &str, checksum: Option<&str>) -> Result<PathBuf> {
        try_mirrors(self.staging.path(), &self.mirrors, name, checksum, |mirror, part| {
            fs::copy(Path::new(mirror).join(name), part)?;
            Ok(())
        })
    }
}

impl DownloadClient for LocalClient {
    fn download_artifact(&self, artifact: &Artifact) -> Result<Artifact> {
        let path = self.retrieve(&artifact.file_name(), Some(artifact.checksum.as_str()))?;
        Ok(artifact.with_path(path))
    }

    fn download_file(&self, name: &str) -> Result<PathBuf> {
        self.retrieve(name, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_local_mirrors_first_success_wins() {
        let empty = TempDir::new().unwrap();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fs::write(first.path().join("data.txt"), "first").unwrap();
        fs::write(second.path().join("data.txt"), "second").unwrap();

        let client = LocalClient::new(vec![
            empty.path().to_path_buf(),
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ])
        .unwrap();

        let path = client.download_file("data.txt").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
        assert_eq!(staged_entries(client.staging.path()), vec!["data.txt"]);
    }

    #[test]
    fn test_local_missing_everywhere() {
        let empty = TempDir::new().unwrap();
        let client = LocalClient::new(vec![empty.path().to_path_buf()]).unwrap();

        let result = client.download_file("nope.tar");
        assert!(matches!(result, Err(Error::DownloadError(_))));
        assert!(staged_entries(client.staging.path()).is_empty());

        let client = LocalClient::new(Vec::new()).unwrap();
        match client.download_file("nope.tar") {
            Err(Error::DownloadError(msg)) => assert!(msg.contains("no mirrors")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_discards_download() {
        let mirror = TempDir::new().unwrap();
        fs::write(mirror.path().join("a.tar"), "content").unwrap();
        let client = LocalClient::new(vec![mirror.path().to_path_buf()]).unwrap();

        let result = client.retrieve("a.tar", Some("f".repeat(64).as_str()));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert!(staged_entries(client.staging.path()).is_empty());
    }

    #[test]
    fn test_staging_removed_on_drop() {
        let mirror = TempDir::new().unwrap();
        fs::write(mirror.path().join("a.txt"), "x").unwrap();

        let client = LocalClient::new(vec![mirror.path().to_path_buf()]).unwrap();
        let path = client.download_file("a.txt").unwrap();
        assert!(path.exists());

        drop(client);
        assert!(!path.exists());
    }

    #[test]
    fn test_http_unreachable_mirror() {
        // Nothing listens on the discard port
        let client = HttpClient::new(vec!["http://127.0.0.1:9/repo".to_string()])
            .unwrap()
            .with_retries(1);

        let result = client.download_file("repository.json");
        assert!(matches!(result, Err(Error::DownloadError(_))));
        assert!(staged_entries(client.staging.path()).is_empty());
    }
}
