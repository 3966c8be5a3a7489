// src/compiler/artifact.rs

//! Packaged build output
//!
//! An artifact is a tar archive (optionally gzip compressed) plus a JSON
//! metadata sidecar describing the spec it came from, the files it holds
//! and its SHA-256 checksum. The sidecar is enough to register the package
//! in a database without rebuilding it.

use super::spec::{CompileSpec, CompressionType};
use crate::error::{Error, Result};
use crate::packages::Package;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, info};
use walkdir::WalkDir;

/// gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub compile_spec: CompileSpec,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub checksum: String,
}

impl Artifact {
    pub fn package(&self) -> &Package {
        &self.compile_spec.package
    }

    /// Archive file name without directories
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.compile_spec.artifact_file_name())
    }

    /// Same record pointing at another copy of the archive
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Pack `source` into an archive inside `output_dir`
    pub fn create(spec: &CompileSpec, source: &Path, output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(spec.artifact_file_name());

        let files = write_archive(source, &path, spec.compression)?;
        let checksum = file_checksum(&path)?;

        info!(
            "Packaged {} ({} files) into {}",
            spec.package,
            files.len(),
            path.display()
        );

        Ok(Self {
            path,
            compile_spec: spec.clone(),
            files,
            checksum,
        })
    }

    /// Location of the sidecar next to the archive
    pub fn metadata_path(&self) -> PathBuf {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(self.compile_spec.metadata_file_name())
    }

    pub fn write_metadata(&self) -> Result<PathBuf> {
        let path = self.metadata_path();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Wrote artifact metadata {}", path.display());
        Ok(path)
    }

    pub fn load_metadata(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Compare the archive on disk with the recorded checksum
    pub fn verify(&self) -> Result<()> {
        if self.checksum.is_empty() {
            return Ok(());
        }
        verify_checksum(&self.path, &self.checksum)
    }

    /// Extract the archive below `target`, returning the extracted files
    pub fn unpack(&self, target: &Path) -> Result<Vec<String>> {
        unpack_archive(&self.path, target)
    }
}

/// SHA-256 of a file as lowercase hex
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify file checksum matches expected value
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for {}", path.display());

    let actual = file_checksum(path)?;
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    debug!("Checksum verified: {}", expected);
    Ok(())
}

/// Relative file paths below `root`, sorted
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_string_lossy().into_owned());
        }
    }
    Ok(files)
}

fn write_archive(source: &Path, dest: &Path, compression: CompressionType) -> Result<Vec<String>> {
    let files = list_files(source)?;
    let file = File::create(dest)?;

    match compression {
        CompressionType::None => {
            let mut builder = Builder::new(file);
            append_tree(&mut builder, source)?;
            builder.into_inner()?.flush()?;
        }
        CompressionType::Gzip => {
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = Builder::new(encoder);
            append_tree(&mut builder, source)?;
            builder.into_inner()?.finish()?.flush()?;
        }
    }

    Ok(files)
}

fn append_tree<W: Write>(builder: &mut Builder<W>, source: &Path) -> Result<()> {
    builder.follow_symlinks(false);
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
    }
    Ok(())
}

/// Extract a tar or tar.gz archive, detected by content
pub fn unpack_archive(archive: &Path, target: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(target)?;

    let mut magic = [0u8; 2];
    let compressed = {
        let mut file = File::open(archive)?;
        file.read(&mut magic)? == 2 && magic == GZIP_MAGIC
    };

    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(BufReader::new(File::open(archive)?)))
    } else {
        Box::new(BufReader::new(File::open(archive)?))
    };

    let mut files = Vec::new();
    let mut archive_reader = Archive::new(reader);
    archive_reader.set_preserve_permissions(true);

    for entry in archive_reader.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::ParseError(format!(
                "{}: unsafe entry path {}",
                archive.display(),
                path.display()
            )));
        }

        let is_dir = entry.header().entry_type().is_dir();
        entry.unpack_in(target)?;
        if !is_dir {
            files.push(path.to_string_lossy().into_owned());
        }
    }

    debug!(
        "Unpacked {} files from {} into {}",
        files.len(),
        archive.display(),
        target.display()
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::BuildInstructions;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/hello"), "#!/bin/sh\necho hi\n").unwrap();
        fs::write(root.join("README"), "kiln").unwrap();
    }

    fn spec(compression: CompressionType) -> CompileSpec {
        let mut spec = CompileSpec::new(
            Package::new("hello", "app", "1.0"),
            BuildInstructions::default(),
        );
        spec.compression = compression;
        spec
    }

    #[test]
    fn test_create_and_unpack() {
        for compression in [CompressionType::None, CompressionType::Gzip] {
            let temp = TempDir::new().unwrap();
            let source = temp.path().join("source");
            sample_tree(&source);

            let artifact =
                Artifact::create(&spec(compression), &source, &temp.path().join("out")).unwrap();
            assert_eq!(artifact.files, vec!["README", "usr/bin/hello"]);
            assert_eq!(artifact.checksum.len(), 64);
            artifact.verify().unwrap();

            let target = temp.path().join("root");
            let mut files = artifact.unpack(&target).unwrap();
            files.sort();
            assert_eq!(files, artifact.files);
            assert_eq!(
                fs::read_to_string(target.join("usr/bin/hello")).unwrap(),
                "#!/bin/sh\necho hi\n"
            );
        }
    }

    #[test]
    fn test_metadata_round_trip() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        sample_tree(&source);

        let artifact =
            Artifact::create(&spec(CompressionType::Gzip), &source, temp.path()).unwrap();
        let path = artifact.write_metadata().unwrap();
        assert_eq!(path, temp.path().join("hello-app-1.0.metadata.json"));

        let loaded = Artifact::load_metadata(&path).unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(loaded.package().fingerprint().as_str(), "hello-app-1.0");
    }

    #[test]
    fn test_checksum_mismatch() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        sample_tree(&source);

        let mut artifact =
            Artifact::create(&spec(CompressionType::None), &source, temp.path()).unwrap();
        artifact.checksum = "0".repeat(64);
        assert!(matches!(
            artifact.verify(),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
