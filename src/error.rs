// src/error.rs

use thiserror::Error;

/// Core error types for Kiln
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Malformed version or selector string
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A selector operation was called on a concrete package
    #[error("Package {0} is not a selector")]
    NotASelector(String),

    /// Fingerprint already present in a database
    #[error("Package already exists: {0}")]
    AlreadyExists(String),

    /// Lookup miss
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// No consistent assignment for a resolution request
    #[error("Unsatisfiable: {0}")]
    Unsatisfiable(String),

    /// Dependency cycle among resolved packages
    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    /// Backend failure while building or packaging
    #[error("Failed to build {package}: {reason}")]
    BuildError { package: String, reason: String },

    /// A spec was skipped because something it depends on failed
    #[error("Skipped {package}: dependency {dependency} failed")]
    DependencyFailed { package: String, dependency: String },

    /// Compile spec state machine violation
    #[error("Invalid state transition for {package}: {from} -> {to}")]
    InvalidTransition {
        package: String,
        from: String,
        to: String,
    },

    /// Transport errors (all mirrors exhausted, HTTP failures)
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Downloaded content does not match the recorded checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias using Kiln's Error type
pub type Result<T> = std::result::Result<T, Error>;
