// src/lib.rs

//! Kiln Package Manager
//!
//! Source-based package manager: packages are built from build
//! instructions into artifacts, published in repositories and installed
//! into a target root.
//!
//! # Architecture
//!
//! - Versions: Gentoo-style selectors (`>=1.0`, `~1.2`, `=1.*`) and ordering
//! - Databases: in-memory or SQLite package stores with file manifests
//! - Solver: exact backtracking or stochastic search over candidate groups
//! - Compiler: dependency-ordered parallel builds through a backend
//! - Installer: parallel downloads, ordered unpacking, upgrade removal

pub mod compiler;
pub mod config;
pub mod db;
mod error;
pub mod installer;
pub mod packages;
pub mod repository;
pub mod solver;
pub mod version;

pub use error::{Error, Result};
