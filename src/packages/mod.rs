// src/packages/mod.rs

//! Package model for Kiln
//!
//! This module provides the `Package` type shared by the database, solver,
//! compiler and installer, plus the tree loader that reads package
//! definitions from disk.

pub mod package;
pub mod tree;

pub use package::{Fingerprint, Package, PackageFile};
pub use tree::Tree;
