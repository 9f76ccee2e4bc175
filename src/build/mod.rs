//! Build-time utilities shared by backends and installers.
//!
//! This module provides:
//! - [`context`] - Per-build context and workspace layout
//! - [`filesystem`] - Tree overlay, atomic moves, relative paths
//! - [`kernel`] - Kernel image links for installed kernel sources

pub mod context;
pub mod filesystem;
pub mod kernel;
