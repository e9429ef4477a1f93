//! Shared clap argument groups for the segmentation binaries.

pub mod common;

pub use common::*;
