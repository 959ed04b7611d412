//! File system helpers for building the staging tree.

pub mod copy;
pub mod exclude;
pub mod metadata;
pub mod staging;
pub mod stats;
pub mod walker;
