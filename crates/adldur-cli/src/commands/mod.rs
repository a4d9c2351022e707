//! Command implementations.

pub mod cache_info;
pub mod measure;
