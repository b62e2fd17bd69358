//! Shared helpers.

pub mod coding;
pub mod hash;
