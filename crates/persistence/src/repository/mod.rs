//! Repository implementations for database operations

pub mod fallback;
pub mod strategy;

pub use fallback::*;
pub use strategy::*;
