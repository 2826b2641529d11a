//! # accrue-core
//! Foundation types, traits and storage contracts for the Accrue engine.

pub mod apply;
pub mod constants;
pub mod error;
pub mod memory;
pub mod time;
pub mod traits;
pub mod types;
