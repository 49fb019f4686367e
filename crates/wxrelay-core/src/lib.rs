//! # wxrelay-core
//!
//! Core types, traits, configuration, admission rules, and error handling
//! shared by the wxrelay crates.

pub mod admission;
pub mod config;
pub mod error;
pub mod message;
pub mod traits;

pub use config::shellexpand;
