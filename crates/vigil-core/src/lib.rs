//! vigil-core: shared types for the vigil activity archive.
//!
//! Holds the config schema (TOML), the error taxonomy, and the status
//! record types exchanged between the capture worker and the supervisor.

pub mod config;
pub mod error;
pub mod status;

pub use error::{VigilError, VigilResult};
