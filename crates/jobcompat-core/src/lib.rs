//! `jobcompat-core`: value types, errors and configuration shared by the
//! scheduler engine and the `jobcompat` binary.

pub mod config;
pub mod error;
pub mod types;

pub use error::{CoreError, Result};
pub use types::{BackendKind, ExtraValue, Extras, JobId, NetworkType};
