//! Utility modules for the rotation engine.

pub mod errors;

pub use errors::{HostError, JobError, NameError, RotationError, RunError, StorageError};
