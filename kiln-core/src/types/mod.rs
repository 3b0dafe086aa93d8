//! Core domain types for kiln.

pub mod build;
pub mod operation;
pub mod platform;

// Re-exports
pub use build::{BuildResult, PlatformResult};
pub use operation::{Operation, OperationResult, OperationType};
pub use platform::{Platform, PlatformParseError};
