//! kiln core library
//!
//! Build orchestration engine for a daemonless, multi-architecture image
//! builder: Dockerfile frontend, graph solver, platform-aware cache,
//! resource manager and parallel scheduler.

pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod paths;
pub mod resources;
pub mod scheduler;
pub mod types;

// Re-export commonly used items
pub use builder::{BuildOutcome, Builder, BuilderOptions, CacheEngine, Executor, Exporter};
pub use config::{BuildConfig, OutputFormat, ResourceLimits, Settings};
pub use error::{ErrorKind, KilnError, Result};
pub use events::{Event, EventBus, EventType};
pub use observability::{init as init_observability, BuildReport};
pub use types::{BuildResult, Operation, OperationResult, OperationType, Platform, PlatformResult};
