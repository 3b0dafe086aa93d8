//! Image build engine.
//!
//! Dockerfile parsing and lowering, graph solving, caching, execution and
//! export, driven by the [`Builder`] orchestrator.

pub mod build;
pub mod cache;
pub mod executor;
pub mod exporter;
pub mod frontend;
pub mod graph;
pub mod parser;

pub use build::{BuildOutcome, Builder, BuilderOptions};
pub use cache::{CacheEngine, CacheError, CacheLookup, PruneStrategy};
pub use executor::{create_executor, Executor, LocalExecutor};
pub use exporter::{validate_index, Exporter, OciLayoutExporter};
pub use graph::{BuildGraph, BuildNode, GraphError, NodeStatus};
pub use parser::{parse_dockerfile, Dockerfile, Instruction, ParseError};
