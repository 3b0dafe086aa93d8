//! Build operations and their results.

use crate::builder::cache::hash::sha256_hex;
use crate::types::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of an atomic build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Fetch a base image.
    Pull,
    /// Materialize an earlier stage as the base of another.
    Extract,
    /// Run a command (RUN).
    Exec,
    /// Copy files into the image (COPY/ADD).
    File,
    /// Change image configuration (ENV, LABEL, CMD, ...).
    Meta,
    /// Emit an artifact.
    Export,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Pull => "pull",
            OperationType::Extract => "extract",
            OperationType::Exec => "exec",
            OperationType::File => "file",
            OperationType::Meta => "meta",
            OperationType::Export => "export",
        }
    }

    /// Platform-specific operations are cached per platform; the rest are shared.
    pub fn is_platform_specific(&self) -> bool {
        matches!(self, OperationType::Pull | OperationType::Extract | OperationType::Exec)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An atomic, immutable build step produced by the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Command arguments; the first element is the Dockerfile instruction.
    pub command: Vec<String>,
    /// Symbolic names of prior outputs consumed by this step.
    pub inputs: Vec<String>,
    /// Symbolic names produced by this step.
    pub outputs: Vec<String>,
    pub platform: Platform,
    pub work_dir: String,
    pub env: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

/// The fields that identify an operation for caching.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    #[serde(rename = "type")]
    op_type: OperationType,
    command: &'a [String],
    platform: &'a Platform,
    inputs: &'a [String],
    outputs: &'a [String],
    metadata: &'a BTreeMap<String, String>,
}

impl Operation {
    pub fn new(op_type: OperationType, command: Vec<String>, platform: Platform) -> Self {
        Self {
            op_type,
            command,
            inputs: Vec::new(),
            outputs: Vec::new(),
            platform,
            work_dir: "/".to_string(),
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Stable hash of (type, command, platform, inputs, outputs, metadata).
    pub fn cache_key(&self) -> String {
        let material = KeyMaterial {
            op_type: self.op_type,
            command: &self.command,
            platform: &self.platform,
            inputs: &self.inputs,
            outputs: &self.outputs,
            metadata: &self.metadata,
        };
        // Serializing plain strings and ordered maps cannot fail.
        let bytes = serde_json::to_vec(&material).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Copy of this operation retargeted to another platform.
    pub fn for_platform(&self, platform: &Platform) -> Self {
        Self { platform: platform.clone(), ..self.clone() }
    }

    /// Short human-readable form, e.g. `exec: RUN echo hi`.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.op_type, self.command.join(" "))
    }
}

/// Outcome of executing (or replaying from cache) one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifiers of the artifacts this step produced.
    pub outputs: Vec<String>,
    /// Environment changes introduced by this step.
    pub env: BTreeMap<String, String>,
    pub cache_hit: bool,
    pub operation: Operation,
}

impl OperationResult {
    pub fn succeeded(operation: &Operation, outputs: Vec<String>) -> Self {
        Self {
            success: true,
            error: None,
            outputs,
            env: BTreeMap::new(),
            cache_hit: false,
            operation: operation.clone(),
        }
    }

    pub fn failed(operation: &Operation, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            outputs: Vec::new(),
            env: BTreeMap::new(),
            cache_hit: false,
            operation: operation.clone(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}
