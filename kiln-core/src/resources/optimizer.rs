//! Periodic corrective rules over current resource usage.

use serde::{Deserialize, Serialize};

/// Consecutive over-limit evaluations before capacity is reduced.
pub const DEFAULT_SUSTAIN: u32 = 3;

/// Usage seen by one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub memory_bytes: u64,
    pub active_ops: usize,
    pub op_capacity: usize,
}

/// Corrective action requested by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerAction {
    /// Release retained sampling buffers and allocator caches
    ReleaseMemory,
    /// Halve the operation-permit capacity (never below 1)
    HalveOpCapacity,
}

/// A condition over usage paired with its action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum OptimizationRule {
    /// Memory above `threshold_bytes`
    MemoryPressure { threshold_bytes: u64 },
    /// Memory above `limit_bytes` for `sustain` evaluations in a row
    SustainedOverLimit { limit_bytes: u64, sustain: u32 },
}

impl OptimizationRule {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationRule::MemoryPressure { .. } => "memory_pressure",
            OptimizationRule::SustainedOverLimit { .. } => "sustained_over_limit",
        }
    }
}

/// Ordered rule list with the state sustained rules need.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    rules: Vec<OptimizationRule>,
    streaks: Vec<u32>,
}

impl Optimizer {
    pub fn new(rules: Vec<OptimizationRule>) -> Self {
        let streaks = vec![0; rules.len()];
        Self { rules, streaks }
    }

    /// Default rules derived from the configured memory thresholds.
    pub fn from_limits(pressure_bytes: Option<u64>, limit_bytes: Option<u64>) -> Self {
        let mut rules = Vec::new();
        if let Some(threshold_bytes) = pressure_bytes {
            rules.push(OptimizationRule::MemoryPressure { threshold_bytes });
        }
        if let Some(limit_bytes) = limit_bytes {
            rules.push(OptimizationRule::SustainedOverLimit { limit_bytes, sustain: DEFAULT_SUSTAIN });
        }
        Self::new(rules)
    }

    pub fn rules(&self) -> &[OptimizationRule] {
        &self.rules
    }

    /// Evaluates every rule in order and returns the actions to apply.
    pub fn evaluate(&mut self, usage: &UsageSnapshot) -> Vec<OptimizerAction> {
        let mut actions = Vec::new();
        for (rule, streak) in self.rules.iter().zip(self.streaks.iter_mut()) {
            match rule {
                OptimizationRule::MemoryPressure { threshold_bytes } => {
                    if usage.memory_bytes > *threshold_bytes {
                        actions.push(OptimizerAction::ReleaseMemory);
                    }
                }
                OptimizationRule::SustainedOverLimit { limit_bytes, sustain } => {
                    if usage.memory_bytes > *limit_bytes {
                        *streak += 1;
                        if *streak >= *sustain {
                            *streak = 0;
                            if usage.op_capacity > 1 {
                                actions.push(OptimizerAction::HalveOpCapacity);
                            }
                        }
                    } else {
                        *streak = 0;
                    }
                }
            }
        }
        actions
    }
}

/// Capacity after halving, never below 1.
pub fn halved(capacity: usize) -> usize {
    (capacity / 2).max(1)
}
