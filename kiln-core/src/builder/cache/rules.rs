//! Invalidation rules: predicates that make a stored entry count as absent.

use super::entry::CacheEntry;
use std::collections::HashSet;
use std::time::Duration;

/// Default maximum entry lifetime: 7 days.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One invalidation rule. An entry is valid iff no rule rejects it.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationRule {
    /// Reject entries created longer ago than this
    MaxAge(Duration),
    /// Reject entries recorded against a different Dockerfile
    DockerfileHash,
    /// Reject entries recorded against a different build context
    ContextHash,
    /// Reject entries whose inputs were produced by a removed entry
    Dependency,
    /// Reject entries whose result is larger than this many bytes
    MaxSize(u64),
}

/// What a lookup is validated against.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub now_ms: u64,
    pub dockerfile_hash: &'a str,
    pub context_hash: &'a str,
    /// Outputs of entries removed by this cache instance
    pub removed_outputs: &'a HashSet<String>,
}

impl InvalidationRule {
    pub fn name(&self) -> &'static str {
        match self {
            InvalidationRule::MaxAge(_) => "max_age",
            InvalidationRule::DockerfileHash => "dockerfile_hash",
            InvalidationRule::ContextHash => "context_hash",
            InvalidationRule::Dependency => "dependency",
            InvalidationRule::MaxSize(_) => "max_size",
        }
    }

    /// Returns whether this rule rejects `entry`.
    ///
    /// An empty hash in the context disables the corresponding hash rule.
    pub fn rejects(&self, entry: &CacheEntry, ctx: &RuleContext<'_>) -> bool {
        match self {
            InvalidationRule::MaxAge(max_age) => {
                ctx.now_ms.saturating_sub(entry.created_at) > max_age.as_millis() as u64
            }
            InvalidationRule::DockerfileHash => {
                !ctx.dockerfile_hash.is_empty() && entry.dockerfile_hash != ctx.dockerfile_hash
            }
            InvalidationRule::ContextHash => {
                !ctx.context_hash.is_empty() && entry.context_hash != ctx.context_hash
            }
            InvalidationRule::Dependency => {
                entry.dependencies.iter().any(|dep| ctx.removed_outputs.contains(dep))
            }
            InvalidationRule::MaxSize(limit) => entry.size > *limit,
        }
    }
}

/// The rule set a cache starts with.
pub fn default_rules() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule::MaxAge(DEFAULT_MAX_AGE),
        InvalidationRule::DockerfileHash,
        InvalidationRule::ContextHash,
        InvalidationRule::Dependency,
    ]
}

/// First rule in `rules` that rejects `entry`, if any.
pub fn first_rejection<'r>(
    rules: &'r [InvalidationRule],
    entry: &CacheEntry,
    ctx: &RuleContext<'_>,
) -> Option<&'r InvalidationRule> {
    rules.iter().find(|rule| rule.rejects(entry, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, OperationResult, OperationType, Platform};

    fn entry() -> CacheEntry {
        let op = Operation::new(OperationType::Exec, vec!["RUN".into()], Platform::new("linux", "amd64", None));
        CacheEntry {
            key: "abcd".into(),
            result: OperationResult::succeeded(&op, vec![]),
            created_at: 1_000,
            last_accessed: 1_000,
            access_count: 0,
            platform: op.platform.clone(),
            dockerfile_hash: "df1".into(),
            context_hash: "ctx1".into(),
            dependencies: vec!["0/0:aaaa".into()],
            size: 100,
        }
    }

    fn ctx<'a>(removed: &'a HashSet<String>, now_ms: u64, dfh: &'a str, ctxh: &'a str) -> RuleContext<'a> {
        RuleContext { now_ms, dockerfile_hash: dfh, context_hash: ctxh, removed_outputs: removed }
    }

    #[test]
    fn test_valid_entry_passes_defaults() {
        let removed = HashSet::new();
        let rules = default_rules();
        assert!(first_rejection(&rules, &entry(), &ctx(&removed, 2_000, "df1", "ctx1")).is_none());
    }

    #[test]
    fn test_each_rule_rejects() {
        let removed = HashSet::from(["0/0:aaaa".to_string()]);
        let none = HashSet::new();
        let e = entry();

        assert!(InvalidationRule::MaxAge(Duration::from_secs(1)).rejects(&e, &ctx(&none, 3_000, "df1", "ctx1")));
        assert!(InvalidationRule::DockerfileHash.rejects(&e, &ctx(&none, 0, "df2", "ctx1")));
        assert!(InvalidationRule::ContextHash.rejects(&e, &ctx(&none, 0, "df1", "ctx2")));
        assert!(InvalidationRule::Dependency.rejects(&e, &ctx(&removed, 0, "df1", "ctx1")));
        assert!(InvalidationRule::MaxSize(10).rejects(&e, &ctx(&none, 0, "df1", "ctx1")));
    }

    #[test]
    fn test_empty_hash_disables_hash_rules() {
        let none = HashSet::new();
        assert!(!InvalidationRule::DockerfileHash.rejects(&entry(), &ctx(&none, 0, "", "")));
        assert!(!InvalidationRule::ContextHash.rejects(&entry(), &ctx(&none, 0, "", "")));
    }

    #[test]
    fn test_rules_are_ordered() {
        let none = HashSet::new();
        let rules = vec![InvalidationRule::ContextHash, InvalidationRule::DockerfileHash];
        let rejected = first_rejection(&rules, &entry(), &ctx(&none, 0, "df2", "ctx2")).unwrap();
        assert_eq!(rejected.name(), "context_hash");
    }
}
