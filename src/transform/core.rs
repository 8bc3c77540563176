//! Core rewrite pass
//!
//! A [`GraphRewrite`] holds the matchers registered for one phase and walks
//! the graph once in topological order, offering each live node to the
//! matchers in registration order.

use tracing::{debug, warn};

use crate::error::LptResult;
use crate::graph::NodeId;
use crate::pattern::{MatchResult, Pattern, PatternMatcher};

use super::context::TransformationContext;

/// A rewrite applied to a matched subgraph
///
/// `apply` returns `Ok(false)` when the match is ineligible; the graph must
/// then be left untouched. `Ok(true)` means the rewrite was committed.
pub trait RewriteRule {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Rewrite the matched subgraph
    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool>;
}

/// Rewrite pass configuration
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Log and skip a node when its rule fails instead of aborting the pass
    pub continue_on_error: bool,
    /// Detach unreachable nodes after the pass
    pub cleanup_after: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            cleanup_after: true,
        }
    }
}

/// Statistics from a rewrite pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransformStats {
    /// Number of live nodes offered to the matchers
    pub nodes_visited: usize,
    /// Number of successful pattern matches
    pub patterns_matched: usize,
    /// Number of committed rewrites
    pub transforms_applied: usize,
    /// Number of rules that failed and were skipped
    pub errors_skipped: usize,
    /// Number of nodes detached by the final cleanup
    pub nodes_eliminated: usize,
}

impl TransformStats {
    /// Accumulate another pass into this one
    pub fn merge(&mut self, other: &TransformStats) {
        self.nodes_visited += other.nodes_visited;
        self.patterns_matched += other.patterns_matched;
        self.transforms_applied += other.transforms_applied;
        self.errors_skipped += other.errors_skipped;
        self.nodes_eliminated += other.nodes_eliminated;
    }

    /// Check if the pass changed the graph
    pub fn changed(&self) -> bool {
        self.transforms_applied > 0 || self.nodes_eliminated > 0
    }
}

struct Registration<'r> {
    pattern: Pattern,
    rule: &'r dyn RewriteRule,
}

/// One rewrite pass over the whole graph
///
/// Nodes are visited in the topological order captured when the pass
/// starts, so nodes created by a rewrite are not offered again within the
/// same pass. The first rule that commits wins for a node.
pub struct GraphRewrite<'r> {
    name: String,
    config: TransformConfig,
    registrations: Vec<Registration<'r>>,
}

impl<'r> GraphRewrite<'r> {
    /// Create an empty pass
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: TransformConfig::default(),
            registrations: Vec::new(),
        }
    }

    /// Configure the pass
    pub fn with_config(mut self, config: TransformConfig) -> Self {
        self.config = config;
        self
    }

    /// Pass name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a matcher
    pub fn add_matcher(&mut self, pattern: Pattern, rule: &'r dyn RewriteRule) {
        self.registrations.push(Registration { pattern, rule });
    }

    /// Number of registered matchers
    pub fn matcher_count(&self) -> usize {
        self.registrations.len()
    }

    /// Run the pass
    pub fn run(&self, ctx: &mut TransformationContext<'_>) -> LptResult<TransformStats> {
        let mut stats = TransformStats::default();
        let order: Vec<NodeId> = ctx.graph.topological_order();

        for id in order {
            if !ctx.graph.has_node(id) {
                continue;
            }
            stats.nodes_visited += 1;
            if let Err(e) = ctx.graph.revalidate(id) {
                if !self.config.continue_on_error {
                    return Err(e);
                }
                warn!(pass = %self.name, node = %id, error = %e, "revalidation failed, node skipped");
                stats.errors_skipped += 1;
                continue;
            }

            for registration in &self.registrations {
                let m = {
                    let matcher = PatternMatcher::new(ctx.graph);
                    matcher.match_pattern(&registration.pattern, id)
                };
                let Some(m) = m else { continue };
                stats.patterns_matched += 1;

                match registration.rule.apply(ctx, &m) {
                    Ok(true) => {
                        stats.transforms_applied += 1;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        if !self.config.continue_on_error {
                            return Err(e);
                        }
                        warn!(
                            pass = %self.name,
                            rule = registration.rule.name(),
                            node = %id,
                            error = %e,
                            "rewrite failed, node skipped"
                        );
                        stats.errors_skipped += 1;
                        break;
                    }
                }
                if !ctx.graph.has_node(id) {
                    break;
                }
            }
        }

        if self.config.cleanup_after {
            stats.nodes_eliminated = ctx.graph.collect_garbage();
        }
        ctx.graph.validate_and_infer_types()?;
        debug!(
            pass = %self.name,
            visited = stats.nodes_visited,
            applied = stats.transforms_applied,
            "rewrite pass finished"
        );
        Ok(stats)
    }
}
