//! Low-precision orchestrator
//!
//! Runs the registry over a graph in five strictly ordered phases. Each
//! phase is one fresh [`GraphRewrite`] over the whole graph, so a node
//! rewritten in one phase is first seen again by the next.

use std::fmt;

use smallvec::SmallVec;
use tracing::info;

use crate::error::{LptResult, TransformError};
use crate::graph::{GraphContext, OpKind};
use crate::traits::Transformer;
use crate::transform::{
    GraphRewrite, TransformConfig, TransformStats, TransformationContext, TypeRelaxedReplacer,
};

use super::params::Params;
use super::registry::LowPrecisionTransformations;

/// Orchestrator phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Wrap relaxable nodes in the type-relaxation decorator
    TypeRelaxation,
    /// Rewrites that change topology across branches
    BranchSpecific,
    /// Fake-quantize decomposition alone
    FakeQuantize,
    /// Every other main transformation
    Main,
    /// Folding of what the main phase left behind
    Cleanup,
}

/// Graph states a phase relies on or leaves behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseInvariant {
    /// Relaxable nodes are type-relaxed
    TypesRelaxed,
    /// No branch-specific rewrite is pending
    BranchesStable,
    /// Activation fake-quantizes are dequantization chains
    FakeQuantizeDecomposed,
    /// Dequantizations have moved past every lowerable layer
    LayersLowered,
    /// Leftover dequantization links are folded
    DequantizationFolded,
}

impl Phase {
    /// Every phase in execution order
    pub const ALL: [Phase; 5] = [
        Phase::TypeRelaxation,
        Phase::BranchSpecific,
        Phase::FakeQuantize,
        Phase::Main,
        Phase::Cleanup,
    ];

    /// Invariants that must hold on entry
    pub fn requires(self) -> &'static [PhaseInvariant] {
        use PhaseInvariant::*;
        match self {
            Phase::TypeRelaxation => &[],
            Phase::BranchSpecific => &[TypesRelaxed],
            Phase::FakeQuantize => &[TypesRelaxed, BranchesStable],
            Phase::Main => &[TypesRelaxed, BranchesStable, FakeQuantizeDecomposed],
            Phase::Cleanup => &[TypesRelaxed, FakeQuantizeDecomposed, LayersLowered],
        }
    }

    /// Invariant that holds on exit
    pub fn establishes(self) -> PhaseInvariant {
        match self {
            Phase::TypeRelaxation => PhaseInvariant::TypesRelaxed,
            Phase::BranchSpecific => PhaseInvariant::BranchesStable,
            Phase::FakeQuantize => PhaseInvariant::FakeQuantizeDecomposed,
            Phase::Main => PhaseInvariant::LayersLowered,
            Phase::Cleanup => PhaseInvariant::DequantizationFolded,
        }
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Phase::TypeRelaxation => "type-relaxation",
            Phase::BranchSpecific => "branch-specific",
            Phase::FakeQuantize => "fake-quantize",
            Phase::Main => "main",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    /// Phase that ran
    pub phase: Phase,
    /// Pass statistics
    pub stats: TransformStats,
}

/// Per-phase outcome of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LowPrecisionStats {
    /// Reports in execution order
    pub phases: Vec<PhaseReport>,
}

impl LowPrecisionStats {
    /// Report of `phase`, if it ran
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|r| r.phase == phase)
    }

    /// Statistics summed over every phase
    pub fn total(&self) -> TransformStats {
        let mut total = TransformStats::default();
        for report in &self.phases {
            total.merge(&report.stats);
        }
        total
    }
}

/// Runs a [`LowPrecisionTransformations`] registry over graphs
#[derive(Debug, Clone)]
pub struct LowPrecisionTransformer {
    transformations: LowPrecisionTransformations,
    relaxer: TypeRelaxedReplacer,
    config: TransformConfig,
}

impl LowPrecisionTransformer {
    /// Orchestrator over a registry
    pub fn new(transformations: LowPrecisionTransformations) -> Self {
        Self {
            transformations,
            relaxer: TypeRelaxedReplacer::new(),
            config: TransformConfig::default(),
        }
    }

    /// Orchestrator over the default registry built from `params`
    pub fn with_params(params: Params) -> Self {
        Self::new(LowPrecisionTransformations::create_default(params))
    }

    /// Configure every phase pass
    pub fn with_config(mut self, config: TransformConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry driving the run
    pub fn transformations(&self) -> &LowPrecisionTransformations {
        &self.transformations
    }

    /// Run every phase over `graph`
    ///
    /// Fails with [`TransformError::MissingTransformation`] before touching
    /// the graph when no fake-quantize transformation is registered.
    pub fn run(&self, graph: &mut GraphContext) -> LptResult<LowPrecisionStats> {
        let fake_quantize = self
            .transformations
            .find_transformation(OpKind::FakeQuantize)
            .ok_or_else(|| TransformError::MissingTransformation(OpKind::FakeQuantize.to_string()))?;

        let mut established: SmallVec<[PhaseInvariant; 5]> = SmallVec::new();
        let mut stats = LowPrecisionStats::default();
        for phase in Phase::ALL {
            if let Some(missing) = phase.requires().iter().find(|i| !established.contains(i)) {
                return Err(TransformError::InvariantViolation(format!(
                    "{} phase requires {:?}",
                    phase, missing
                )));
            }

            let mut pass = GraphRewrite::new(phase.name()).with_config(self.config.clone());
            match phase {
                Phase::TypeRelaxation => self.relaxer.register_matcher_in(&mut pass),
                Phase::BranchSpecific => {
                    for (_, t) in self.transformations.branch_specific() {
                        t.register_matcher_in(&mut pass);
                    }
                }
                Phase::FakeQuantize => fake_quantize.register_matcher_in(&mut pass),
                Phase::Main => {
                    for (kind, t) in self.transformations.transformations() {
                        if kind != OpKind::FakeQuantize {
                            t.register_matcher_in(&mut pass);
                        }
                    }
                }
                Phase::Cleanup => {
                    for (_, t) in self.transformations.cleanup() {
                        t.register_matcher_in(&mut pass);
                    }
                }
            }

            let mut ctx = TransformationContext::with_manager(graph, &self.transformations);
            let phase_stats = pass.run(&mut ctx)?;
            info!(
                phase = phase.name(),
                applied = phase_stats.transforms_applied,
                "low-precision phase finished"
            );
            stats.phases.push(PhaseReport {
                phase,
                stats: phase_stats,
            });
            established.push(phase.establishes());
        }
        Ok(stats)
    }
}

impl Default for LowPrecisionTransformer {
    fn default() -> Self {
        Self::new(LowPrecisionTransformations::default())
    }
}

impl Transformer for LowPrecisionTransformer {
    fn name(&self) -> &str {
        "LowPrecisionTransformer"
    }

    fn transform(&self, graph: &mut GraphContext) -> LptResult<TransformStats> {
        Ok(self.run(graph)?.total())
    }
}
