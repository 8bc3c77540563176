//! Registry of layer transformations
//!
//! Three keyed maps, one per orchestrator role. Every transformation of a
//! registry shares one immutable [`Params`]; reconfiguring builds a new
//! registry whose transformations are rebuilt over the new value.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::graph::{GraphContext, NodeId, OpKind};
use crate::tensor::ElementType;
use crate::traits::LayerTransformationsManager;
use crate::transformers::{
    AddTransformation, AvgPoolTransformation, ConcatTransformation, ConvertTransformation,
    ConvolutionTransformation, DepthToSpaceTransformation, FakeQuantizeTransformation,
    FuseFakeQuantizeTransformation, GroupConvolutionTransformation, MatMulTransformation,
    MaxPoolTransformation, MultiplyTransformation, ReluTransformation, ReshapeTransformation,
    Transformation,
};

use super::layer_transformation::LayerTransformation;
use super::params::{Params, QuantizedTensorAlignment};

type TransformationMap = IndexMap<OpKind, Transformation>;

/// Branch-specific, main and cleanup transformations keyed by operation kind
#[derive(Debug, Clone)]
pub struct LowPrecisionTransformations {
    branch_specific: TransformationMap,
    transformations: TransformationMap,
    cleanup: TransformationMap,
    params: Arc<Params>,
}

impl LowPrecisionTransformations {
    /// Empty registry over `params`
    pub fn new(params: Params) -> Self {
        Self {
            branch_specific: IndexMap::new(),
            transformations: IndexMap::new(),
            cleanup: IndexMap::new(),
            params: Arc::new(params),
        }
    }

    /// Registry holding the default transformation set
    pub fn create_default(params: Params) -> Self {
        Self::new(params)
            .add_branch_specific::<ConcatTransformation>(OpKind::Concat)
            .add::<AddTransformation>(OpKind::Add)
            .add::<AvgPoolTransformation>(OpKind::AvgPool)
            .add::<ConvolutionTransformation>(OpKind::Convolution)
            .add::<DepthToSpaceTransformation>(OpKind::DepthToSpace)
            .add::<FakeQuantizeTransformation>(OpKind::FakeQuantize)
            .add::<GroupConvolutionTransformation>(OpKind::GroupConvolution)
            .add::<MatMulTransformation>(OpKind::MatMul)
            .add::<MaxPoolTransformation>(OpKind::MaxPool)
            .add::<ReluTransformation>(OpKind::Relu)
            .add::<ReshapeTransformation>(OpKind::Reshape)
            .add_cleanup::<FuseFakeQuantizeTransformation>(OpKind::FakeQuantize)
            .add_cleanup::<MultiplyTransformation>(OpKind::Multiply)
            .add_cleanup::<ConvertTransformation>(OpKind::Convert)
    }

    /// Parameters shared by every registered transformation
    pub fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn build<T>(&self) -> Transformation
    where
        T: LayerTransformation + Into<Transformation>,
    {
        T::with_params(Arc::clone(&self.params)).into()
    }

    /// Register a main transformation for `kind`, replacing any previous one
    pub fn add<T>(mut self, kind: OpKind) -> Self
    where
        T: LayerTransformation + Into<Transformation>,
    {
        let transformation = self.build::<T>();
        self.transformations.insert(kind, transformation);
        self
    }

    /// Register a branch-specific transformation for `kind`
    pub fn add_branch_specific<T>(mut self, kind: OpKind) -> Self
    where
        T: LayerTransformation + Into<Transformation>,
    {
        let transformation = self.build::<T>();
        self.branch_specific.insert(kind, transformation);
        self
    }

    /// Register a cleanup transformation for `kind`
    pub fn add_cleanup<T>(mut self, kind: OpKind) -> Self
    where
        T: LayerTransformation + Into<Transformation>,
    {
        let transformation = self.build::<T>();
        self.cleanup.insert(kind, transformation);
        self
    }

    /// Register an already built main transformation
    ///
    /// It is rebuilt over the registry parameters.
    pub fn add_transformation(mut self, kind: OpKind, transformation: Transformation) -> Self {
        let transformation = transformation.rebuild(Arc::clone(&self.params));
        self.transformations.insert(kind, transformation);
        self
    }

    /// Drop `kind` from every map
    pub fn remove(self, kind: OpKind) -> Self {
        self.remove_branch_specific(kind)
            .remove_transformation(kind)
            .remove_cleanup(kind)
    }

    /// Drop the branch-specific transformation for `kind`
    pub fn remove_branch_specific(mut self, kind: OpKind) -> Self {
        self.branch_specific.shift_remove(&kind);
        self
    }

    /// Drop the main transformation for `kind`
    pub fn remove_transformation(mut self, kind: OpKind) -> Self {
        self.transformations.shift_remove(&kind);
        self
    }

    /// Drop the cleanup transformation for `kind`
    pub fn remove_cleanup(mut self, kind: OpKind) -> Self {
        self.cleanup.shift_remove(&kind);
        self
    }

    /// Transformation registered for `kind` in any role
    ///
    /// Branch-specific entries win over main ones, main over cleanup.
    pub fn find(&self, kind: OpKind) -> Option<&Transformation> {
        self.branch_specific
            .get(&kind)
            .or_else(|| self.transformations.get(&kind))
            .or_else(|| self.cleanup.get(&kind))
    }

    /// Main transformation registered for `kind`
    pub fn find_transformation(&self, kind: OpKind) -> Option<&Transformation> {
        self.transformations.get(&kind)
    }

    /// Branch-specific transformation registered for `kind`
    pub fn find_branch_specific(&self, kind: OpKind) -> Option<&Transformation> {
        self.branch_specific.get(&kind)
    }

    /// Cleanup transformation registered for `kind`
    pub fn find_cleanup(&self, kind: OpKind) -> Option<&Transformation> {
        self.cleanup.get(&kind)
    }

    /// Branch-specific transformations in registration order
    pub fn branch_specific(&self) -> impl Iterator<Item = (OpKind, &Transformation)> {
        self.branch_specific.iter().map(|(k, t)| (*k, t))
    }

    /// Main transformations in registration order
    pub fn transformations(&self) -> impl Iterator<Item = (OpKind, &Transformation)> {
        self.transformations.iter().map(|(k, t)| (*k, t))
    }

    /// Cleanup transformations in registration order
    pub fn cleanup(&self) -> impl Iterator<Item = (OpKind, &Transformation)> {
        self.cleanup.iter().map(|(k, t)| (*k, t))
    }

    /// Same registry with every transformation rebuilt over `params`
    pub fn reconfigure(&self, params: Params) -> Self {
        let params = Arc::new(params);
        let rebuild = |map: &TransformationMap| -> TransformationMap {
            map.iter()
                .map(|(kind, t)| (*kind, t.rebuild(Arc::clone(&params))))
                .collect()
        };
        Self {
            branch_specific: rebuild(&self.branch_specific),
            transformations: rebuild(&self.transformations),
            cleanup: rebuild(&self.cleanup),
            params,
        }
    }

    /// Reconfigure `update_precisions`
    pub fn with_update_precisions(&self, value: bool) -> Self {
        self.reconfigure(self.params.as_ref().clone().with_update_precisions(value))
    }

    /// Reconfigure the activation alignment
    pub fn with_quantized_tensor_alignment_on_activations(
        &self,
        value: QuantizedTensorAlignment,
    ) -> Self {
        self.reconfigure(
            self.params
                .as_ref()
                .clone()
                .with_quantized_tensor_alignment_on_activations(value),
        )
    }

    /// Reconfigure the weight alignment
    pub fn with_quantized_tensor_alignment_on_weights(
        &self,
        value: QuantizedTensorAlignment,
    ) -> Self {
        self.reconfigure(
            self.params
                .as_ref()
                .clone()
                .with_quantized_tensor_alignment_on_weights(value),
        )
    }

    /// Reconfigure `quantize_outputs`
    pub fn with_quantize_outputs(&self, value: bool) -> Self {
        self.reconfigure(self.params.as_ref().clone().with_quantize_outputs(value))
    }

    /// Reconfigure `weights_to_const`
    pub fn with_weights_to_const(&self, value: bool) -> Self {
        self.reconfigure(self.params.as_ref().clone().with_weights_to_const(value))
    }

    /// Activation precisions the transformation for `node` accepts
    ///
    /// Empty when no transformation handles the node kind.
    pub fn get_precisions_on_activations(&self, graph: &GraphContext, node: NodeId) -> Vec<ElementType> {
        graph
            .kind(node)
            .and_then(|kind| self.find(kind))
            .map(|t| t.params().precisions_on_activations.clone())
            .unwrap_or_default()
    }
}

impl Default for LowPrecisionTransformations {
    fn default() -> Self {
        Self::create_default(Params::default())
    }
}

impl LayerTransformationsManager for LowPrecisionTransformations {
    fn is_quantized(&self, graph: &GraphContext, node: NodeId) -> bool {
        graph
            .kind(node)
            .and_then(|kind| self.find(kind))
            .map_or(false, |t| t.is_quantized(graph, node))
    }

    fn is_precision_preserved(&self, graph: &GraphContext, node: NodeId) -> bool {
        graph
            .kind(node)
            .and_then(|kind| self.find(kind))
            .map_or(false, |t| t.is_precision_preserved(graph, node))
    }
}
