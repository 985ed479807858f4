//! The beautify effect: smooth skin, keep detail edges.
//!
//! ```text
//! input ─┬─ bilateral ──────┐
//!        ├─ canny edges ────┼─ combination ── hsb ── output
//!        └──────────────────┘
//! ```

use super::graph::{Edge, FilterGraph, GraphBuilder, GraphError, NodeId};
use super::{
    BilateralFilter, BlendParams, CannyEdgeDetection, CombinationFilter, EdgeParams, HsbFilter, ParameterError,
    SmoothingParams, ToneParams,
};
use crate::gpu::{GpuContext, Texture};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Numeric settings of all four stages.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BeautifyParams {
    pub smoothing: SmoothingParams,
    pub edges: EdgeParams,
    pub blend: BlendParams,
    pub tone: ToneParams,
}

impl BeautifyParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        self.smoothing.validate()?;
        self.edges.validate()?;
        self.blend.validate()?;
        self.tone.validate()
    }
}

/// Compound single-input, single-output operator.
pub struct BeautifyFilter {
    graph: FilterGraph,
    smoothing: NodeId,
    edges: NodeId,
    blend: NodeId,
    tone: NodeId,
    params: BeautifyParams,
}

/// Failures building the effect.
#[derive(thiserror::Error, Debug)]
pub enum BeautifyError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl BeautifyFilter {
    pub fn new(ctx: Arc<dyn GpuContext>, params: BeautifyParams) -> Result<Self, BeautifyError> {
        params.validate()?;

        let mut builder = GraphBuilder::new();
        let smoothing = builder.add_node(BilateralFilter::new(params.smoothing)?);
        let edges = builder.add_node(CannyEdgeDetection::new(params.edges)?);
        let blend = builder.add_node(CombinationFilter::new(params.blend)?);
        let tone = builder.add_node(HsbFilter::new(params.tone)?);

        builder.connect(Edge::Source, smoothing, 0)?;
        builder.connect(Edge::Source, edges, 0)?;
        builder.connect(Edge::Source, blend, 0)?;
        builder.connect(Edge::Node(smoothing), blend, 1)?;
        builder.connect(Edge::Node(edges), blend, 2)?;
        builder.connect(Edge::Node(blend), tone, 0)?;
        let graph = builder.build(ctx, tone)?;

        Ok(Self { graph, smoothing, edges, blend, tone, params })
    }

    /// Run the effect. The returned texture is owned by the filter and is
    /// overwritten by the next call.
    pub fn apply(&mut self, input: &Texture) -> Result<&Texture, GraphError> {
        self.graph.apply(input)
    }

    pub fn params(&self) -> &BeautifyParams {
        &self.params
    }

    /// Replace every stage parameter. Nothing changes if any value is invalid.
    pub fn set_params(&mut self, params: BeautifyParams) -> Result<(), ParameterError> {
        params.validate()?;
        if let Some(stage) = self.graph.stage_mut::<BilateralFilter>(self.smoothing) {
            stage.configure(params.smoothing)?;
        }
        if let Some(stage) = self.graph.stage_mut::<CannyEdgeDetection>(self.edges) {
            stage.configure(params.edges)?;
        }
        if let Some(stage) = self.graph.stage_mut::<CombinationFilter>(self.blend) {
            stage.configure(params.blend)?;
        }
        if let Some(stage) = self.graph.stage_mut::<HsbFilter>(self.tone) {
            stage.configure(params.tone)?;
        }
        if self.params != params {
            info!("Beautify parameters updated");
        }
        self.params = params;
        Ok(())
    }

    pub fn graph(&self) -> &FilterGraph {
        &self.graph
    }

    /// Node ids in the order smoothing, edges, blend, tone.
    pub fn nodes(&self) -> [NodeId; 4] {
        [self.smoothing, self.edges, self.blend, self.tone]
    }
}
