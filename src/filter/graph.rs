//! Fixed-topology DAG of filter stages.
//!
//! Nodes live in an arena indexed by [`NodeId`]; every input slot is wired to
//! either the graph input ([`Edge::Source`]) or another node. The topology is
//! validated once in [`GraphBuilder::build`] and never changes afterwards.

use super::{FilterStage, Parameter, ParameterError};
use crate::gpu::{ensure_texture, GpuContext, GpuError, Texture};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Index of a node inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Where an input slot reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The texture passed to [`FilterGraph::apply`]
    Source,
    Node(NodeId),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,

    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("{stage} takes no inputs")]
    NoInputs { stage: &'static str },

    #[error("{stage} has {arity} input(s), slot {slot} does not exist")]
    SlotOutOfRange { stage: &'static str, slot: usize, arity: usize },

    #[error("input {slot} of {stage} is wired twice")]
    SlotAlreadyWired { stage: &'static str, slot: usize },

    #[error("input {slot} of {stage} is not wired")]
    UnwiredSlot { stage: &'static str, slot: usize },

    #[error("graph contains a cycle")]
    Cycle,

    #[error("output of {stage} is never consumed")]
    UnusedOutput { stage: &'static str },

    #[error("no stage reads the graph input")]
    SourceUnused,

    #[error("{stage} received inputs of different sizes ({expected:?} vs {actual:?})")]
    InvalidIntermediateSize { stage: &'static str, expected: (u32, u32), actual: (u32, u32) },

    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: GpuError,
    },
}

struct Node {
    stage: Box<dyn FilterStage>,
    inputs: Vec<Option<Edge>>,
}

/// Collects nodes and edges before validation.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, stage: impl FilterStage) -> NodeId {
        let inputs = vec![None; stage.input_count()];
        self.nodes.push(Node { stage: Box::new(stage), inputs });
        NodeId(self.nodes.len() - 1)
    }

    /// Wire `from` into input `slot` of `to`.
    pub fn connect(&mut self, from: Edge, to: NodeId, slot: usize) -> Result<&mut Self, GraphError> {
        if let Edge::Node(id) = from {
            if id.0 >= self.nodes.len() {
                return Err(GraphError::UnknownNode(id));
            }
        }
        let node = self.nodes.get_mut(to.0).ok_or(GraphError::UnknownNode(to))?;
        let stage = node.stage.name();
        let arity = node.inputs.len();
        let input = node
            .inputs
            .get_mut(slot)
            .ok_or(GraphError::SlotOutOfRange { stage, slot, arity })?;
        if input.is_some() {
            return Err(GraphError::SlotAlreadyWired { stage, slot });
        }
        *input = Some(from);
        Ok(self)
    }

    /// Validate the topology and freeze it. `terminal` produces the output.
    pub fn build(self, ctx: Arc<dyn GpuContext>, terminal: NodeId) -> Result<FilterGraph, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        if terminal.0 >= self.nodes.len() {
            return Err(GraphError::UnknownNode(terminal));
        }

        let mut wired = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            // Output size is taken from the first input.
            if node.inputs.is_empty() {
                return Err(GraphError::NoInputs { stage: node.stage.name() });
            }
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for (slot, input) in node.inputs.iter().enumerate() {
                let edge = input.ok_or(GraphError::UnwiredSlot { stage: node.stage.name(), slot })?;
                inputs.push(edge);
            }
            wired.push(inputs);
        }

        let mut consumers = vec![Vec::new(); self.nodes.len()];
        let mut pending = vec![0usize; self.nodes.len()];
        let mut source_used = false;
        for (index, inputs) in wired.iter().enumerate() {
            for edge in inputs {
                match edge {
                    Edge::Source => source_used = true,
                    Edge::Node(from) => {
                        consumers[from.0].push(index);
                        pending[index] += 1;
                    }
                }
            }
        }
        if !source_used {
            return Err(GraphError::SourceUnused);
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if index != terminal.0 && consumers[index].is_empty() {
                return Err(GraphError::UnusedOutput { stage: node.stage.name() });
            }
        }

        // Kahn's algorithm, lowest index first so the order is stable.
        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(index) = ready.pop_front() {
            order.push(index);
            for &next in &consumers[index] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle);
        }

        let stages = self.nodes.into_iter().map(|node| node.stage).collect::<Vec<_>>();
        debug!(
            "Built filter graph: {}",
            order.iter().map(|&i| stages[i].name()).collect::<Vec<_>>().join(" -> ")
        );
        let outputs = (0..stages.len()).map(|_| None).collect();
        Ok(FilterGraph { ctx, stages, inputs: wired, order, terminal: terminal.0, outputs })
    }
}

/// A validated graph, applied once per frame.
///
/// Every node writes into its own texture, allocated on first use and reused
/// while the frame size stays the same. All of them are released on drop.
pub struct FilterGraph {
    ctx: Arc<dyn GpuContext>,
    stages: Vec<Box<dyn FilterStage>>,
    inputs: Vec<Vec<Edge>>,
    order: Vec<usize>,
    terminal: usize,
    outputs: Vec<Option<Texture>>,
}

impl FilterGraph {
    /// Run every stage in dependency order and return the terminal output.
    ///
    /// On error nothing is returned; textures written so far stay owned by the
    /// graph and are overwritten by the next call.
    pub fn apply(&mut self, input: &Texture) -> Result<&Texture, GraphError> {
        let ctx = self.ctx.as_ref();
        for &index in &self.order {
            // Taken out of the arena while the stage runs; acyclic graphs never
            // read their own output.
            let mut slot = self.outputs[index].take();
            let result = run_stage(
                ctx,
                self.stages[index].as_mut(),
                &self.inputs[index],
                &self.outputs,
                input,
                &mut slot,
            );
            self.outputs[index] = slot;
            result?;
        }

        self.outputs[self.terminal]
            .as_ref()
            .ok_or(GraphError::UnknownNode(NodeId(self.terminal)))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn terminal(&self) -> NodeId {
        NodeId(self.terminal)
    }

    /// Stage names in execution order.
    pub fn execution_order(&self) -> Vec<&'static str> {
        self.order.iter().map(|&i| self.stages[i].name()).collect()
    }

    /// Number of node outputs currently holding a texture.
    pub fn allocated_outputs(&self) -> usize {
        self.outputs.iter().filter(|t| t.is_some()).count()
    }

    pub fn parameters(&self, node: NodeId) -> Result<Vec<Parameter>, GraphError> {
        let stage = self.stages.get(node.0).ok_or(GraphError::UnknownNode(node))?;
        Ok(stage.parameters())
    }

    pub fn set_parameter(&mut self, node: NodeId, name: &str, value: f32) -> Result<(), ParameterError> {
        match self.stages.get_mut(node.0) {
            Some(stage) => stage.set_parameter(name, value),
            None => Err(ParameterError::Unknown { stage: "graph", name: name.to_string() }),
        }
    }

    /// Typed access to a stage, for parameter blocks.
    pub fn stage_mut<T: FilterStage>(&mut self, node: NodeId) -> Option<&mut T> {
        self.stages.get_mut(node.0)?.as_any_mut().downcast_mut::<T>()
    }

    /// Free every texture the graph and its stages hold.
    pub fn release(&mut self) {
        let ctx = self.ctx.as_ref();
        for texture in self.outputs.iter_mut().filter_map(Option::take) {
            ctx.release_texture(texture);
        }
        for stage in &mut self.stages {
            stage.release(ctx);
        }
    }
}

fn run_stage(
    ctx: &dyn GpuContext,
    stage: &mut dyn FilterStage,
    edges: &[Edge],
    outputs: &[Option<Texture>],
    input: &Texture,
    slot: &mut Option<Texture>,
) -> Result<(), GraphError> {
    let name = stage.name();
    let mut sources = Vec::with_capacity(edges.len());
    for edge in edges {
        let texture = match edge {
            Edge::Source => input,
            Edge::Node(from) => outputs[from.0].as_ref().ok_or(GraphError::UnknownNode(*from))?,
        };
        sources.push(texture);
    }
    let expected = sources[0].size();
    if let Some(other) = sources.iter().find(|t| t.size() != expected) {
        return Err(GraphError::InvalidIntermediateSize { stage: name, expected, actual: other.size() });
    }

    let output = ensure_texture(ctx, slot, expected.0, expected.1, stage.output_format())
        .map_err(|source| GraphError::StageFailed { stage: name, source })?;
    stage
        .apply(ctx, &sources, output)
        .map_err(|source| GraphError::StageFailed { stage: name, source })
}

impl Drop for FilterGraph {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_util::rgba;
    use crate::filter::{BilateralFilter, CombinationFilter, HsbFilter};
    use crate::gpu::{CpuContext, Kernel, TextureFormat};
    use std::any::Any;

    /// Adds a constant to red, fails on demand.
    struct Offset {
        amount: f32,
        fail: bool,
    }

    impl FilterStage for Offset {
        fn name(&self) -> &'static str {
            "offset"
        }

        fn parameters(&self) -> Vec<Parameter> {
            vec![Parameter::new("amount", self.amount, -1.0..=1.0)]
        }

        fn set_parameter(&mut self, name: &str, value: f32) -> Result<(), ParameterError> {
            match name {
                "amount" => self.amount = crate::filter::check_range("amount", value, -1.0..=1.0)?,
                "fail" => self.fail = value != 0.0,
                _ => return Err(ParameterError::Unknown { stage: self.name(), name: name.into() }),
            }
            Ok(())
        }

        fn apply(&mut self, ctx: &dyn GpuContext, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
            if self.fail {
                return Err(GpuError::Device("injected".into()));
            }
            let mut matrix = [[0.0; 4]; 4];
            for (i, row) in matrix.iter_mut().enumerate() {
                row[i] = 1.0;
            }
            let kernel = Kernel::ColorMatrix { matrix, offset: [self.amount, 0.0, 0.0, 0.0] };
            ctx.dispatch_render_pass(&kernel, inputs, output)
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// A stage without inputs.
    struct Generator;

    impl FilterStage for Generator {
        fn name(&self) -> &'static str {
            "generator"
        }

        fn input_count(&self) -> usize {
            0
        }

        fn parameters(&self) -> Vec<Parameter> {
            Vec::new()
        }

        fn set_parameter(&mut self, name: &str, _value: f32) -> Result<(), ParameterError> {
            Err(ParameterError::Unknown { stage: self.name(), name: name.into() })
        }

        fn apply(&mut self, _ctx: &dyn GpuContext, _inputs: &[&Texture], _output: &mut Texture) -> Result<(), GpuError> {
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn offset(amount: f32) -> Offset {
        Offset { amount, fail: false }
    }

    fn cpu() -> (Arc<CpuContext>, Arc<dyn GpuContext>) {
        let ctx = Arc::new(CpuContext::new());
        let dynamic: Arc<dyn GpuContext> = ctx.clone();
        (ctx, dynamic)
    }

    #[test]
    fn test_chain_runs_in_dependency_order() {
        let (cpu, ctx) = cpu();
        let mut builder = GraphBuilder::new();
        let second = builder.add_node(offset(0.4));
        let first = builder.add_node(offset(0.2));
        builder.connect(Edge::Source, first, 0).unwrap();
        builder.connect(Edge::Node(first), second, 0).unwrap();
        let mut graph = builder.build(ctx, second).unwrap();

        let input = rgba(&cpu, 2, 2, |_, _| [0, 0, 0, 255]);
        let output = graph.apply(&input).unwrap();
        assert_eq!(cpu.read_texture(output).unwrap()[0], 153);
        assert_eq!(graph.execution_order(), vec!["offset", "offset"]);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_build_rejects_bad_topologies() {
        let (_, ctx) = cpu();

        assert!(matches!(GraphBuilder::new().build(ctx.clone(), NodeId(0)), Err(GraphError::Empty)));

        let mut unwired = GraphBuilder::new();
        let blend = unwired.add_node(CombinationFilter::default());
        unwired.connect(Edge::Source, blend, 0).unwrap();
        assert!(matches!(
            unwired.build(ctx.clone(), blend),
            Err(GraphError::UnwiredSlot { slot: 1, .. })
        ));

        let mut cyclic = GraphBuilder::new();
        let a = cyclic.add_node(offset(0.0));
        let b = cyclic.add_node(CombinationFilter::default());
        cyclic.connect(Edge::Node(b), a, 0).unwrap();
        cyclic.connect(Edge::Node(a), b, 0).unwrap();
        cyclic.connect(Edge::Source, b, 1).unwrap();
        cyclic.connect(Edge::Source, b, 2).unwrap();
        assert!(matches!(cyclic.build(ctx.clone(), b), Err(GraphError::Cycle)));

        let mut dangling = GraphBuilder::new();
        let used = dangling.add_node(offset(0.0));
        let unused = dangling.add_node(offset(0.0));
        dangling.connect(Edge::Source, used, 0).unwrap();
        dangling.connect(Edge::Source, unused, 0).unwrap();
        assert!(matches!(dangling.build(ctx.clone(), used), Err(GraphError::UnusedOutput { .. })));

        let mut sourceless = GraphBuilder::new();
        let x = sourceless.add_node(offset(0.0));
        let y = sourceless.add_node(offset(0.0));
        sourceless.connect(Edge::Node(y), x, 0).unwrap();
        sourceless.connect(Edge::Node(x), y, 0).unwrap();
        assert!(matches!(sourceless.build(ctx.clone(), x), Err(GraphError::SourceUnused)));

        let mut generated = GraphBuilder::new();
        let generator = generated.add_node(Generator);
        let tail = generated.add_node(offset(0.0));
        generated.connect(Edge::Node(generator), tail, 0).unwrap();
        assert!(matches!(generated.build(ctx, tail), Err(GraphError::NoInputs { stage: "generator" })));
    }

    #[test]
    fn test_connect_rejects_bad_slots() {
        let mut builder = GraphBuilder::new();
        let node = builder.add_node(HsbFilter::default());
        builder.connect(Edge::Source, node, 0).unwrap();
        assert!(matches!(
            builder.connect(Edge::Source, node, 0),
            Err(GraphError::SlotAlreadyWired { slot: 0, .. })
        ));
        assert!(matches!(
            builder.connect(Edge::Source, node, 1),
            Err(GraphError::SlotOutOfRange { arity: 1, .. })
        ));
        assert!(matches!(
            builder.connect(Edge::Node(NodeId(7)), node, 0),
            Err(GraphError::UnknownNode(NodeId(7)))
        ));
    }

    #[test]
    fn test_failed_stage_fails_whole_graph() {
        let (cpu, ctx) = cpu();
        let mut builder = GraphBuilder::new();
        let first = builder.add_node(offset(0.1));
        let second = builder.add_node(offset(0.1));
        builder.connect(Edge::Source, first, 0).unwrap();
        builder.connect(Edge::Node(first), second, 0).unwrap();
        let mut graph = builder.build(ctx, second).unwrap();
        let input = rgba(&cpu, 2, 2, |_, _| [0, 0, 0, 255]);

        graph.set_parameter(second, "fail", 1.0).unwrap();
        let err = graph.apply(&input).unwrap_err();
        assert!(matches!(err, GraphError::StageFailed { stage: "offset", .. }));

        // The next frame goes through once the stage recovers.
        graph.set_parameter(second, "fail", 0.0).unwrap();
        assert!(graph.apply(&input).is_ok());
    }

    #[test]
    fn test_out_of_memory_is_a_stage_failure() {
        let cpu = Arc::new(CpuContext::with_memory_limit(4 * 4 * 4 * 2));
        let ctx: Arc<dyn GpuContext> = cpu.clone();
        let mut builder = GraphBuilder::new();
        let first = builder.add_node(offset(0.1));
        let second = builder.add_node(offset(0.1));
        builder.connect(Edge::Source, first, 0).unwrap();
        builder.connect(Edge::Node(first), second, 0).unwrap();
        let mut graph = builder.build(ctx, second).unwrap();

        let input = rgba(&cpu, 4, 4, |_, _| [0, 0, 0, 255]);
        let err = graph.apply(&input).unwrap_err();
        assert!(matches!(
            err,
            GraphError::StageFailed { source: GpuError::OutOfMemory { .. }, .. }
        ));
    }

    #[test]
    fn test_textures_are_reused_and_released() {
        let (cpu, ctx) = cpu();
        let mut builder = GraphBuilder::new();
        let smooth = builder.add_node(BilateralFilter::default());
        builder.connect(Edge::Source, smooth, 0).unwrap();
        let mut graph = builder.build(ctx, smooth).unwrap();
        let input = rgba(&cpu, 3, 3, |_, _| [9, 9, 9, 255]);

        let first = graph.apply(&input).unwrap().id();
        let second = graph.apply(&input).unwrap().id();
        assert_eq!(first, second);
        assert_eq!(cpu.live_textures(), 2);

        let resized = rgba(&cpu, 4, 3, |_, _| [9, 9, 9, 255]);
        assert_eq!(graph.apply(&resized).unwrap().width(), 4);
        assert_eq!(cpu.live_textures(), 3);

        drop(graph);
        assert_eq!(cpu.live_textures(), 2);
    }

    #[test]
    fn test_stage_mut_downcasts() {
        let (_, ctx) = cpu();
        let mut builder = GraphBuilder::new();
        let tone = builder.add_node(HsbFilter::default());
        builder.connect(Edge::Source, tone, 0).unwrap();
        let mut graph = builder.build(ctx, tone).unwrap();
        assert!(graph.stage_mut::<HsbFilter>(tone).is_some());
        assert!(graph.stage_mut::<BilateralFilter>(tone).is_none());
        assert_eq!(graph.parameters(tone).unwrap().len(), 3);
        assert_eq!(graph.stage_mut::<HsbFilter>(tone).map(|s| s.output_format()), Some(TextureFormat::Rgba8));
    }
}
