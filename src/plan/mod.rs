//! Immutable execution-plan fragments emitted by lowering.
//!
//! A fragment is an ordered list of plan nodes. Each node may only consume
//! values of, or be ordered after, nodes that precede it, so a validated
//! fragment is a DAG in topological order. Fragments are never executed here;
//! the host scheduler merges them into its own schedule.

mod builder;

pub use builder::{
    Launched, NegotiationBuffer, Prepared, ReceiveLaunch, build, launch, launch_receive, prepare,
};

use std::collections::HashSet;
use std::sync::Arc;

use crate::attrs::{CollectiveAttributes, OperationKind};
use crate::error::{LowerError, Result};
use crate::types::{Placement, Shape};

/// Identity of a plan node, unique within one lowering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanNodeId(u64);

impl std::fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a value owned by the host framework (an input address, a
/// stream, an allocated output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalValue(pub u64);

/// A value consumed by a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRef {
    External(ExternalValue),
    Output { node: PlanNodeId, index: usize },
}

impl ValueRef {
    pub fn producer(&self) -> Option<PlanNodeId> {
        match self {
            ValueRef::External(_) => None,
            ValueRef::Output { node, .. } => Some(*node),
        }
    }
}

impl From<ExternalValue> for ValueRef {
    fn from(v: ExternalValue) -> Self {
        ValueRef::External(v)
    }
}

/// Mints plan node ids. Owned by the caller of a lowering, never global.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> PlanNodeId {
        let id = PlanNodeId(self.next);
        self.next += 1;
        id
    }
}

/// rkyv-encoded [`CollectiveAttributes`], the constant argument blob.
#[derive(Clone)]
pub struct ArgsBlob(Arc<rkyv::util::AlignedVec>);

impl ArgsBlob {
    pub fn encode(attrs: &CollectiveAttributes) -> Result<Self> {
        Ok(Self(Arc::new(attrs.encode()?)))
    }

    pub fn decode(&self) -> Result<CollectiveAttributes> {
        CollectiveAttributes::decode(self.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for ArgsBlob {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ArgsBlob {}

impl std::fmt::Debug for ArgsBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArgsBlob({}B)", self.len())
    }
}

/// What a plan node does.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOp {
    /// Materialise the constant argument blob.
    PrepareArgs { blob: ArgsBlob },
    /// Bind output buffers obtained from the host allocator.
    AllocateOutput {
        placement: Placement,
        byte_sizes: Vec<u64>,
        addresses: Vec<ExternalValue>,
    },
    /// Make the input's current content visible at `target`.
    PlacementAdapter { target: Placement },
    /// Stage 1: fix shape-dependent kernel arguments.
    PrepareKernel {
        kind: OperationKind,
        input_shapes: Vec<Shape>,
        output_shapes: Vec<Shape>,
    },
    /// Stage 2: run the kernel with late-bound addresses. `negotiated`
    /// kernels query the peer's element count before receiving.
    LaunchKernel {
        kind: OperationKind,
        negotiated: bool,
    },
    /// Free the consumed buffer once, after its last consumer.
    ReleaseGuard,
}

/// Discriminant of [`PlanOp`], for counting and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanOpKind {
    PrepareArgs,
    AllocateOutput,
    PlacementAdapter,
    PrepareKernel,
    LaunchKernel,
    ReleaseGuard,
}

impl PlanOp {
    pub fn op_kind(&self) -> PlanOpKind {
        match self {
            PlanOp::PrepareArgs { .. } => PlanOpKind::PrepareArgs,
            PlanOp::AllocateOutput { .. } => PlanOpKind::AllocateOutput,
            PlanOp::PlacementAdapter { .. } => PlanOpKind::PlacementAdapter,
            PlanOp::PrepareKernel { .. } => PlanOpKind::PrepareKernel,
            PlanOp::LaunchKernel { .. } => PlanOpKind::LaunchKernel,
            PlanOp::ReleaseGuard => PlanOpKind::ReleaseGuard,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub id: PlanNodeId,
    pub op: PlanOp,
    pub inputs: Vec<ValueRef>,
    pub num_outputs: usize,
    /// Must-happen-before edges that carry no data.
    pub after: Vec<PlanNodeId>,
}

impl PlanNode {
    pub fn new(id: PlanNodeId, op: PlanOp, inputs: Vec<ValueRef>, num_outputs: usize) -> Self {
        Self {
            id,
            op,
            inputs,
            num_outputs,
            after: Vec::new(),
        }
    }

    pub fn after(mut self, deps: impl IntoIterator<Item = PlanNodeId>) -> Self {
        self.after.extend(deps);
        self
    }

    pub fn output(&self, index: usize) -> ValueRef {
        debug_assert!(index < self.num_outputs);
        ValueRef::Output {
            node: self.id,
            index,
        }
    }

    pub fn outputs(&self) -> Vec<ValueRef> {
        (0..self.num_outputs).map(|i| self.output(i)).collect()
    }

    /// Every node this one depends on, through data or ordering.
    pub fn dependencies(&self) -> impl Iterator<Item = PlanNodeId> + '_ {
        self.inputs
            .iter()
            .filter_map(ValueRef::producer)
            .chain(self.after.iter().copied())
    }
}

/// An ordered, append-only group of plan nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanFragment {
    nodes: Vec<PlanNode>,
}

impl PlanFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its id.
    pub fn push(&mut self, node: PlanNode) -> PlanNodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Append all nodes of `other`, preserving their order.
    pub fn extend(&mut self, other: PlanFragment) {
        self.nodes.extend(other.nodes);
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: PlanNodeId) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn count(&self, kind: PlanOpKind) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.op.op_kind() == kind)
            .count()
    }

    pub fn of_kind(&self, kind: PlanOpKind) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter().filter(move |n| n.op.op_kind() == kind)
    }

    /// Nodes that consume any output of `id` or are ordered after it.
    pub fn dependents_of(&self, id: PlanNodeId) -> impl Iterator<Item = &PlanNode> {
        self.nodes
            .iter()
            .filter(move |n| n.dependencies().any(|d| d == id))
    }

    /// Check that ids are unique and every reference points to an earlier
    /// node with a matching output slot.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            for input in &node.inputs {
                if let ValueRef::Output { node: src, index } = input {
                    let producer = self
                        .nodes
                        .iter()
                        .find(|n| n.id == *src && seen.contains(src))
                        .ok_or_else(|| {
                            LowerError::MalformedPlan(format!(
                                "{} consumes {src} which does not precede it",
                                node.id
                            ))
                        })?;
                    if *index >= producer.num_outputs {
                        return Err(LowerError::MalformedPlan(format!(
                            "{} reads output {index} of {src} which has {}",
                            node.id, producer.num_outputs
                        )));
                    }
                }
            }
            if let Some(dep) = node.after.iter().find(|d| !seen.contains(*d)) {
                return Err(LowerError::MalformedPlan(format!(
                    "{} is ordered after {dep} which does not precede it",
                    node.id
                )));
            }
            if !seen.insert(node.id) {
                return Err(LowerError::MalformedPlan(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }
        Ok(())
    }
}
