//! Per-category lowering of collective graph nodes into plan fragments.
//!
//! Every entry point follows the same sequence: resolve the descriptor,
//! extract attributes, then hand the category-specific work to its module.
//! A node's lowering is strictly sequential; independent nodes may be
//! lowered in parallel with separate contexts.

mod allocating;
mod host_negotiated;
mod in_place;
mod unknown_size;

pub use allocating::lower_allocating;
pub use host_negotiated::lower_host_negotiated;
pub use in_place::lower_in_place;
pub use unknown_size::lower_unknown_size;

use crate::attrs::{self, CollectiveAttributes, LoweringCategory, OperationKind};
use crate::error::{LowerError, Result};
use crate::graph::{GraphNode, LoweringHost, NodeDesc};
use crate::plan::{IdAllocator, PlanFragment, PlanNode, PlanNodeId, PlanOp, ValueRef};
use crate::types::{Placement, Shape};

/// Resolved inputs of the node being lowered.
#[derive(Debug, Clone)]
pub struct LowerInput {
    pub input_shapes: Vec<Shape>,
    pub input_addrs: Vec<ValueRef>,
    /// Stream the kernels are issued on.
    pub stream: ValueRef,
}

/// Mutable state shared by the lowerings of one graph.
pub struct LowerContext<'a> {
    pub host: &'a mut dyn LoweringHost,
    pub ids: IdAllocator,
}

impl<'a> LowerContext<'a> {
    pub fn new(host: &'a mut dyn LoweringHost) -> Self {
        Self {
            host,
            ids: IdAllocator::new(),
        }
    }
}

/// Result of lowering one node.
#[derive(Debug)]
pub struct LowerOutput {
    pub plan: PlanFragment,
    /// Nodes the downstream schedule must order after.
    pub ordered_holders: Vec<PlanNodeId>,
    pub out_shapes: Vec<Shape>,
    pub out_addrs: Vec<ValueRef>,
}

pub type LoweringFn =
    fn(Option<&GraphNode>, &LowerInput, &mut LowerContext<'_>) -> Result<LowerOutput>;

/// The lowering entry point registered for a category.
pub fn entry_point(category: LoweringCategory) -> LoweringFn {
    match category {
        LoweringCategory::InPlace => lower_in_place,
        LoweringCategory::Allocating => lower_allocating,
        LoweringCategory::HostNegotiated => lower_host_negotiated,
        LoweringCategory::UnknownSize => lower_unknown_size,
    }
}

/// Route a node to the entry point of its operation kind's category.
pub fn lower_node(
    node: Option<&GraphNode>,
    input: &LowerInput,
    cx: &mut LowerContext<'_>,
) -> Result<LowerOutput> {
    let desc = descriptor(node)?;
    let Some(kind) = OperationKind::from_type_name(&desc.op_type) else {
        tracing::warn!(node = %desc.name, op_type = %desc.op_type, "no lowering for operation type");
        return Err(LowerError::UnsupportedOperation {
            op_type: desc.op_type.clone(),
        });
    };
    entry_point(kind.category())(node, input, cx)
}

fn descriptor(node: Option<&GraphNode>) -> Result<&NodeDesc> {
    match node.and_then(|n| n.desc.as_deref()) {
        Some(desc) => Ok(desc),
        None => {
            tracing::error!(
                graph_node = ?node.map(|n| n.id),
                "lowering called on a null node or descriptor"
            );
            Err(LowerError::NullNode)
        }
    }
}

/// Steps 1 and 2 shared by every category: non-null descriptor, extracted
/// attributes of the expected category, consistent input lists.
fn begin<'n>(
    node: Option<&'n GraphNode>,
    input: &LowerInput,
    expected: LoweringCategory,
) -> Result<(&'n NodeDesc, CollectiveAttributes)> {
    let desc = descriptor(node)?;
    let attrs = attrs::extract(desc)?;
    let kind = attrs.kind();
    if kind.category() != expected {
        tracing::warn!(
            node = %desc.name,
            %kind,
            category = ?expected,
            "operation routed to the wrong lowering category"
        );
        return Err(LowerError::UnsupportedOperation {
            op_type: desc.op_type.clone(),
        });
    }
    if input.input_shapes.len() != input.input_addrs.len() {
        tracing::warn!(node = %desc.name, %kind, "input shapes and addresses disagree");
        return Err(LowerError::ArgumentMismatch {
            what: "input addresses",
            expected: input.input_shapes.len(),
            actual: input.input_addrs.len(),
        });
    }
    tracing::debug!(node = %desc.name, %kind, category = ?expected, "lowering collective");
    Ok((desc, attrs))
}

/// Allocated device outputs for a node, as planned by the host.
struct Allocation {
    shapes: Vec<Shape>,
    addrs: Vec<ValueRef>,
}

/// Infer output shapes, size them, allocate device memory, and emit the
/// node binding the allocated addresses.
fn allocate_outputs(
    desc: &NodeDesc,
    input_shapes: &[Shape],
    cx: &mut LowerContext<'_>,
    plan: &mut PlanFragment,
) -> Result<Allocation> {
    let shapes = cx
        .host
        .infer_shape(desc, input_shapes)
        .inspect_err(|e| tracing::warn!(node = %desc.name, "shape inference failed: {e}"))?;
    let byte_sizes = cx
        .host
        .calc_tensor_size(desc, &shapes)
        .inspect_err(|e| tracing::warn!(node = %desc.name, "size computation failed: {e}"))?;
    if byte_sizes.len() != shapes.len() {
        tracing::warn!(node = %desc.name, "size computation returned the wrong arity");
        return Err(LowerError::host(
            "calc_tensor_size",
            &desc.name,
            format!("{} sizes for {} shapes", byte_sizes.len(), shapes.len()),
        ));
    }
    let addresses = cx
        .host
        .allocate_output(Placement::Device, desc, &byte_sizes)
        .inspect_err(|e| tracing::warn!(node = %desc.name, "output allocation failed: {e}"))?;
    if addresses.len() != byte_sizes.len() {
        tracing::warn!(node = %desc.name, "allocator returned the wrong number of outputs");
        return Err(LowerError::host(
            "allocate_output",
            &desc.name,
            format!("{} addresses for {} sizes", addresses.len(), byte_sizes.len()),
        ));
    }
    tracing::debug!(node = %desc.name, bytes = ?byte_sizes, "allocated device outputs");

    let num_outputs = addresses.len();
    let alloc = PlanNode::new(
        cx.ids.next_id(),
        PlanOp::AllocateOutput {
            placement: Placement::Device,
            byte_sizes,
            addresses,
        },
        Vec::new(),
        num_outputs,
    );
    let addrs = alloc.outputs();
    plan.push(alloc);
    Ok(Allocation { shapes, addrs })
}

/// Check the fragment before handing it to the scheduler.
fn finish(desc: &NodeDesc, output: LowerOutput) -> Result<LowerOutput> {
    output
        .plan
        .validate()
        .inspect_err(|e| tracing::error!(node = %desc.name, "emitted an invalid plan: {e}"))?;
    Ok(output)
}
