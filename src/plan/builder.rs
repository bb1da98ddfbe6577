//! Two-stage launch emission.
//!
//! `prepare` fixes everything that depends only on shapes and attributes;
//! `launch` binds addresses, which may change between runs of the same
//! compiled plan. Both return fresh fragments; the caller concatenates them.

use crate::attrs::{CollectiveAttributes, OperationKind};
use crate::error::{LowerError, Result};
use crate::plan::{
    ArgsBlob, IdAllocator, PlanFragment, PlanNode, PlanNodeId, PlanOp, ValueRef,
};
use crate::types::Shape;

/// Output of the prepare stage.
#[derive(Debug)]
pub struct Prepared {
    pub fragment: PlanFragment,
    pub kind: OperationKind,
    /// Opaque prepared-argument handle consumed by the launch stage.
    pub handle: ValueRef,
}

/// Output of the launch stage.
#[derive(Debug)]
pub struct Launched {
    pub fragment: PlanFragment,
    pub launch: PlanNodeId,
    /// Output address handles the rest of the graph consumes.
    pub outputs: Vec<ValueRef>,
}

/// Buffer holding the element count negotiated with the sender.
///
/// Not `Clone`: the only way to dispose of it is [`NegotiationBuffer::release`],
/// which consumes it, so exactly one guard is bound per receive.
#[derive(Debug)]
pub struct NegotiationBuffer {
    value: ValueRef,
    producer: PlanNodeId,
}

impl NegotiationBuffer {
    pub fn value(&self) -> ValueRef {
        self.value
    }

    /// Emit the guard that frees the buffer after its last consumer.
    pub fn release(self, ids: &mut IdAllocator) -> PlanFragment {
        let mut fragment = PlanFragment::new();
        fragment.push(
            PlanNode::new(ids.next_id(), PlanOp::ReleaseGuard, vec![self.value], 0)
                .after([self.producer]),
        );
        fragment
    }
}

/// Output of the negotiated receive launch.
#[derive(Debug)]
pub struct ReceiveLaunch {
    pub fragment: PlanFragment,
    pub launch: PlanNodeId,
    pub outputs: Vec<ValueRef>,
    pub negotiation: NegotiationBuffer,
}

/// Stage 1: emit the constant argument blob and the prepare kernel.
///
/// Fails with `PrepareEmpty` when the node has neither inputs nor outputs,
/// since such a kernel would produce nothing to launch.
pub fn prepare(
    ids: &mut IdAllocator,
    node_name: &str,
    attrs: &CollectiveAttributes,
    stream: ValueRef,
    input_shapes: &[Shape],
    output_shapes: &[Shape],
) -> Result<Prepared> {
    if input_shapes.is_empty() && output_shapes.is_empty() {
        tracing::warn!(node = node_name, kind = %attrs.kind(), "prepare stage has no tensors");
        return Err(LowerError::PrepareEmpty {
            node: node_name.to_string(),
        });
    }

    let mut fragment = PlanFragment::new();
    let blob = ArgsBlob::encode(attrs)?;
    let args = PlanNode::new(ids.next_id(), PlanOp::PrepareArgs { blob }, Vec::new(), 1);
    let args_out = args.output(0);
    fragment.push(args);

    let kernel = PlanNode::new(
        ids.next_id(),
        PlanOp::PrepareKernel {
            kind: attrs.kind(),
            input_shapes: input_shapes.to_vec(),
            output_shapes: output_shapes.to_vec(),
        },
        vec![args_out, stream],
        1,
    );
    let handle = kernel.output(0);
    fragment.push(kernel);

    Ok(Prepared {
        fragment,
        kind: attrs.kind(),
        handle,
    })
}

/// Stage 2: emit the launch kernel over late-bound addresses.
pub fn launch(
    ids: &mut IdAllocator,
    prepared: &Prepared,
    input_addrs: &[ValueRef],
    output_addrs: &[ValueRef],
) -> Launched {
    let node = launch_node(
        ids,
        prepared,
        input_addrs,
        output_addrs,
        output_addrs.len(),
        false,
    );
    let outputs = node.outputs();
    let launch = node.id;
    let mut fragment = PlanFragment::new();
    fragment.push(node);
    Launched {
        fragment,
        launch,
        outputs,
    }
}

/// Stage 2 for receives: the kernel negotiates the element count with the
/// sender before receiving, so its `output_num` data outputs are allocated by
/// the kernel itself. The negotiation buffer is handed back alongside them.
pub fn launch_receive(
    ids: &mut IdAllocator,
    prepared: &Prepared,
    output_num: usize,
) -> ReceiveLaunch {
    let node = launch_node(ids, prepared, &[], &[], output_num + 1, true);
    let outputs = (0..output_num).map(|i| node.output(i)).collect();
    let negotiation = NegotiationBuffer {
        value: node.output(output_num),
        producer: node.id,
    };
    let launch = node.id;
    let mut fragment = PlanFragment::new();
    fragment.push(node);
    ReceiveLaunch {
        fragment,
        launch,
        outputs,
        negotiation,
    }
}

/// Prepare and launch in one go for kinds without a negotiation step.
#[allow(clippy::too_many_arguments)]
pub fn build(
    ids: &mut IdAllocator,
    node_name: &str,
    attrs: &CollectiveAttributes,
    stream: ValueRef,
    input_addrs: &[ValueRef],
    output_addrs: &[ValueRef],
    input_shapes: &[Shape],
    output_shapes: &[Shape],
) -> Result<Launched> {
    let prepared = prepare(ids, node_name, attrs, stream, input_shapes, output_shapes)?;
    let launched = launch(ids, &prepared, input_addrs, output_addrs);
    let mut fragment = prepared.fragment;
    fragment.extend(launched.fragment);
    Ok(Launched {
        fragment,
        launch: launched.launch,
        outputs: launched.outputs,
    })
}

fn launch_node(
    ids: &mut IdAllocator,
    prepared: &Prepared,
    input_addrs: &[ValueRef],
    output_addrs: &[ValueRef],
    num_outputs: usize,
    negotiated: bool,
) -> PlanNode {
    let mut inputs = Vec::with_capacity(1 + input_addrs.len() + output_addrs.len());
    inputs.push(prepared.handle);
    inputs.extend_from_slice(input_addrs);
    inputs.extend_from_slice(output_addrs);
    PlanNode::new(
        ids.next_id(),
        PlanOp::LaunchKernel {
            kind: prepared.kind,
            negotiated,
        },
        inputs,
        num_outputs,
    )
}
