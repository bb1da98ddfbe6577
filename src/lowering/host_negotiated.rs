use crate::attrs::LoweringCategory;
use crate::error::Result;
use crate::graph::GraphNode;
use crate::lowering::{LowerContext, LowerInput, LowerOutput, allocate_outputs, begin, finish};
use crate::plan::{self, PlanFragment, PlanNode, PlanOp};
use crate::types::Placement;

/// Lower the kinds whose kernels read counts on the host before launching
/// (AllToAll family, AllGatherV, ReduceScatterV).
///
/// Input 0 is the payload and stays on the device. Every later input gets a
/// host placement adapter; the launch consumes the adapted handles and the
/// adapters are returned as ordering holders.
pub fn lower_host_negotiated(
    node: Option<&GraphNode>,
    input: &LowerInput,
    cx: &mut LowerContext<'_>,
) -> Result<LowerOutput> {
    let (desc, attrs) = begin(node, input, LoweringCategory::HostNegotiated)?;

    let mut fragment = PlanFragment::new();
    let mut adapted = Vec::with_capacity(input.input_addrs.len());
    let mut adapters = Vec::new();
    for (index, addr) in input.input_addrs.iter().enumerate() {
        if index == 0 {
            adapted.push(*addr);
            continue;
        }
        let adapter = PlanNode::new(
            cx.ids.next_id(),
            PlanOp::PlacementAdapter {
                target: Placement::Host,
            },
            vec![*addr],
            1,
        );
        adapted.push(adapter.output(0));
        adapters.push(fragment.push(adapter));
    }
    tracing::debug!(node = %desc.name, adapters = adapters.len(), "inserted host adapters");

    let outputs = allocate_outputs(desc, &input.input_shapes, cx, &mut fragment)?;
    let launched = plan::build(
        &mut cx.ids,
        &desc.name,
        &attrs,
        input.stream,
        &adapted,
        &outputs.addrs,
        &input.input_shapes,
        &outputs.shapes,
    )?;
    fragment.extend(launched.fragment);

    let mut ordered_holders = Vec::with_capacity(1 + adapters.len());
    ordered_holders.push(launched.launch);
    ordered_holders.extend(adapters);

    finish(
        desc,
        LowerOutput {
            plan: fragment,
            ordered_holders,
            out_shapes: outputs.shapes,
            out_addrs: launched.outputs,
        },
    )
}
