use crate::attrs::LoweringCategory;
use crate::error::Result;
use crate::graph::GraphNode;
use crate::lowering::{LowerContext, LowerInput, LowerOutput, allocate_outputs, begin, finish};
use crate::plan::{self, PlanFragment};

/// Lower AllReduce, AllGather, ReduceScatter and Reduce into freshly
/// allocated device outputs.
pub fn lower_allocating(
    node: Option<&GraphNode>,
    input: &LowerInput,
    cx: &mut LowerContext<'_>,
) -> Result<LowerOutput> {
    let (desc, attrs) = begin(node, input, LoweringCategory::Allocating)?;

    let mut fragment = PlanFragment::new();
    let outputs = allocate_outputs(desc, &input.input_shapes, cx, &mut fragment)?;
    let launched = plan::build(
        &mut cx.ids,
        &desc.name,
        &attrs,
        input.stream,
        &input.input_addrs,
        &outputs.addrs,
        &input.input_shapes,
        &outputs.shapes,
    )?;
    fragment.extend(launched.fragment);

    finish(
        desc,
        LowerOutput {
            plan: fragment,
            ordered_holders: vec![launched.launch],
            out_shapes: outputs.shapes,
            out_addrs: launched.outputs,
        },
    )
}
