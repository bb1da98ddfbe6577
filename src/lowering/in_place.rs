use crate::attrs::LoweringCategory;
use crate::error::Result;
use crate::graph::GraphNode;
use crate::lowering::{LowerContext, LowerInput, LowerOutput, begin, finish};
use crate::plan;

/// Lower Broadcast and Send: the kernel works on the input buffers, so the
/// outputs are the inputs. The in-place contract is not re-checked here.
pub fn lower_in_place(
    node: Option<&GraphNode>,
    input: &LowerInput,
    cx: &mut LowerContext<'_>,
) -> Result<LowerOutput> {
    let (desc, attrs) = begin(node, input, LoweringCategory::InPlace)?;

    let launched = plan::build(
        &mut cx.ids,
        &desc.name,
        &attrs,
        input.stream,
        &input.input_addrs,
        &input.input_addrs,
        &input.input_shapes,
        &input.input_shapes,
    )?;

    finish(
        desc,
        LowerOutput {
            plan: launched.fragment,
            ordered_holders: vec![launched.launch],
            out_shapes: input.input_shapes.clone(),
            out_addrs: input.input_addrs.clone(),
        },
    )
}
