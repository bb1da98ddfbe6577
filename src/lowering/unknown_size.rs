use crate::attrs::LoweringCategory;
use crate::error::Result;
use crate::graph::GraphNode;
use crate::lowering::{LowerContext, LowerInput, LowerOutput, begin, finish};
use crate::plan;
use crate::types::Shape;

/// Lower Receive. The sender's element count is only known at run time, so
/// the launch negotiates it first and the negotiation buffer is released by
/// a guard ordered after the launch.
pub fn lower_unknown_size(
    node: Option<&GraphNode>,
    input: &LowerInput,
    cx: &mut LowerContext<'_>,
) -> Result<LowerOutput> {
    let (desc, attrs) = begin(node, input, LoweringCategory::UnknownSize)?;

    let out_shapes: Vec<Shape> = desc.outputs.iter().map(|o| o.shape.clone()).collect();
    let prepared = plan::prepare(
        &mut cx.ids,
        &desc.name,
        &attrs,
        input.stream,
        &input.input_shapes,
        &out_shapes,
    )?;
    let rx = plan::launch_receive(&mut cx.ids, &prepared, out_shapes.len());

    let mut fragment = prepared.fragment;
    fragment.extend(rx.fragment);
    fragment.extend(rx.negotiation.release(&mut cx.ids));
    tracing::debug!(node = %desc.name, launch = %rx.launch, "bound negotiation release guard");

    finish(
        desc,
        LowerOutput {
            plan: fragment,
            ordered_holders: vec![rx.launch],
            out_shapes,
            out_addrs: rx.outputs,
        },
    )
}
