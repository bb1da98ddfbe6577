use ccl_lower::{
    AttrValue, DataType, ExternalValue, GraphNode, LaunchArgs, LowerContext, LowerInput,
    LoweringHost, NodeDesc, Placement, PlanOp, PlanOpKind, Result, Shape, StreamHandle,
    TensorDesc, lower_node,
};

use super::helpers::{ptr, ptr_mut, run_ranks, sample, small_config};

/// Outputs mirror the inputs.
struct EchoHost;

impl LoweringHost for EchoHost {
    fn infer_shape(&self, _node: &NodeDesc, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        Ok(input_shapes.to_vec())
    }

    fn calc_tensor_size(&self, node: &NodeDesc, shapes: &[Shape]) -> Result<Vec<u64>> {
        let elem = node.inputs[0].dtype.size_in_bytes();
        Ok(shapes.iter().map(|s| (s.num_elements().unwrap() * elem) as u64).collect())
    }

    fn allocate_output(
        &mut self,
        _placement: Placement,
        _node: &NodeDesc,
        byte_sizes: &[u64],
    ) -> Result<Vec<ExternalValue>> {
        Ok((0..byte_sizes.len() as u64).map(ExternalValue).collect())
    }
}

fn allreduce_node(dims: &[u64]) -> NodeDesc {
    NodeDesc::new("grad_sync", "HcomAllReduce")
        .with_attr("group", AttrValue::Str("world".into()))
        .with_attr("reduction", AttrValue::Str("sum".into()))
        .with_input(TensorDesc::new(DataType::F32, dims.to_vec()))
        .with_output(TensorDesc::new(DataType::F32, dims.to_vec()))
}

/// Lower the node, then launch the prepared arguments on real buffers.
fn lowered_args(desc: NodeDesc, input: u64, output: u64) -> LaunchArgs {
    let lower_input = LowerInput {
        input_shapes: desc.inputs.iter().map(|t| t.shape.clone()).collect(),
        input_addrs: vec![ExternalValue(1).into()],
        stream: ExternalValue(2).into(),
    };
    let node = GraphNode::new(0, desc);
    let mut host = EchoHost;
    let mut cx = LowerContext::new(&mut host);
    let lowered = lower_node(Some(&node), &lower_input, &mut cx).unwrap();

    let blob = lowered
        .plan
        .nodes()
        .iter()
        .find_map(|n| match &n.op {
            PlanOp::PrepareArgs { blob } => Some(blob.clone()),
            _ => None,
        })
        .unwrap();
    let prepare = lowered
        .plan
        .of_kind(PlanOpKind::PrepareKernel)
        .next()
        .unwrap();
    let PlanOp::PrepareKernel {
        input_shapes,
        output_shapes,
        ..
    } = &prepare.op
    else {
        unreachable!()
    };
    assert_eq!(output_shapes, &lowered.out_shapes);

    LaunchArgs::from_blob(
        &blob,
        StreamHandle(0),
        vec![input],
        vec![output],
        input_shapes.clone(),
        output_shapes.clone(),
    )
    .unwrap()
}

#[test]
fn test_lowered_allreduce_runs_end_to_end() {
    // A [3, 4] f32 tensor fills the 48-byte scratch exactly.
    let results = run_ranks(2, small_config(48), |ctx| {
        let r = ctx.rank();
        let data: Vec<f32> = (0..12).map(|i| sample(r, i)).collect();
        let mut out = vec![0.0f32; 12];
        let args = lowered_args(allreduce_node(&[3, 4]), ptr(&data), ptr_mut(&mut out));
        assert_eq!(args.input_counts(), vec![12]);
        ctx.execute(&args).unwrap();
        out
    });

    for out in results {
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, sample(0, i) + sample(1, i));
        }
    }
}
