use ccl_lower::{
    AttrValue, DataType, ExternalValue, GraphNode, LowerContext, LowerError, LowerInput,
    LowerOutput, LoweringHost, NodeDesc, Placement, Result, Shape, TensorDesc, ValueRef,
    lower_node,
};

/// Host stand-in: echoes declared output shapes, sizes them from the
/// declared dtypes and hands out sequential addresses.
#[derive(Debug, Default)]
pub struct MockHost {
    pub allocations: Vec<(Placement, Vec<u64>)>,
    pub fail: Option<&'static str>,
    next_addr: u64,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            next_addr: 1000,
            ..Self::default()
        }
    }

    pub fn failing(collaborator: &'static str) -> Self {
        Self {
            fail: Some(collaborator),
            ..Self::new()
        }
    }

    fn check(&self, collaborator: &'static str, node: &NodeDesc) -> Result<()> {
        if self.fail == Some(collaborator) {
            return Err(LowerError::host(collaborator, &node.name, "injected failure"));
        }
        Ok(())
    }

    pub fn requested_bytes(&self) -> u64 {
        self.allocations.iter().flat_map(|(_, b)| b).sum()
    }
}

impl LoweringHost for MockHost {
    fn infer_shape(&self, node: &NodeDesc, _input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        self.check("infer_shape", node)?;
        Ok(node.outputs.iter().map(|o| o.shape.clone()).collect())
    }

    fn calc_tensor_size(&self, node: &NodeDesc, shapes: &[Shape]) -> Result<Vec<u64>> {
        self.check("calc_tensor_size", node)?;
        Ok(shapes
            .iter()
            .zip(&node.outputs)
            .map(|(s, o)| (s.num_elements().unwrap() * o.dtype.size_in_bytes()) as u64)
            .collect())
    }

    fn allocate_output(
        &mut self,
        placement: Placement,
        node: &NodeDesc,
        byte_sizes: &[u64],
    ) -> Result<Vec<ExternalValue>> {
        self.check("allocate_output", node)?;
        self.allocations.push((placement, byte_sizes.to_vec()));
        Ok(byte_sizes
            .iter()
            .map(|_| {
                self.next_addr += 1;
                ExternalValue(self.next_addr)
            })
            .collect())
    }
}

pub const STREAM: ExternalValue = ExternalValue(99);

/// Input `i` is bound to `ExternalValue(i + 1)`.
pub fn input_for(desc: &NodeDesc) -> LowerInput {
    LowerInput {
        input_shapes: desc.inputs.iter().map(|t| t.shape.clone()).collect(),
        input_addrs: (0..desc.inputs.len())
            .map(|i| ExternalValue(i as u64 + 1).into())
            .collect(),
        stream: STREAM.into(),
    }
}

pub fn ext(v: u64) -> ValueRef {
    ExternalValue(v).into()
}

pub fn lower(desc: NodeDesc, host: &mut MockHost) -> Result<LowerOutput> {
    let input = input_for(&desc);
    let node = GraphNode::new(7, desc);
    let mut cx = LowerContext::new(host);
    lower_node(Some(&node), &input, &mut cx)
}

pub fn collective(name: &str, op_type: &str) -> NodeDesc {
    NodeDesc::new(name, op_type).with_attr("group", AttrValue::Str("world".into()))
}

pub fn allreduce(dims: &[u64]) -> NodeDesc {
    collective("ar", "HcomAllReduce")
        .with_attr("reduction", AttrValue::Str("sum".into()))
        .with_input(TensorDesc::new(DataType::F32, dims.to_vec()))
        .with_output(TensorDesc::new(DataType::F32, dims.to_vec()))
}

pub fn broadcast(dims: &[u64]) -> NodeDesc {
    collective("bc", "HcomBroadcast")
        .with_attr("root_rank", AttrValue::Int(0))
        .with_input(TensorDesc::new(DataType::F32, dims.to_vec()))
        .with_output(TensorDesc::new(DataType::F32, dims.to_vec()))
}

/// Data tensor plus `n - 1` count/displacement tensors.
pub fn alltoallv(inputs: usize) -> NodeDesc {
    let mut desc = collective("a2a", "HcomAllToAllV")
        .with_input(TensorDesc::new(DataType::F32, [64]))
        .with_output(TensorDesc::new(DataType::F32, [64]));
    for _ in 1..inputs {
        desc = desc.with_input(TensorDesc::new(DataType::I64, [4]));
    }
    desc
}

pub fn receive(dims: &[u64]) -> NodeDesc {
    collective("rx", "HcomReceive")
        .with_attr("src_rank", AttrValue::Int(1))
        .with_attr("sr_tag", AttrValue::Int(5))
        .with_output(TensorDesc::new(DataType::I32, dims.to_vec()))
}
