use ccl_lower::attrs::extract;
use ccl_lower::plan::ArgsBlob;
use ccl_lower::{
    AttrValue, DataType, GraphNode, LowerContext, LoweringCategory, OperationKind, Placement,
    PlanOp, PlanOpKind, Shape, TensorDesc, entry_point,
};

use super::helpers::{
    MockHost, alltoallv, allreduce, broadcast, collective, ext, input_for, lower, receive,
};

#[test]
fn test_broadcast_passes_shape_and_address_through() {
    let mut host = MockHost::new();
    let out = lower(broadcast(&[4]), &mut host).unwrap();

    assert_eq!(out.out_shapes, vec![Shape::from([4])]);
    assert_eq!(out.out_addrs, vec![ext(1)]);
    assert!(host.allocations.is_empty());
    assert_eq!(out.plan.count(PlanOpKind::AllocateOutput), 0);
    assert_eq!(out.plan.count(PlanOpKind::LaunchKernel), 1);

    let launch = out.plan.of_kind(PlanOpKind::LaunchKernel).next().unwrap();
    assert_eq!(out.ordered_holders, vec![launch.id]);
    // Input and output bindings are the same buffer.
    assert_eq!(&launch.inputs[1..], &[ext(1), ext(1)]);
}

#[test]
fn test_send_never_allocates() {
    let mut host = MockHost::new();
    let desc = collective("tx", "HcomSend")
        .with_attr("dest_rank", AttrValue::Int(1))
        .with_attr("sr_tag", AttrValue::Int(0))
        .with_input(TensorDesc::new(DataType::F16, [3, 3]))
        // Declared output differs from the input; in-place lowering trusts the input.
        .with_output(TensorDesc::new(DataType::F16, [1]));
    let out = lower(desc, &mut host).unwrap();
    assert_eq!(out.out_shapes, vec![Shape::from([3, 3])]);
    assert!(host.allocations.is_empty());
}

#[test]
fn test_allreduce_allocates_inferred_bytes() {
    let mut host = MockHost::new();
    let out = lower(allreduce(&[1024]), &mut host).unwrap();

    assert_eq!(out.out_shapes, vec![Shape::from([1024])]);
    assert_eq!(host.allocations, vec![(Placement::Device, vec![4096])]);
    assert_eq!(host.requested_bytes(), 4096);

    let alloc = out.plan.of_kind(PlanOpKind::AllocateOutput).next().unwrap();
    let PlanOp::AllocateOutput {
        placement,
        byte_sizes,
        ..
    } = &alloc.op
    else {
        unreachable!()
    };
    assert_eq!(*placement, Placement::Device);
    assert_eq!(byte_sizes, &vec![4096]);

    let launch = out.plan.of_kind(PlanOpKind::LaunchKernel).next().unwrap();
    assert_eq!(launch.inputs[1], ext(1));
    assert_eq!(launch.inputs[2], alloc.output(0));
    assert_eq!(out.out_addrs, launch.outputs());
}

#[test]
fn test_alltoallv_adapts_every_input_but_the_first() {
    let mut host = MockHost::new();
    let out = lower(alltoallv(5), &mut host).unwrap();

    assert_eq!(out.plan.count(PlanOpKind::PlacementAdapter), 4);
    let adapters: Vec<_> = out.plan.of_kind(PlanOpKind::PlacementAdapter).collect();
    for (i, adapter) in adapters.iter().enumerate() {
        assert_eq!(
            adapter.op,
            PlanOp::PlacementAdapter {
                target: Placement::Host
            }
        );
        assert_eq!(adapter.inputs, vec![ext(i as u64 + 2)]);
    }

    let launch = out.plan.of_kind(PlanOpKind::LaunchKernel).next().unwrap();
    assert_eq!(launch.inputs[1], ext(1));
    for (i, adapter) in adapters.iter().enumerate() {
        assert_eq!(launch.inputs[i + 2], adapter.output(0));
        assert!(out.ordered_holders.contains(&adapter.id));
    }
    assert_eq!(out.ordered_holders.len(), 5);
    assert_eq!(host.allocations.len(), 1);
}

#[test]
fn test_host_negotiated_family_shares_the_convention() {
    for op_type in ["HcomAllToAllVC", "HcomAllToAll", "HcomAllGatherV"] {
        let mut desc = collective("v", op_type)
            .with_input(TensorDesc::new(DataType::F32, [16]))
            .with_input(TensorDesc::new(DataType::I64, [2]))
            .with_output(TensorDesc::new(DataType::F32, [16]));
        if op_type == "HcomAllGatherV" {
            desc = desc.with_attr("rank_size", AttrValue::Int(2));
        }
        let out = lower(desc, &mut MockHost::new()).unwrap();
        assert_eq!(out.plan.count(PlanOpKind::PlacementAdapter), 1, "{op_type}");
    }
}

#[test]
fn test_receive_binds_one_release_guard() {
    let mut host = MockHost::new();
    let out = lower(receive(&[16]), &mut host).unwrap();

    assert_eq!(out.plan.count(PlanOpKind::ReleaseGuard), 1);
    assert!(host.allocations.is_empty());
    assert_eq!(out.out_shapes, vec![Shape::from([16])]);
    assert_eq!(out.out_addrs.len(), 1);

    let launch = out.plan.of_kind(PlanOpKind::LaunchKernel).next().unwrap();
    assert!(matches!(
        launch.op,
        PlanOp::LaunchKernel {
            kind: OperationKind::Receive,
            negotiated: true
        }
    ));
    assert_eq!(launch.num_outputs, 2);

    let guard = out.plan.of_kind(PlanOpKind::ReleaseGuard).next().unwrap();
    assert_eq!(guard.inputs, vec![launch.output(1)]);
    assert_eq!(guard.after, vec![launch.id]);
    assert!(!out.out_addrs.contains(&launch.output(1)));
}

#[test]
fn test_prepare_blob_matches_extracted_attributes() {
    let desc = allreduce(&[8]);
    let expected = extract(&desc).unwrap();
    let out = lower(desc, &mut MockHost::new()).unwrap();

    let node = out.plan.of_kind(PlanOpKind::PrepareArgs).next().unwrap();
    let PlanOp::PrepareArgs { blob } = &node.op else {
        unreachable!()
    };
    assert_eq!(blob.decode().unwrap(), expected);
    assert_eq!(blob, &ArgsBlob::encode(&expected).unwrap());

    let prep = out.plan.of_kind(PlanOpKind::PrepareKernel).next().unwrap();
    assert_eq!(prep.inputs, vec![node.output(0), ext(99)]);
}

#[test]
fn test_every_kind_routes_to_its_category() {
    let cases = [
        (broadcast(&[4]), LoweringCategory::InPlace),
        (allreduce(&[4]), LoweringCategory::Allocating),
        (alltoallv(3), LoweringCategory::HostNegotiated),
        (receive(&[4]), LoweringCategory::UnknownSize),
    ];
    for (desc, category) in cases {
        let kind = OperationKind::from_type_name(&desc.op_type).unwrap();
        assert_eq!(kind.category(), category);

        let input = input_for(&desc);
        let node = GraphNode::new(1, desc);
        let mut host = MockHost::new();
        let mut cx = LowerContext::new(&mut host);
        let out = entry_point(category)(Some(&node), &input, &mut cx).unwrap();
        out.plan.validate().unwrap();
    }
}

#[test]
fn test_shared_context_keeps_ids_unique() {
    let mut host = MockHost::new();
    let mut cx = LowerContext::new(&mut host);
    let mut ids = Vec::new();
    for desc in [allreduce(&[4]), broadcast(&[4]), receive(&[2])] {
        let input = input_for(&desc);
        let node = GraphNode::new(1, desc);
        let out = ccl_lower::lower_node(Some(&node), &input, &mut cx).unwrap();
        ids.extend(out.plan.nodes().iter().map(|n| n.id));
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}
