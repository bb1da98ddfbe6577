use ccl_lower::config::GROUP_NAME_CAPACITY;
use ccl_lower::{
    AttrValue, DataType, GraphNode, LowerContext, LowerError, LoweringCategory, NodeDesc,
    TensorDesc, entry_point, lower_node,
};

use super::helpers::{MockHost, allreduce, alltoallv, broadcast, collective, input_for, lower};

#[test]
fn test_null_node_and_descriptor() {
    let mut host = MockHost::new();
    let mut cx = LowerContext::new(&mut host);
    let input = input_for(&allreduce(&[4]));

    assert!(matches!(
        lower_node(None, &input, &mut cx),
        Err(LowerError::NullNode)
    ));

    let bare = GraphNode { id: 3, desc: None };
    for category in [
        LoweringCategory::InPlace,
        LoweringCategory::Allocating,
        LoweringCategory::HostNegotiated,
        LoweringCategory::UnknownSize,
    ] {
        assert!(matches!(
            entry_point(category)(Some(&bare), &input, &mut cx),
            Err(LowerError::NullNode)
        ));
    }
}

#[test]
fn test_unknown_operation_type() {
    let desc = collective("x", "HcomGossip").with_input(TensorDesc::new(DataType::F32, [4]));
    let err = lower(desc, &mut MockHost::new()).unwrap_err();
    assert!(matches!(
        err,
        LowerError::UnsupportedOperation { ref op_type } if op_type == "HcomGossip"
    ));
}

#[test]
fn test_wrong_category_entry_point() {
    let desc = allreduce(&[4]);
    let input = input_for(&desc);
    let node = GraphNode::new(1, desc);
    let mut host = MockHost::new();
    let mut cx = LowerContext::new(&mut host);
    let err = entry_point(LoweringCategory::InPlace)(Some(&node), &input, &mut cx).unwrap_err();
    assert!(matches!(err, LowerError::UnsupportedOperation { .. }));
}

#[test]
fn test_missing_attribute_stops_before_allocation() {
    let desc = NodeDesc::new("ar", "HcomAllReduce")
        .with_attr("group", AttrValue::Str("world".into()))
        .with_input(TensorDesc::new(DataType::F32, [4]))
        .with_output(TensorDesc::new(DataType::F32, [4]));
    let mut host = MockHost::new();
    let err = lower(desc, &mut host).unwrap_err();
    assert!(matches!(
        err,
        LowerError::AttributeMissing {
            attr: "reduction",
            ..
        }
    ));
    assert!(host.allocations.is_empty());
}

#[test]
fn test_group_name_overflow() {
    let mut desc = broadcast(&[4]);
    desc.attrs.insert(
        "group".into(),
        AttrValue::Str("g".repeat(GROUP_NAME_CAPACITY)),
    );
    let err = lower(desc, &mut MockHost::new()).unwrap_err();
    assert!(matches!(
        err,
        LowerError::BufferOverflow {
            capacity: GROUP_NAME_CAPACITY,
            ..
        }
    ));
}

#[test]
fn test_host_collaborator_failures_propagate() {
    for collaborator in ["infer_shape", "calc_tensor_size", "allocate_output"] {
        let mut host = MockHost::failing(collaborator);
        let err = lower(allreduce(&[4]), &mut host).unwrap_err();
        assert!(
            matches!(err, LowerError::Host { collaborator: c, .. } if c == collaborator),
            "{collaborator}: {err}"
        );
        assert!(host.allocations.is_empty());
    }

    let mut host = MockHost::failing("allocate_output");
    let err = lower(alltoallv(3), &mut host).unwrap_err();
    assert!(matches!(err, LowerError::Host { .. }));
}

#[test]
fn test_mismatched_input_lists() {
    let desc = allreduce(&[4]);
    let mut input = input_for(&desc);
    input.input_addrs.clear();
    let node = GraphNode::new(1, desc);
    let mut host = MockHost::new();
    let mut cx = LowerContext::new(&mut host);
    let err = lower_node(Some(&node), &input, &mut cx).unwrap_err();
    assert!(matches!(
        err,
        LowerError::ArgumentMismatch {
            expected: 1,
            actual: 0,
            ..
        }
    ));
}

#[test]
fn test_receive_without_outputs_is_rejected() {
    // Extraction takes the element type from output 0.
    let desc = collective("rx", "HcomReceive")
        .with_attr("src_rank", AttrValue::Int(0))
        .with_attr("sr_tag", AttrValue::Int(0));
    let err = lower(desc, &mut MockHost::new()).unwrap_err();
    assert!(matches!(
        err,
        LowerError::AttributeMissing { attr: "dtype", .. }
    ));
}
