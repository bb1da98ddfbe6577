use crate::attrs::{CollectiveAttributes, CollectiveOp, GroupName, OperationKind};
use crate::error::{LowerError, Result};
use crate::graph::NodeDesc;
use crate::types::{DataType, ReduceOp};

/// Build the argument record for a collective node.
///
/// Fails with `UnsupportedOperation` for operation types outside the kind
/// table, `AttributeMissing`/`AttributeType` for malformed metadata and
/// `BufferOverflow` when the group name does not fit.
pub fn extract(node: &NodeDesc) -> Result<CollectiveAttributes> {
    let Some(kind) = OperationKind::from_type_name(&node.op_type) else {
        tracing::warn!(
            node = %node.name,
            op_type = %node.op_type,
            "attribute extraction: unsupported operation type"
        );
        return Err(LowerError::UnsupportedOperation {
            op_type: node.op_type.clone(),
        });
    };

    let result = common(node, kind).and_then(|(dtype, core_limit, group)| {
        Ok(CollectiveAttributes {
            op: payload(node, kind)?,
            dtype,
            core_limit,
            group,
        })
    });
    if let Err(e) = &result {
        tracing::warn!(node = %node.name, %kind, "attribute extraction failed: {e}");
    }
    result
}

/// Fields every kind carries: element type, core limit, group.
fn common(node: &NodeDesc, kind: OperationKind) -> Result<(DataType, u32, GroupName)> {
    let dtype = match kind {
        OperationKind::Receive => node.outputs.first(),
        _ => node.inputs.first(),
    }
    .map(|d| d.dtype)
    .ok_or_else(|| node.missing("dtype"))?;

    let core_limit = node.opt_u32_attr("core_limit")?.unwrap_or(0);
    let group = GroupName::new(node.str_attr("group")?).map_err(|e| match e {
        LowerError::InvalidGroupName { .. } => LowerError::AttributeType {
            node: node.name.clone(),
            attr: "group",
            expected: "string without interior NUL",
        },
        e => e,
    })?;
    Ok((dtype, core_limit, group))
}

fn payload(node: &NodeDesc, kind: OperationKind) -> Result<CollectiveOp> {
    let op = match kind {
        OperationKind::AllGather => CollectiveOp::AllGather {
            rank_size: rank_size(node)?,
        },
        OperationKind::AllGatherV => CollectiveOp::AllGatherV {
            rank_size: rank_size(node)?,
        },
        OperationKind::AllReduce => CollectiveOp::AllReduce {
            op: reduction(node)?,
        },
        OperationKind::Broadcast => CollectiveOp::Broadcast {
            root: node.u32_attr("root_rank")?,
        },
        OperationKind::ReduceScatter => CollectiveOp::ReduceScatter {
            op: reduction(node)?,
            rank_size: rank_size(node)?,
        },
        OperationKind::ReduceScatterV => CollectiveOp::ReduceScatterV {
            op: reduction(node)?,
            rank_size: rank_size(node)?,
        },
        OperationKind::AllToAllV => CollectiveOp::AllToAllV {
            recv_dtype: recv_dtype(node)?,
        },
        OperationKind::AllToAllVC => CollectiveOp::AllToAllVC {
            recv_dtype: recv_dtype(node)?,
        },
        OperationKind::AllToAll => CollectiveOp::AllToAll {
            recv_dtype: recv_dtype(node)?,
        },
        OperationKind::Send => CollectiveOp::Send {
            dest_rank: node.u32_attr("dest_rank")?,
            tag: node.u32_attr("sr_tag")?,
        },
        OperationKind::Receive => CollectiveOp::Receive {
            src_rank: node.u32_attr("src_rank")?,
            tag: node.u32_attr("sr_tag")?,
        },
        OperationKind::Reduce => CollectiveOp::Reduce {
            root: node.u32_attr("root_rank")?,
            op: reduction(node)?,
        },
    };
    Ok(op)
}

fn rank_size(node: &NodeDesc) -> Result<u32> {
    match node.u32_attr("rank_size")? {
        0 => Err(node.wrong_type("rank_size", "positive rank count")),
        n => Ok(n),
    }
}

fn reduction(node: &NodeDesc) -> Result<ReduceOp> {
    let name = node.str_attr("reduction")?;
    ReduceOp::from_name(name).ok_or_else(|| node.wrong_type("reduction", "sum|prod|min|max"))
}

/// The receive element type is whatever output 0 declares.
fn recv_dtype(node: &NodeDesc) -> Result<DataType> {
    node.outputs
        .first()
        .map(|d| d.dtype)
        .ok_or_else(|| node.missing("recv_dtype"))
}
