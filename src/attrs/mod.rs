//! Collective attribute records and their extraction from graph nodes.

mod extract;
mod group;
mod kind;

pub use extract::extract;
pub use group::GroupName;
pub use kind::{LoweringCategory, OperationKind};

use crate::error::{LowerError, Result};
use crate::types::{DataType, Rank, ReduceOp};

/// One collective operation together with the payload its kind needs.
///
/// The kind is the variant, so a payload can never be read under the wrong
/// kind.
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum CollectiveOp {
    AllGather { rank_size: u32 },
    AllGatherV { rank_size: u32 },
    AllReduce { op: ReduceOp },
    Broadcast { root: Rank },
    ReduceScatter { op: ReduceOp, rank_size: u32 },
    ReduceScatterV { op: ReduceOp, rank_size: u32 },
    AllToAllV { recv_dtype: DataType },
    AllToAllVC { recv_dtype: DataType },
    AllToAll { recv_dtype: DataType },
    Send { dest_rank: Rank, tag: u32 },
    Receive { src_rank: Rank, tag: u32 },
    Reduce { root: Rank, op: ReduceOp },
}

impl CollectiveOp {
    pub const fn kind(&self) -> OperationKind {
        match self {
            CollectiveOp::AllGather { .. } => OperationKind::AllGather,
            CollectiveOp::AllGatherV { .. } => OperationKind::AllGatherV,
            CollectiveOp::AllReduce { .. } => OperationKind::AllReduce,
            CollectiveOp::Broadcast { .. } => OperationKind::Broadcast,
            CollectiveOp::ReduceScatter { .. } => OperationKind::ReduceScatter,
            CollectiveOp::ReduceScatterV { .. } => OperationKind::ReduceScatterV,
            CollectiveOp::AllToAllV { .. } => OperationKind::AllToAllV,
            CollectiveOp::AllToAllVC { .. } => OperationKind::AllToAllVC,
            CollectiveOp::AllToAll { .. } => OperationKind::AllToAll,
            CollectiveOp::Send { .. } => OperationKind::Send,
            CollectiveOp::Receive { .. } => OperationKind::Receive,
            CollectiveOp::Reduce { .. } => OperationKind::Reduce,
        }
    }

    /// Reduction carried by the payload, if the kind reduces.
    pub const fn reduce_op(&self) -> Option<ReduceOp> {
        match *self {
            CollectiveOp::AllReduce { op }
            | CollectiveOp::ReduceScatter { op, .. }
            | CollectiveOp::ReduceScatterV { op, .. }
            | CollectiveOp::Reduce { op, .. } => Some(op),
            _ => None,
        }
    }
}

/// Fixed-layout argument record describing one collective node.
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CollectiveAttributes {
    pub op: CollectiveOp,
    /// Element type of the data input (output for receives).
    pub dtype: DataType,
    /// Scheduling hint: maximum cores the kernel may occupy, 0 = unlimited.
    pub core_limit: u32,
    pub group: GroupName,
}

impl CollectiveAttributes {
    pub const fn kind(&self) -> OperationKind {
        self.op.kind()
    }

    /// Encode into the constant argument blob consumed by the prepare stage.
    pub fn encode(&self) -> Result<rkyv::util::AlignedVec> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| LowerError::EncodeFailed(e.to_string()))
    }

    /// Decode a blob produced by [`CollectiveAttributes::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<CollectiveAttributes, rkyv::rancor::Error>(bytes)
            .map_err(|e| LowerError::DecodeFailed(e.to_string()))
    }
}
