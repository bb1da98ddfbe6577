/// Closed set of collective operations this crate lowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    AllGather,
    AllGatherV,
    AllReduce,
    Broadcast,
    ReduceScatter,
    ReduceScatterV,
    AllToAllV,
    AllToAllVC,
    AllToAll,
    Send,
    Receive,
    Reduce,
}

/// How a kind is lowered: which buffers it owns and what must be resolved
/// before its kernel can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoweringCategory {
    /// Output aliases the input; nothing is allocated.
    InPlace,
    /// Output shape is inferred and fresh device memory allocated.
    Allocating,
    /// Count/displacement inputs must be host-visible before launch.
    HostNegotiated,
    /// Receive size is only known after talking to the sender.
    UnknownSize,
}

/// Graph operation type names, one per kind.
const TYPE_TABLE: [(&str, OperationKind); 12] = [
    ("HcomAllGather", OperationKind::AllGather),
    ("HcomAllGatherV", OperationKind::AllGatherV),
    ("HcomAllReduce", OperationKind::AllReduce),
    ("HcomBroadcast", OperationKind::Broadcast),
    ("HcomReduceScatter", OperationKind::ReduceScatter),
    ("HcomReduceScatterV", OperationKind::ReduceScatterV),
    ("HcomAllToAllV", OperationKind::AllToAllV),
    ("HcomAllToAllVC", OperationKind::AllToAllVC),
    ("HcomAllToAll", OperationKind::AllToAll),
    ("HcomSend", OperationKind::Send),
    ("HcomReceive", OperationKind::Receive),
    ("HcomReduce", OperationKind::Reduce),
];

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::AllGather,
        OperationKind::AllGatherV,
        OperationKind::AllReduce,
        OperationKind::Broadcast,
        OperationKind::ReduceScatter,
        OperationKind::ReduceScatterV,
        OperationKind::AllToAllV,
        OperationKind::AllToAllVC,
        OperationKind::AllToAll,
        OperationKind::Send,
        OperationKind::Receive,
        OperationKind::Reduce,
    ];

    /// Look up the kind for a graph node's operation type.
    pub fn from_type_name(op_type: &str) -> Option<Self> {
        TYPE_TABLE
            .iter()
            .find(|(name, _)| *name == op_type)
            .map(|&(_, kind)| kind)
    }

    /// Graph operation type name for this kind.
    pub fn type_name(self) -> &'static str {
        TYPE_TABLE
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|&(name, _)| name)
            .unwrap_or("unknown")
    }

    pub const fn category(self) -> LoweringCategory {
        match self {
            OperationKind::Broadcast | OperationKind::Send => LoweringCategory::InPlace,
            OperationKind::AllReduce
            | OperationKind::AllGather
            | OperationKind::ReduceScatter
            | OperationKind::Reduce => LoweringCategory::Allocating,
            OperationKind::AllToAllV
            | OperationKind::AllToAllVC
            | OperationKind::AllToAll
            | OperationKind::AllGatherV
            | OperationKind::ReduceScatterV => LoweringCategory::HostNegotiated,
            OperationKind::Receive => LoweringCategory::UnknownSize,
        }
    }

    /// Name of the communication primitive the kernel invokes.
    pub const fn primitive_name(self) -> &'static str {
        match self {
            OperationKind::AllGather => "allgather",
            OperationKind::AllGatherV => "allgatherv",
            OperationKind::AllReduce => "allreduce",
            OperationKind::Broadcast => "broadcast",
            OperationKind::ReduceScatter => "reduce_scatter",
            OperationKind::ReduceScatterV => "reduce_scatterv",
            OperationKind::AllToAllV => "alltoallv",
            OperationKind::AllToAllVC => "alltoallvc",
            OperationKind::AllToAll => "alltoall",
            OperationKind::Send => "send",
            OperationKind::Receive => "recv",
            OperationKind::Reduce => "reduce",
        }
    }

    /// Whether the runtime stages this kind through the scratch buffer.
    pub const fn is_batched(self) -> bool {
        !matches!(
            self,
            OperationKind::Broadcast
                | OperationKind::Send
                | OperationKind::Receive
                | OperationKind::Reduce
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.primitive_name())
    }
}
