pub mod attrs;
pub mod backend;
pub mod config;
pub mod error;
pub mod graph;
pub mod lowering;
pub mod plan;
pub mod runtime;
pub mod types;

pub use attrs::{CollectiveAttributes, CollectiveOp, GroupName, LoweringCategory, OperationKind};
#[cfg(feature = "cuda")]
pub use backend::NcclBackend;
pub use backend::{CommBackend, HostGroup, StreamHandle};
pub use config::LowerConfig;
pub use error::{LowerError, Result};
pub use graph::{AttrValue, GraphNode, LoweringHost, NodeDesc, TensorDesc};
pub use lowering::{LowerContext, LowerInput, LowerOutput, entry_point, lower_node};
pub use plan::{ExternalValue, PlanFragment, PlanNode, PlanNodeId, PlanOp, PlanOpKind, ValueRef};
pub use runtime::{Executor, LaunchArgs, ScratchPool};
pub use types::{DataType, Placement, Rank, ReduceOp, Shape};
