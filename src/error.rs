use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, LowerError>;

#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("unsupported collective operation type '{op_type}'")]
    UnsupportedOperation { op_type: String },

    #[error("node '{node}' is missing required attribute '{attr}'")]
    AttributeMissing { node: String, attr: &'static str },

    #[error("node '{node}' attribute '{attr}' is not a valid {expected}")]
    AttributeType {
        node: String,
        attr: &'static str,
        expected: &'static str,
    },

    #[error("{field} needs {required} bytes but the buffer holds {capacity}")]
    BufferOverflow {
        field: &'static str,
        capacity: usize,
        required: usize,
    },

    #[error("group name {name:?} contains an interior NUL")]
    InvalidGroupName { name: String },

    #[error("{field} shape {shape} does not fit in memory for {dtype}")]
    InvalidShape {
        field: &'static str,
        shape: String,
        dtype: DataType,
    },

    #[error("graph node or its descriptor is null")]
    NullNode,

    #[error("prepare stage for node '{node}' produced no outputs")]
    PrepareEmpty { node: String },

    #[error("{collaborator} failed for node '{node}': {reason}")]
    Host {
        collaborator: &'static str,
        node: String,
        reason: String,
    },

    #[error("malformed plan fragment: {0}")]
    MalformedPlan(String),

    #[error("launch args mismatch: {what} expected {expected}, got {actual}")]
    ArgumentMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("alignment {alignment} is not a non-zero power of two")]
    InvalidAlignment { alignment: usize },

    #[error("input {input} carries {count} elements but a batch holds at most {capacity}")]
    SliceExceedsScratch {
        input: usize,
        count: usize,
        capacity: usize,
    },

    #[error("count tensor at input {input} holds invalid entry {value}")]
    InvalidCount { input: usize, value: i64 },

    #[error("scratch buffer for group '{group}' is already in use")]
    ScratchBusy { group: String },

    #[error("{operation} failed in batch {batch}: {reason}")]
    BatchFailed {
        operation: &'static str,
        batch: usize,
        reason: String,
    },

    #[error("size negotiation with rank {src} failed: {reason}")]
    NegotiationFailed { src: Rank, reason: String },

    #[error("peer announced {actual} elements but the output holds {expected}")]
    ReceiveOverflow { expected: usize, actual: usize },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("argument blob encode failed: {0}")]
    EncodeFailed(String),

    #[error("argument blob decode failed: {0}")]
    DecodeFailed(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl LowerError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Host` error for a failing framework collaborator.
    pub fn host(
        collaborator: &'static str,
        node: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Host {
            collaborator,
            node: node.into(),
            reason: reason.into(),
        }
    }
}
