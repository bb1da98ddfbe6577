//! The slice of the host graph framework that lowering consumes.
//!
//! Nodes and their descriptors are owned by the host compiler; shape
//! inference, size computation and output allocation are delegated back to
//! it through [`LoweringHost`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LowerError, Result};
use crate::plan::ExternalValue;
use crate::types::{DataType, Placement, Shape};

/// A declared node property.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    Bool(bool),
    DType(DataType),
}

/// Declared element type and shape of one node input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub dtype: DataType,
    pub shape: Shape,
}

impl TensorDesc {
    pub fn new(dtype: DataType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }
}

/// Operator descriptor of a graph node.
#[derive(Debug, Clone, Default)]
pub struct NodeDesc {
    pub name: String,
    pub op_type: String,
    pub attrs: HashMap<String, AttrValue>,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

impl NodeDesc {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn with_input(mut self, desc: TensorDesc) -> Self {
        self.inputs.push(desc);
        self
    }

    pub fn with_output(mut self, desc: TensorDesc) -> Self {
        self.outputs.push(desc);
        self
    }

    /// Read a required integer attribute.
    pub fn int_attr(&self, attr: &'static str) -> Result<i64> {
        match self.attrs.get(attr) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(_) => Err(self.wrong_type(attr, "integer")),
            None => Err(self.missing(attr)),
        }
    }

    /// Read an integer attribute that must fit in `u32`.
    pub fn u32_attr(&self, attr: &'static str) -> Result<u32> {
        let v = self.int_attr(attr)?;
        u32::try_from(v).map_err(|_| self.wrong_type(attr, "non-negative 32-bit integer"))
    }

    /// Read an optional `u32` attribute.
    pub fn opt_u32_attr(&self, attr: &'static str) -> Result<Option<u32>> {
        if self.attrs.contains_key(attr) {
            self.u32_attr(attr).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read a required string attribute.
    pub fn str_attr(&self, attr: &'static str) -> Result<&str> {
        match self.attrs.get(attr) {
            Some(AttrValue::Str(s)) => Ok(s),
            Some(_) => Err(self.wrong_type(attr, "string")),
            None => Err(self.missing(attr)),
        }
    }

    pub(crate) fn missing(&self, attr: &'static str) -> LowerError {
        LowerError::AttributeMissing {
            node: self.name.clone(),
            attr,
        }
    }

    pub(crate) fn wrong_type(&self, attr: &'static str, expected: &'static str) -> LowerError {
        LowerError::AttributeType {
            node: self.name.clone(),
            attr,
            expected,
        }
    }
}

/// Identity of a node in the host graph.
pub type NodeId = u64;

/// A node as handed over by the dispatch glue. The descriptor may be absent
/// on malformed graphs.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub desc: Option<Arc<NodeDesc>>,
}

impl GraphNode {
    pub fn new(id: NodeId, desc: NodeDesc) -> Self {
        Self {
            id,
            desc: Some(Arc::new(desc)),
        }
    }
}

/// Collaborators provided by the host graph compiler.
pub trait LoweringHost {
    /// Infer output shapes from the node and its input shapes.
    fn infer_shape(&self, node: &NodeDesc, input_shapes: &[Shape]) -> Result<Vec<Shape>>;

    /// Byte size of each tensor the node produces for the given shapes.
    fn calc_tensor_size(&self, node: &NodeDesc, shapes: &[Shape]) -> Result<Vec<u64>>;

    /// Allocate one output buffer per entry of `byte_sizes` and return the
    /// handles of their addresses.
    fn allocate_output(
        &mut self,
        placement: Placement,
        node: &NodeDesc,
        byte_sizes: &[u64],
    ) -> Result<Vec<ExternalValue>>;
}
