use crate::attrs::CollectiveAttributes;
use crate::backend::StreamHandle;
use crate::error::{LowerError, Result};
use crate::plan::ArgsBlob;
use crate::types::{DataType, Shape};

/// Run-time arguments of one kernel invocation.
///
/// Address and shape lists always agree with the declared input and output
/// counts, and every shape's byte size fits in `usize`; construction rejects
/// anything else.
#[derive(Debug, Clone)]
pub struct LaunchArgs {
    attrs: CollectiveAttributes,
    stream: StreamHandle,
    input_num: usize,
    output_num: usize,
    input_addrs: Vec<u64>,
    output_addrs: Vec<u64>,
    input_shapes: Vec<Shape>,
    output_shapes: Vec<Shape>,
    input_counts: Vec<usize>,
    output_counts: Vec<usize>,
}

impl LaunchArgs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attrs: CollectiveAttributes,
        stream: StreamHandle,
        input_num: usize,
        output_num: usize,
        input_addrs: Vec<u64>,
        output_addrs: Vec<u64>,
        input_shapes: Vec<Shape>,
        output_shapes: Vec<Shape>,
    ) -> Result<Self> {
        check("input addresses", input_num, input_addrs.len())?;
        check("output addresses", output_num, output_addrs.len())?;
        check("input shapes", input_num, input_shapes.len())?;
        check("output shapes", output_num, output_shapes.len())?;
        let input_counts = element_counts("input", &input_shapes, attrs.dtype)?;
        let output_counts = element_counts("output", &output_shapes, attrs.dtype)?;
        Ok(Self {
            attrs,
            stream,
            input_num,
            output_num,
            input_addrs,
            output_addrs,
            input_shapes,
            output_shapes,
            input_counts,
            output_counts,
        })
    }

    /// Rebuild the arguments from the constant blob a prepare node carries.
    /// Counts are taken from the shape lists.
    pub fn from_blob(
        blob: &ArgsBlob,
        stream: StreamHandle,
        input_addrs: Vec<u64>,
        output_addrs: Vec<u64>,
        input_shapes: Vec<Shape>,
        output_shapes: Vec<Shape>,
    ) -> Result<Self> {
        let attrs = blob.decode()?;
        Self::new(
            attrs,
            stream,
            input_shapes.len(),
            output_shapes.len(),
            input_addrs,
            output_addrs,
            input_shapes,
            output_shapes,
        )
    }

    pub fn attrs(&self) -> &CollectiveAttributes {
        &self.attrs
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn input_num(&self) -> usize {
        self.input_num
    }

    pub fn output_num(&self) -> usize {
        self.output_num
    }

    pub fn input_addrs(&self) -> &[u64] {
        &self.input_addrs
    }

    pub fn output_addrs(&self) -> &[u64] {
        &self.output_addrs
    }

    pub fn input_shapes(&self) -> &[Shape] {
        &self.input_shapes
    }

    pub fn output_shapes(&self) -> &[Shape] {
        &self.output_shapes
    }

    /// Element count of every input, from its declared shape.
    pub fn input_counts(&self) -> Vec<usize> {
        self.input_counts.clone()
    }

    pub fn output_counts(&self) -> Vec<usize> {
        self.output_counts.clone()
    }
}

fn element_counts(field: &'static str, shapes: &[Shape], dtype: DataType) -> Result<Vec<usize>> {
    shapes
        .iter()
        .map(|shape| {
            shape
                .num_elements()
                .filter(|n| n.checked_mul(dtype.size_in_bytes()).is_some())
                .ok_or_else(|| LowerError::InvalidShape {
                    field,
                    shape: shape.to_string(),
                    dtype,
                })
        })
        .collect()
}

fn check(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(LowerError::ArgumentMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
