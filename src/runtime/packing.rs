//! Scratch-buffer geometry and greedy batch packing.
//!
//! Logical inputs are streamed into the scratch buffer in order. A batch is
//! closed when it reaches the per-batch capacity, and an input that straddles
//! the boundary continues at the start of the next batch, so `N` elements
//! always need exactly `ceil(N / C)` batches.

use crate::error::{LowerError, Result};
use crate::types::DataType;

/// Round `value` up to a multiple of `alignment`, a power of two.
#[inline]
pub const fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment`, a power of two.
#[inline]
pub const fn floor_align(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Per-batch layout of the scratch buffer for one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    elem_size: usize,
    alignment: usize,
    /// Elements each part may carry per batch.
    capacity: usize,
}

impl Geometry {
    /// Split `scratch_bytes` into `parts` aligned per-rank slots.
    pub fn new(
        scratch_bytes: usize,
        alignment: usize,
        dtype: DataType,
        parts: usize,
    ) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(LowerError::InvalidAlignment { alignment });
        }
        let elem_size = dtype.size_in_bytes();
        let slot = floor_align(scratch_bytes / parts.max(1), alignment);
        Ok(Self {
            elem_size,
            alignment,
            capacity: slot / elem_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Distance between consecutive per-rank slots for a batch of `count`.
    pub fn stride_bytes(&self, count: usize) -> usize {
        round_up(count * self.elem_size, self.alignment)
    }
}

/// A contiguous run of one logical input carried by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub input: usize,
    /// Element offset within the input.
    pub offset: usize,
    pub count: usize,
    /// Element offset within the batch.
    pub batch_offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub slices: Vec<Slice>,
}

impl Batch {
    /// Elements carried by this batch.
    pub fn count(&self) -> usize {
        self.slices.iter().map(|s| s.count).sum()
    }

    /// Logical inputs contributing to this batch, in order.
    pub fn slice_idxs(&self) -> impl Iterator<Item = usize> + '_ {
        self.slices.iter().map(|s| s.input)
    }
}

/// Greedily pack `counts` into batches of at most `capacity` elements.
///
/// Zero counts contribute nothing. An input larger than a whole batch is
/// rejected with `SliceExceedsScratch` rather than truncated.
pub fn pack(counts: &[usize], capacity: usize) -> Result<Vec<Batch>> {
    let mut batches = Vec::new();
    let mut current = Batch::default();
    let mut used = 0;

    for (input, &count) in counts.iter().enumerate() {
        if count > capacity {
            tracing::warn!(input, count, capacity, "input does not fit a scratch batch");
            return Err(LowerError::SliceExceedsScratch {
                input,
                count,
                capacity,
            });
        }
        let mut offset = 0;
        while offset < count {
            if used == capacity {
                batches.push(std::mem::take(&mut current));
                used = 0;
            }
            let take = (count - offset).min(capacity - used);
            current.slices.push(Slice {
                input,
                offset,
                count: take,
                batch_offset: used,
            });
            used += take;
            offset += take;
        }
    }
    if !current.slices.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Number of rounds needed to move `total` elements `capacity` at a time.
pub fn rounds(total: usize, capacity: usize) -> usize {
    if total == 0 {
        0
    } else {
        total.div_ceil(capacity.max(1))
    }
}

/// Elements of a `total`-element segment moved in `round`.
pub fn round_chunk(total: usize, round: usize, capacity: usize) -> usize {
    total.saturating_sub(round * capacity).min(capacity)
}
