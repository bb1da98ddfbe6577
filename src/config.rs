//! Runtime-configurable parameters for lowering and buffer packing.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `CCL_LOWER_`) or by constructing a custom `LowerConfig`.

use crate::error::{LowerError, Result};

/// Fixed capacity of the group-name field, terminator included.
pub const GROUP_NAME_CAPACITY: usize = 128;

/// Bytes of the negotiated element count exchanged ahead of a receive.
pub const NEGOTIATION_BYTES: usize = std::mem::size_of::<u64>();

/// Tuning parameters for the scratch buffer and its batching geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerConfig {
    /// Capacity of each scratch region (input and output) in bytes.
    pub scratch_bytes: usize,

    /// Transfer granularity that per-rank strides are rounded up to.
    /// Must be a non-zero power of two.
    pub alignment: usize,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            scratch_bytes: 200 * 1024 * 1024, // 200 MiB
            alignment: 512,
        }
    }
}

impl LowerConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `CCL_LOWER_SCRATCH_BYTES`
    /// - `CCL_LOWER_ALIGNMENT`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CCL_LOWER_SCRATCH_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.scratch_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("CCL_LOWER_ALIGNMENT") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.alignment = n;
            }
        }

        cfg
    }

    /// Reject geometry the packing layer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(LowerError::InvalidAlignment {
                alignment: self.alignment,
            });
        }
        if self.scratch_bytes < self.alignment {
            return Err(LowerError::BufferOverflow {
                field: "scratch region",
                capacity: self.scratch_bytes,
                required: self.alignment,
            });
        }
        Ok(())
    }
}
