use crate::config::GROUP_NAME_CAPACITY;
use crate::error::{LowerError, Result};

/// Communication group name in a fixed, null-terminated buffer.
///
/// Names that do not fit together with their terminator are rejected, never
/// truncated.
#[derive(Clone, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct GroupName {
    bytes: [u8; GROUP_NAME_CAPACITY],
}

impl GroupName {
    /// Copy `name` into the fixed buffer.
    pub fn new(name: &str) -> Result<Self> {
        let src = name.as_bytes();
        let required = src.len() + 1;
        if required > GROUP_NAME_CAPACITY {
            return Err(LowerError::BufferOverflow {
                field: "group name",
                capacity: GROUP_NAME_CAPACITY,
                required,
            });
        }
        if src.contains(&0) {
            return Err(LowerError::InvalidGroupName {
                name: name.to_string(),
            });
        }
        let mut bytes = [0u8; GROUP_NAME_CAPACITY];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self { bytes })
    }

    pub fn as_str(&self) -> &str {
        let len = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(GROUP_NAME_CAPACITY);
        // Only constructed from a `&str`, so the prefix is valid UTF-8.
        std::str::from_utf8(&self.bytes[..len]).unwrap_or_default()
    }

    /// Raw buffer including terminator and padding.
    pub fn as_bytes(&self) -> &[u8; GROUP_NAME_CAPACITY] {
        &self.bytes
    }
}

impl std::fmt::Debug for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupName({:?})", self.as_str())
    }
}

impl std::fmt::Display for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
