//! Device runtime and communication primitives consumed by the executor.
//!
//! Addresses are raw `u64` device pointers, matching the handle model of the
//! lowered plan. Copies and collectives are issued on a caller-supplied
//! stream and ordered by submission.
//!
//! - [`HostGroup`] (built-in): in-process ranks over host memory.
//! - `NcclBackend` (feature `cuda`): NCCL communicator on a CUDA stream.

mod host;
#[cfg(feature = "cuda")]
mod nccl;

pub use host::HostGroup;
#[cfg(feature = "cuda")]
pub use nccl::NcclBackend;

use crate::error::Result;
use crate::types::{DataType, Rank, ReduceOp};

/// Device stream a call is issued on. `0` is the default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

/// Stream-ordered memory and collective primitives of one rank.
///
/// Every collective must be entered by all ranks of the group with matching
/// arguments, in the same order.
pub trait CommBackend: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// Device-to-device copy.
    ///
    /// # Safety
    /// `src` and `dst` must be valid for `bytes` bytes.
    unsafe fn memcpy(&self, dst: u64, src: u64, bytes: usize, stream: StreamHandle)
    -> Result<()>;

    /// Copy device memory into a host buffer, blocking until it lands.
    ///
    /// # Safety
    /// `src` must be valid for `dst.len()` bytes.
    unsafe fn copy_to_host(&self, src: u64, dst: &mut [u8], stream: StreamHandle) -> Result<()>;

    /// Copy a host buffer into device memory.
    ///
    /// # Safety
    /// `dst` must be valid for `src.len()` bytes.
    unsafe fn copy_from_host(&self, src: &[u8], dst: u64, stream: StreamHandle) -> Result<()>;

    /// Block until all work on `stream` has completed.
    fn synchronize(&self, stream: StreamHandle) -> Result<()>;

    /// Allocate `bytes` of zeroed device memory.
    fn alloc(&self, bytes: usize) -> Result<u64>;

    /// Release memory obtained from [`CommBackend::alloc`].
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this backend and not be freed twice.
    unsafe fn free(&self, ptr: u64) -> Result<()>;

    /// # Safety
    /// Both pointers must be valid for `count * dtype.size_in_bytes()` bytes.
    #[allow(clippy::too_many_arguments)]
    unsafe fn all_reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Every rank contributes `count` elements; rank `r`'s contribution lands
    /// at `recv + r * stride_bytes`.
    ///
    /// # Safety
    /// `send` holds `count` elements, `recv` spans `world_size * stride_bytes`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn all_gather(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        stride_bytes: usize,
        dtype: DataType,
        stream: StreamHandle,
    ) -> Result<()>;

    /// The part destined for rank `r` is read at `send + r * stride_bytes`;
    /// this rank's reduced `count` elements land at `recv`.
    ///
    /// # Safety
    /// `send` spans `world_size * stride_bytes`, `recv` holds `count` elements.
    #[allow(clippy::too_many_arguments)]
    unsafe fn reduce_scatter(
        &self,
        send: u64,
        stride_bytes: usize,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Personalised exchange. Counts and displacements are in elements and
    /// indexed by peer rank.
    ///
    /// # Safety
    /// Every displaced segment must lie inside its buffer.
    #[allow(clippy::too_many_arguments)]
    unsafe fn all_to_all_v(
        &self,
        send: u64,
        send_counts: &[usize],
        send_displs: &[usize],
        recv: u64,
        recv_counts: &[usize],
        recv_displs: &[usize],
        dtype: DataType,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Exchange driven by the full `world_size x world_size` count matrix,
    /// where `matrix[i * n + j]` elements travel from rank `i` to rank `j`.
    /// Segments are packed contiguously in rank order on both sides.
    ///
    /// # Safety
    /// `send` and `recv` must hold this rank's row and column sums.
    unsafe fn all_to_all_vc(
        &self,
        send: u64,
        recv: u64,
        matrix: &[usize],
        dtype: DataType,
        stream: StreamHandle,
    ) -> Result<()> {
        let n = self.world_size() as usize;
        let me = self.rank() as usize;
        let send_counts: Vec<usize> = (0..n).map(|j| matrix[me * n + j]).collect();
        let recv_counts: Vec<usize> = (0..n).map(|i| matrix[i * n + me]).collect();
        let send_displs = exclusive_prefix_sum(&send_counts);
        let recv_displs = exclusive_prefix_sum(&recv_counts);
        unsafe {
            self.all_to_all_v(
                send,
                &send_counts,
                &send_displs,
                recv,
                &recv_counts,
                &recv_displs,
                dtype,
                stream,
            )
        }
    }

    /// In-place broadcast from `root`.
    ///
    /// # Safety
    /// `ptr` must be valid for `count * dtype.size_in_bytes()` bytes.
    unsafe fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Reduce to `root`; `recv` is only written on the root.
    ///
    /// # Safety
    /// Both pointers must be valid for `count * dtype.size_in_bytes()` bytes.
    #[allow(clippy::too_many_arguments)]
    unsafe fn reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()>;

    /// # Safety
    /// `ptr` must be valid for `count * dtype.size_in_bytes()` bytes.
    unsafe fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        dest: Rank,
        tag: u32,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Receive exactly `count` elements from `src`.
    ///
    /// # Safety
    /// `ptr` must be valid for `count * dtype.size_in_bytes()` bytes.
    unsafe fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        src: Rank,
        tag: u32,
        stream: StreamHandle,
    ) -> Result<()>;
}

/// `[a, b, c] -> [0, a, a + b]`.
pub(crate) fn exclusive_prefix_sum(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0usize, |acc, &c| {
            let start = *acc;
            *acc = acc.saturating_add(c);
            Some(start)
        })
        .collect()
}
