use crate::attrs::CollectiveOp;
use crate::backend::{CommBackend, StreamHandle};
use crate::error::{LowerError, Result};
use crate::runtime::args::LaunchArgs;
use crate::runtime::packing::Geometry;
use crate::runtime::scratch::{ScratchGuard, ScratchPool};
use crate::runtime::{batched, direct, varying};
use crate::types::DataType;

/// Runs launched collective kernels against a scratch pool and its backend.
pub struct Executor<'p> {
    pool: &'p ScratchPool,
}

impl<'p> Executor<'p> {
    pub fn new(pool: &'p ScratchPool) -> Self {
        Self { pool }
    }

    /// Execute one kernel invocation, blocking until it completes.
    ///
    /// Batched kinds hold the group's scratch buffer for the whole call and
    /// stop at the first failing batch; batches already applied stay applied.
    ///
    /// # Safety
    /// Every address in `args` must be valid for its shape and element type,
    /// and all producers of the inputs must have completed.
    pub unsafe fn execute(&self, args: &LaunchArgs) -> Result<()> {
        let attrs = args.attrs();
        let kind = attrs.kind();
        let backend = self.pool.backend().as_ref();
        let call = Call {
            backend,
            stream: args.stream(),
            dtype: attrs.dtype,
            elem: attrs.dtype.size_in_bytes(),
            args,
        };

        let result = if kind.is_batched() {
            self.pool
                .checkout(attrs.group.as_str())
                .and_then(|scratch| unsafe { self.run_batched(&call, &scratch) })
        } else {
            unsafe { run_direct(&call) }
        };
        let result = result.and_then(|()| backend.synchronize(call.stream));

        match &result {
            Ok(()) => tracing::debug!(%kind, group = %attrs.group, "collective complete"),
            Err(e) => tracing::warn!(%kind, group = %attrs.group, "collective failed: {e}"),
        }
        result
    }

    unsafe fn run_batched(&self, call: &Call<'_>, scratch: &ScratchGuard<'_>) -> Result<()> {
        let cfg = self.pool.config();
        let world = call.backend.world_size() as usize;
        let geometry = |parts: usize| Geometry::new(scratch.bytes(), cfg.alignment, call.dtype, parts);
        unsafe {
            match call.args.attrs().op {
                CollectiveOp::AllReduce { op } => {
                    batched::all_reduce(call, scratch, &geometry(1)?, op)
                }
                CollectiveOp::AllGather { rank_size } => {
                    call.check_rank_size(rank_size)?;
                    batched::all_gather(call, scratch, &geometry(world)?)
                }
                CollectiveOp::ReduceScatter { op, rank_size } => {
                    call.check_rank_size(rank_size)?;
                    batched::reduce_scatter(call, scratch, &geometry(world)?, op)
                }
                CollectiveOp::AllToAll { recv_dtype } => {
                    call.check_recv_dtype(recv_dtype)?;
                    batched::all_to_all(call, scratch, &geometry(world)?)
                }
                CollectiveOp::AllGatherV { rank_size } => {
                    call.check_rank_size(rank_size)?;
                    varying::all_gather_v(call, scratch, &geometry(world)?)
                }
                CollectiveOp::ReduceScatterV { op, rank_size } => {
                    call.check_rank_size(rank_size)?;
                    varying::reduce_scatter_v(call, scratch, &geometry(world)?, op)
                }
                CollectiveOp::AllToAllV { recv_dtype } => {
                    call.check_recv_dtype(recv_dtype)?;
                    varying::all_to_all_v(call, scratch, &geometry(world)?)
                }
                CollectiveOp::AllToAllVC { recv_dtype } => {
                    call.check_recv_dtype(recv_dtype)?;
                    varying::all_to_all_vc(call, scratch, &geometry(world)?)
                }
                CollectiveOp::Broadcast { .. }
                | CollectiveOp::Reduce { .. }
                | CollectiveOp::Send { .. }
                | CollectiveOp::Receive { .. } => run_direct(call),
            }
        }
    }
}

unsafe fn run_direct(call: &Call<'_>) -> Result<()> {
    unsafe {
        match call.args.attrs().op {
            CollectiveOp::Broadcast { root } => direct::broadcast(call, root),
            CollectiveOp::Reduce { root, op } => direct::reduce(call, root, op),
            CollectiveOp::Send { dest_rank, tag } => direct::send(call, dest_rank, tag),
            CollectiveOp::Receive { src_rank, tag } => direct::receive(call, src_rank, tag),
            _ => Err(LowerError::UnsupportedOperation {
                op_type: call.args.attrs().kind().type_name().to_string(),
            }),
        }
    }
}

/// Per-invocation state shared by the kind implementations.
pub(crate) struct Call<'a> {
    pub backend: &'a dyn CommBackend,
    pub stream: StreamHandle,
    pub dtype: DataType,
    pub elem: usize,
    pub args: &'a LaunchArgs,
}

impl Call<'_> {
    /// Address of element `index` of the buffer at `base`.
    ///
    /// Callers only pass indices already checked against a validated shape
    /// or the scratch geometry.
    pub fn at(&self, base: u64, index: usize) -> u64 {
        base + (index * self.elem) as u64
    }

    /// Stream-ordered copy of `count` elements.
    ///
    /// # Safety
    /// Both ranges must be valid.
    pub unsafe fn copy(&self, dst: u64, src: u64, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        tracing::trace!(dst, src, count, "staging copy");
        unsafe {
            self.backend
                .memcpy(dst, src, count * self.elem, self.stream)
        }
    }

    pub fn require_inputs(&self, expected: usize) -> Result<()> {
        require("inputs", expected, self.args.input_num())
    }

    pub fn require_outputs(&self, expected: usize) -> Result<()> {
        require("outputs", expected, self.args.output_num())
    }

    fn check_rank_size(&self, rank_size: u32) -> Result<()> {
        require(
            "rank size",
            self.backend.world_size() as usize,
            rank_size as usize,
        )
    }

    fn check_recv_dtype(&self, recv_dtype: DataType) -> Result<()> {
        require(
            "receive element bytes",
            self.elem,
            recv_dtype.size_in_bytes(),
        )
    }

    /// Read a host-visible i64 count tensor with one entry per rank.
    ///
    /// # Safety
    /// The input's address must be valid for its shape.
    pub unsafe fn read_counts(&self, input: usize, entries: usize) -> Result<Vec<usize>> {
        let n = self.args.input_counts()[input];
        require("count entries", entries, n)?;
        let mut raw = vec![0u8; n * std::mem::size_of::<i64>()];
        unsafe {
            self.backend
                .copy_to_host(self.args.input_addrs()[input], &mut raw, self.stream)?;
        }
        raw.chunks_exact(std::mem::size_of::<i64>())
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                let value = i64::from_ne_bytes(word);
                usize::try_from(value).map_err(|_| LowerError::InvalidCount { input, value })
            })
            .collect()
    }
}

pub(crate) fn require(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(LowerError::ArgumentMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Run one batch, turning its failure into `BatchFailed`.
pub(crate) fn batch(
    operation: &'static str,
    index: usize,
    body: impl FnOnce() -> Result<()>,
) -> Result<()> {
    body().map_err(|e| {
        tracing::warn!(operation, batch = index, "batch failed, skipping the rest: {e}");
        LowerError::BatchFailed {
            operation,
            batch: index,
            reason: e.to_string(),
        }
    })
}
