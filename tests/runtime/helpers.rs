use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ccl_lower::{
    CollectiveAttributes, CollectiveOp, CommBackend, DataType, Executor, GroupName, HostGroup,
    LaunchArgs, LowerConfig, LowerError, Rank, ReduceOp, Result, ScratchPool, Shape,
    StreamHandle,
};

/// One rank's view in a multi-threaded test group.
pub struct RankCtx<B: CommBackend + 'static = HostGroup> {
    pub backend: Arc<B>,
    pub pool: ScratchPool,
}

impl<B: CommBackend + 'static> RankCtx<B> {
    pub fn rank(&self) -> usize {
        self.backend.rank() as usize
    }

    pub fn execute(&self, args: &LaunchArgs) -> Result<()> {
        // SAFETY: every address in `args` points into a live Vec owned by the
        // calling test for the duration of the call.
        unsafe { Executor::new(&self.pool).execute(args) }
    }
}

/// Small scratch so that modest tensors span several batches.
pub fn small_config(scratch_bytes: usize) -> LowerConfig {
    LowerConfig {
        scratch_bytes,
        alignment: 16,
    }
}

/// Run `f` on `world` ranks, one thread each, and collect per-rank results
/// in rank order.
pub fn run_ranks<T, F>(world: u32, config: LowerConfig, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RankCtx) -> T + Sync,
{
    run_ranks_with(world, config, Arc::new, f)
}

/// Like [`run_ranks`] with each rank's backend wrapped by `wrap`.
pub fn run_ranks_with<B, T, W, F>(world: u32, config: LowerConfig, wrap: W, f: F) -> Vec<T>
where
    B: CommBackend + 'static,
    T: Send,
    W: Fn(HostGroup) -> Arc<B> + Sync,
    F: Fn(&RankCtx<B>) -> T + Sync,
{
    let groups = HostGroup::create(world);
    std::thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let (wrap, f, config) = (&wrap, &f, config.clone());
                s.spawn(move || {
                    let backend = wrap(group);
                    let shared: Arc<dyn CommBackend> = backend.clone();
                    let pool = ScratchPool::new(shared, config).unwrap();
                    f(&RankCtx { backend, pool })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

pub fn attrs(op: CollectiveOp, dtype: DataType) -> CollectiveAttributes {
    CollectiveAttributes {
        op,
        dtype,
        core_limit: 0,
        group: GroupName::new("world").unwrap(),
    }
}

pub fn ptr<T>(v: &[T]) -> u64 {
    v.as_ptr() as u64
}

pub fn ptr_mut<T>(v: &mut [T]) -> u64 {
    v.as_mut_ptr() as u64
}

pub fn shape(count: usize) -> Shape {
    Shape::from([count as u64])
}

/// Launch arguments over flat `(address, element count)` tensors.
pub fn launch(attrs: CollectiveAttributes, ins: &[(u64, usize)], outs: &[(u64, usize)]) -> LaunchArgs {
    LaunchArgs::new(
        attrs,
        StreamHandle(0),
        ins.len(),
        outs.len(),
        ins.iter().map(|&(a, _)| a).collect(),
        outs.iter().map(|&(a, _)| a).collect(),
        ins.iter().map(|&(_, n)| shape(n)).collect(),
        outs.iter().map(|&(_, n)| shape(n)).collect(),
    )
    .unwrap()
}

pub fn sum() -> CollectiveOp {
    CollectiveOp::AllReduce { op: ReduceOp::Sum }
}

/// Element `i` of rank `rank`'s sample tensor.
pub fn sample(rank: usize, i: usize) -> f32 {
    (rank * 1000 + i) as f32
}

/// Delegates to a [`HostGroup`], failing the `fail_at`-th all-reduce call
/// (0-based) without reaching the group.
pub struct FailingBackend {
    inner: HostGroup,
    fail_at: usize,
    pub all_reduce_calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new(inner: HostGroup, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            all_reduce_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.all_reduce_calls.load(Ordering::SeqCst)
    }
}

impl CommBackend for FailingBackend {
    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    unsafe fn memcpy(&self, dst: u64, src: u64, bytes: usize, stream: StreamHandle) -> Result<()> {
        unsafe { self.inner.memcpy(dst, src, bytes, stream) }
    }

    unsafe fn copy_to_host(&self, src: u64, dst: &mut [u8], stream: StreamHandle) -> Result<()> {
        unsafe { self.inner.copy_to_host(src, dst, stream) }
    }

    unsafe fn copy_from_host(&self, src: &[u8], dst: u64, stream: StreamHandle) -> Result<()> {
        unsafe { self.inner.copy_from_host(src, dst, stream) }
    }

    fn synchronize(&self, stream: StreamHandle) -> Result<()> {
        self.inner.synchronize(stream)
    }

    fn alloc(&self, bytes: usize) -> Result<u64> {
        self.inner.alloc(bytes)
    }

    unsafe fn free(&self, ptr: u64) -> Result<()> {
        unsafe { self.inner.free(ptr) }
    }

    unsafe fn all_reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> Result<()> {
        let call = self.all_reduce_calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_at {
            return Err(LowerError::device("injected all_reduce failure"));
        }
        unsafe { self.inner.all_reduce(send, recv, count, dtype, op, stream) }
    }

    unsafe fn all_gather(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        stride_bytes: usize,
        dtype: DataType,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            self.inner
                .all_gather(send, recv, count, stride_bytes, dtype, stream)
        }
    }

    unsafe fn reduce_scatter(
        &self,
        send: u64,
        stride_bytes: usize,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            self.inner
                .reduce_scatter(send, stride_bytes, recv, count, dtype, op, stream)
        }
    }

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
    ) -> Result<()> {
        unsafe {
            self.inner.all_to_all_v(
                send,
                send_counts,
                send_displs,
                recv,
                recv_counts,
                recv_displs,
                dtype,
                stream,
            )
        }
    }

    unsafe fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe { self.inner.broadcast(ptr, count, dtype, root, stream) }
    }

    unsafe fn reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe { self.inner.reduce(send, recv, count, dtype, op, root, stream) }
    }

    unsafe fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        dest: Rank,
        tag: u32,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe { self.inner.send(ptr, count, dtype, dest, tag, stream) }
    }

    unsafe fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        src: Rank,
        tag: u32,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe { self.inner.recv(ptr, count, dtype, src, tag, stream) }
    }
}
