use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use crate::backend::{CommBackend, StreamHandle};
use crate::error::{LowerError, Result};
use crate::types::{DataType, Rank, ReduceOp};

type MailKey = (Rank, Rank, u32);

/// State shared by all ranks of one in-process group.
struct Shared {
    world: u32,
    barrier: Barrier,
    /// Per-rank contribution to the collective in flight, one part per peer.
    slots: Mutex<Vec<Vec<Vec<u8>>>>,
    /// Point-to-point messages keyed by (src, dst, tag).
    mail: Mutex<HashMap<MailKey, VecDeque<Vec<u8>>>>,
    mail_ready: Condvar,
}

/// One rank of an in-process communication group over host memory.
///
/// Ranks are meant to be driven from separate threads; collectives meet at a
/// barrier, exchange their contributions, and meet again before any slot is
/// reused. "Device" memory is plain host memory, and streams are ignored
/// because every call completes before returning.
pub struct HostGroup {
    rank: Rank,
    shared: Arc<Shared>,
    allocations: Mutex<HashMap<u64, Box<[u64]>>>,
}

impl HostGroup {
    /// Create all ranks of a group of `world_size` participants.
    pub fn create(world_size: u32) -> Vec<HostGroup> {
        let shared = Arc::new(Shared {
            world: world_size,
            barrier: Barrier::new(world_size as usize),
            slots: Mutex::new(vec![Vec::new(); world_size as usize]),
            mail: Mutex::new(HashMap::new()),
            mail_ready: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| HostGroup {
                rank,
                shared: Arc::clone(&shared),
                allocations: Mutex::new(HashMap::new()),
            })
            .collect()
    }

    /// Publish this rank's parts and return every rank's parts, indexed by
    /// contributing rank.
    fn exchange(&self, parts: Vec<Vec<u8>>) -> Result<Vec<Vec<Vec<u8>>>> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| LowerError::LockPoisoned("host group slots"))?;
            slots[self.rank as usize] = parts;
        }
        self.shared.barrier.wait();
        let all = self
            .shared
            .slots
            .lock()
            .map_err(|_| LowerError::LockPoisoned("host group slots"))?
            .clone();
        self.shared.barrier.wait();
        Ok(all)
    }

    /// Buffers allocated through this rank and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().map_or(0, |a| a.len())
    }

    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.shared.world {
            return Err(LowerError::device(format!(
                "root rank {root} outside group of {}",
                self.shared.world
            )));
        }
        Ok(())
    }

    fn check_per_peer(&self, what: &'static str, len: usize) -> Result<()> {
        let expected = self.shared.world as usize;
        if len != expected {
            return Err(LowerError::ArgumentMismatch {
                what,
                expected,
                actual: len,
            });
        }
        Ok(())
    }
}

impl CommBackend for HostGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.shared.world
    }

    unsafe fn memcpy(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        _stream: StreamHandle,
    ) -> Result<()> {
        if bytes > 0 {
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        }
        Ok(())
    }

    unsafe fn copy_to_host(&self, src: u64, dst: &mut [u8], _stream: StreamHandle) -> Result<()> {
        if !dst.is_empty() {
            dst.copy_from_slice(unsafe { read(src, dst.len()) }.as_slice());
        }
        Ok(())
    }

    unsafe fn copy_from_host(&self, src: &[u8], dst: u64, _stream: StreamHandle) -> Result<()> {
        unsafe { write(dst, src) };
        Ok(())
    }

    fn synchronize(&self, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> Result<u64> {
        // u64 words keep every element type naturally aligned.
        let mut block = vec![0u64; bytes.div_ceil(8).max(1)].into_boxed_slice();
        let ptr = block.as_mut_ptr() as u64;
        self.allocations
            .lock()
            .map_err(|_| LowerError::LockPoisoned("host allocations"))?
            .insert(ptr, block);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: u64) -> Result<()> {
        self.allocations
            .lock()
            .map_err(|_| LowerError::LockPoisoned("host allocations"))?
            .remove(&ptr)
            .map(drop)
            .ok_or_else(|| LowerError::device(format!("free of unknown pointer {ptr:#x}")))
    }

    unsafe fn all_reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        _stream: StreamHandle,
    ) -> Result<()> {
        check_reducible(dtype, "all_reduce")?;
        let bytes = count * dtype.size_in_bytes();
        let all = self.exchange(vec![unsafe { read(send, bytes) }])?;
        let acc = fold(all.iter().map(|parts| parts[0].as_slice()), dtype, op)?;
        unsafe { write(recv, &acc) };
        tracing::trace!(rank = self.rank, count, %dtype, "host all_reduce");
        Ok(())
    }

    unsafe fn all_gather(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        stride_bytes: usize,
        dtype: DataType,
        _stream: StreamHandle,
    ) -> Result<()> {
        let bytes = count * dtype.size_in_bytes();
        let all = self.exchange(vec![unsafe { read(send, bytes) }])?;
        for (r, parts) in all.iter().enumerate() {
            unsafe { write(recv + (r * stride_bytes) as u64, &parts[0]) };
        }
        tracing::trace!(rank = self.rank, count, %dtype, "host all_gather");
        Ok(())
    }

    unsafe fn reduce_scatter(
        &self,
        send: u64,
        stride_bytes: usize,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        _stream: StreamHandle,
    ) -> Result<()> {
        check_reducible(dtype, "reduce_scatter")?;
        let bytes = count * dtype.size_in_bytes();
        let parts = (0..self.shared.world as usize)
            .map(|r| unsafe { read(send + (r * stride_bytes) as u64, bytes) })
            .collect();
        let all = self.exchange(parts)?;
        let me = self.rank as usize;
        let acc = fold(all.iter().map(|parts| parts[me].as_slice()), dtype, op)?;
        unsafe { write(recv, &acc) };
        tracing::trace!(rank = self.rank, count, %dtype, "host reduce_scatter");
        Ok(())
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
        _stream: StreamHandle,
    ) -> Result<()> {
        self.check_per_peer("send counts", send_counts.len())?;
        self.check_per_peer("send displacements", send_displs.len())?;
        self.check_per_peer("receive counts", recv_counts.len())?;
        self.check_per_peer("receive displacements", recv_displs.len())?;

        let elem = dtype.size_in_bytes();
        let parts = send_counts
            .iter()
            .zip(send_displs)
            .map(|(&c, &d)| unsafe { read(send + (d * elem) as u64, c * elem) })
            .collect();
        let all = self.exchange(parts)?;

        let me = self.rank as usize;
        for (j, parts) in all.iter().enumerate() {
            let segment = &parts[me];
            let expected = recv_counts[j] * elem;
            if segment.len() != expected {
                return Err(LowerError::device(format!(
                    "rank {j} sent {} bytes to rank {me}, expected {expected}",
                    segment.len()
                )));
            }
            unsafe { write(recv + (recv_displs[j] * elem) as u64, segment) };
        }
        tracing::trace!(rank = self.rank, %dtype, "host all_to_all_v");
        Ok(())
    }

    unsafe fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        _stream: StreamHandle,
    ) -> Result<()> {
        self.check_root(root)?;
        let parts = if self.rank == root {
            vec![unsafe { read(ptr, count * dtype.size_in_bytes()) }]
        } else {
            Vec::new()
        };
        let all = self.exchange(parts)?;
        if self.rank != root {
            unsafe { write(ptr, &all[root as usize][0]) };
        }
        Ok(())
    }

    unsafe fn reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
        _stream: StreamHandle,
    ) -> Result<()> {
        self.check_root(root)?;
        check_reducible(dtype, "reduce")?;
        let bytes = count * dtype.size_in_bytes();
        let all = self.exchange(vec![unsafe { read(send, bytes) }])?;
        if self.rank == root {
            let acc = fold(all.iter().map(|parts| parts[0].as_slice()), dtype, op)?;
            unsafe { write(recv, &acc) };
        }
        Ok(())
    }

    unsafe fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        dest: Rank,
        tag: u32,
        _stream: StreamHandle,
    ) -> Result<()> {
        self.check_root(dest)?;
        let payload = unsafe { read(ptr, count * dtype.size_in_bytes()) };
        self.shared
            .mail
            .lock()
            .map_err(|_| LowerError::LockPoisoned("host mailbox"))?
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(payload);
        self.shared.mail_ready.notify_all();
        Ok(())
    }

    unsafe fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        src: Rank,
        tag: u32,
        _stream: StreamHandle,
    ) -> Result<()> {
        self.check_root(src)?;
        let key = (src, self.rank, tag);
        let mut mail = self
            .shared
            .mail
            .lock()
            .map_err(|_| LowerError::LockPoisoned("host mailbox"))?;
        let payload = loop {
            if let Some(msg) = mail.get_mut(&key).and_then(VecDeque::pop_front) {
                break msg;
            }
            mail = self
                .shared
                .mail_ready
                .wait(mail)
                .map_err(|_| LowerError::LockPoisoned("host mailbox"))?;
        };
        drop(mail);

        let expected = count * dtype.size_in_bytes();
        if payload.len() != expected {
            return Err(LowerError::device(format!(
                "message from rank {src} tag {tag} has {} bytes, expected {expected}",
                payload.len()
            )));
        }
        unsafe { write(ptr, &payload) };
        Ok(())
    }
}

/// # Safety
/// `ptr` must be valid for `bytes` bytes when `bytes > 0`.
unsafe fn read(ptr: u64, bytes: usize) -> Vec<u8> {
    if bytes == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr as *const u8, bytes) }.to_vec()
}

/// # Safety
/// `ptr` must be valid for `data.len()` bytes when `data` is non-empty.
unsafe fn write(ptr: u64, data: &[u8]) {
    if !data.is_empty() {
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len()) };
    }
}

fn check_reducible(dtype: DataType, op: &'static str) -> Result<()> {
    match dtype {
        DataType::F16 | DataType::BF16 => Err(LowerError::UnsupportedDType { dtype, op }),
        _ => Ok(()),
    }
}

/// Reduce contributions in rank order, so every rank computes the same bits.
fn fold<'a>(
    mut parts: impl Iterator<Item = &'a [u8]>,
    dtype: DataType,
    op: ReduceOp,
) -> Result<Vec<u8>> {
    let mut acc = parts.next().map(<[u8]>::to_vec).unwrap_or_default();
    for src in parts {
        reduce_bytes(&mut acc, src, dtype, op)?;
    }
    Ok(acc)
}

/// `dst[i] = op(dst[i], src[i])` over byte buffers of one element type.
fn reduce_bytes(dst: &mut [u8], src: &[u8], dtype: DataType, op: ReduceOp) -> Result<()> {
    if dst.len() != src.len() {
        return Err(LowerError::ArgumentMismatch {
            what: "reduce operand bytes",
            expected: dst.len(),
            actual: src.len(),
        });
    }
    match dtype {
        DataType::F32 => reduce_typed::<f32>(dst, src, op),
        DataType::F64 => reduce_typed::<f64>(dst, src, op),
        DataType::I32 => reduce_typed::<i32>(dst, src, op),
        DataType::I64 => reduce_typed::<i64>(dst, src, op),
        DataType::U32 => reduce_typed::<u32>(dst, src, op),
        DataType::U64 => reduce_typed::<u64>(dst, src, op),
        DataType::I8 => reduce_typed::<i8>(dst, src, op),
        DataType::U8 => reduce_typed::<u8>(dst, src, op),
        _ => return Err(LowerError::UnsupportedDType { dtype, op: "reduce" }),
    }
    Ok(())
}

/// Types that support the four reduction operations.
trait Reducible: Copy {
    fn reduce(self, other: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible_int {
    ($($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => self.wrapping_add(other),
                        ReduceOp::Prod => self.wrapping_mul(other),
                        ReduceOp::Min => self.min(other),
                        ReduceOp::Max => self.max(other),
                    }
                }
            }
        )*
    };
}

impl_reducible_int!(i8, i32, i64, u8, u32, u64);

macro_rules! impl_reducible_float {
    ($($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => self + other,
                        ReduceOp::Prod => self * other,
                        ReduceOp::Min => self.min(other),
                        ReduceOp::Max => self.max(other),
                    }
                }
            }
        )*
    };
}

impl_reducible_float!(f32, f64);

/// Byte buffers carry no alignment guarantee, so elements are moved with
/// unaligned reads and writes.
fn reduce_typed<T: Reducible>(dst: &mut [u8], src: &[u8], op: ReduceOp) {
    let size = std::mem::size_of::<T>();
    for (d, s) in dst.chunks_exact_mut(size).zip(src.chunks_exact(size)) {
        // SAFETY: both chunks are exactly size_of::<T>() bytes.
        unsafe {
            let a = (d.as_ptr() as *const T).read_unaligned();
            let b = (s.as_ptr() as *const T).read_unaligned();
            (d.as_mut_ptr() as *mut T).write_unaligned(a.reduce(b, op));
        }
    }
}
