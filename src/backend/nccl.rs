use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{CudaStream, result as driver, sys as cu};
use cudarc::nccl::{result as nccl, safe::Id, sys};

use crate::backend::{CommBackend, StreamHandle};
use crate::error::{LowerError, Result};
use crate::types::{DataType, Rank, ReduceOp};

/// NCCL communicator bound to a CUDA stream.
///
/// Raw `u64` device pointers go straight to cudarc's `result` layer. A
/// `StreamHandle(0)` means the backend's own stream; any other handle is a
/// `CUstream` owned by the caller. NCCL has no message tags, so point-to-point
/// calls ignore them and rely on issue order.
pub struct NcclBackend {
    comm: sys::ncclComm_t,
    stream: Arc<CudaStream>,
    rank: Rank,
    world: u32,
}

// SAFETY: the communicator is only used through stream-ordered NCCL calls.
unsafe impl Send for NcclBackend {}
unsafe impl Sync for NcclBackend {}

impl NcclBackend {
    /// Join the communicator identified by `id`. Every rank passes the same
    /// `id` and `world`, and its own `rank`.
    pub fn init(stream: Arc<CudaStream>, rank: Rank, world: u32, id: Id) -> Result<Self> {
        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(comm.as_mut_ptr(), world as i32, *id_to_sys(&id), rank as i32)
                .map_err(|e| nccl_error("comm_init_rank", e))?;
        }
        tracing::debug!(rank, world, "nccl communicator initialised");
        Ok(Self {
            comm: unsafe { comm.assume_init() },
            stream,
            rank,
            world,
        })
    }

    fn cu_stream(&self, stream: StreamHandle) -> cu::CUstream {
        match stream.0 {
            0 => self.stream.cu_stream(),
            raw => raw as cu::CUstream,
        }
    }

    fn nccl_stream(&self, stream: StreamHandle) -> sys::cudaStream_t {
        self.cu_stream(stream) as sys::cudaStream_t
    }

    /// Run `body` inside an NCCL group so its calls are fused.
    fn grouped(&self, what: &'static str, body: impl FnOnce() -> Result<()>) -> Result<()> {
        nccl::group_start().map_err(|e| nccl_error(what, e))?;
        let result = body();
        let end = nccl::group_end().map_err(|e| nccl_error(what, e));
        result.and(end)
    }
}

impl Drop for NcclBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = nccl::comm_abort(self.comm);
        }
    }
}

impl CommBackend for NcclBackend {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world
    }

    unsafe fn memcpy(&self, dst: u64, src: u64, bytes: usize, stream: StreamHandle) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        unsafe { driver::memcpy_dtod_async(dst, src, bytes, self.cu_stream(stream)) }
            .map_err(|e| LowerError::device_with_source("memcpy_dtod", e))
    }

    unsafe fn copy_to_host(&self, src: u64, dst: &mut [u8], stream: StreamHandle) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        unsafe { driver::memcpy_dtoh_async(dst, src, self.cu_stream(stream)) }
            .map_err(|e| LowerError::device_with_source("memcpy_dtoh", e))?;
        self.synchronize(stream)
    }

    unsafe fn copy_from_host(&self, src: &[u8], dst: u64, stream: StreamHandle) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        unsafe { driver::memcpy_htod_async(dst, src, self.cu_stream(stream)) }
            .map_err(|e| LowerError::device_with_source("memcpy_htod", e))?;
        // The host slice may be dropped as soon as we return.
        self.synchronize(stream)
    }

    fn synchronize(&self, stream: StreamHandle) -> Result<()> {
        unsafe { driver::stream::synchronize(self.cu_stream(stream)) }
            .map_err(|e| LowerError::device_with_source("stream synchronize", e))
    }

    fn alloc(&self, bytes: usize) -> Result<u64> {
        self.stream
            .context()
            .bind_to_thread()
            .map_err(|e| LowerError::device_with_source("bind context", e))?;
        unsafe {
            let ptr = driver::malloc_sync(bytes.max(1))
                .map_err(|e| LowerError::device_with_source("malloc", e))?;
            driver::memset_d8_sync(ptr, 0, bytes.max(1))
                .map_err(|e| LowerError::device_with_source("memset", e))?;
            Ok(ptr)
        }
    }

    unsafe fn free(&self, ptr: u64) -> Result<()> {
        unsafe { driver::free_sync(ptr) }.map_err(|e| LowerError::device_with_source("free", e))
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
        unsafe {
            nccl::all_reduce(
                send as *const c_void,
                recv as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                to_nccl_op(op),
                self.comm,
                self.nccl_stream(stream),
            )
        }
        .map_err(|e| nccl_error("all_reduce", e))?;
        Ok(())
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
        // Strided receive: one broadcast per root, fused into a group.
        self.grouped("all_gather", || {
            for r in 0..self.world {
                unsafe {
                    nccl::broadcast(
                        send as *const c_void,
                        (recv + r as u64 * stride_bytes as u64) as *mut c_void,
                        count,
                        to_nccl_dtype(dtype),
                        r as i32,
                        self.comm,
                        self.nccl_stream(stream),
                    )
                }
                .map_err(|e| nccl_error("all_gather", e))?;
            }
            Ok(())
        })
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
        // Strided send: rank r's part is reduced onto r.
        self.grouped("reduce_scatter", || {
            for r in 0..self.world {
                unsafe {
                    nccl::reduce(
                        (send + r as u64 * stride_bytes as u64) as *const c_void,
                        recv as *mut c_void,
                        count,
                        to_nccl_dtype(dtype),
                        to_nccl_op(op),
                        r as i32,
                        self.comm,
                        self.nccl_stream(stream),
                    )
                }
                .map_err(|e| nccl_error("reduce_scatter", e))?;
            }
            Ok(())
        })
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
        let elem = dtype.size_in_bytes() as u64;
        let dt = to_nccl_dtype(dtype);
        self.grouped("all_to_all_v", || {
            for peer in 0..self.world as usize {
                if send_counts[peer] > 0 {
                    unsafe {
                        nccl::send(
                            (send + send_displs[peer] as u64 * elem) as *const c_void,
                            send_counts[peer],
                            dt,
                            peer as i32,
                            self.comm,
                            self.nccl_stream(stream),
                        )
                    }
                    .map_err(|e| nccl_error("all_to_all_v send", e))?;
                }
                if recv_counts[peer] > 0 {
                    unsafe {
                        nccl::recv(
                            (recv + recv_displs[peer] as u64 * elem) as *mut c_void,
                            recv_counts[peer],
                            dt,
                            peer as i32,
                            self.comm,
                            self.nccl_stream(stream),
                        )
                    }
                    .map_err(|e| nccl_error("all_to_all_v recv", e))?;
                }
            }
            Ok(())
        })
    }

    unsafe fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            nccl::broadcast(
                ptr as *const c_void,
                ptr as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                root as i32,
                self.comm,
                self.nccl_stream(stream),
            )
        }
        .map_err(|e| nccl_error("broadcast", e))?;
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
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            nccl::reduce(
                send as *const c_void,
                recv as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                to_nccl_op(op),
                root as i32,
                self.comm,
                self.nccl_stream(stream),
            )
        }
        .map_err(|e| nccl_error("reduce", e))?;
        Ok(())
    }

    unsafe fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        dest: Rank,
        _tag: u32,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            nccl::send(
                ptr as *const c_void,
                count,
                to_nccl_dtype(dtype),
                dest as i32,
                self.comm,
                self.nccl_stream(stream),
            )
        }
        .map_err(|e| nccl_error("send", e))?;
        Ok(())
    }

    unsafe fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        src: Rank,
        _tag: u32,
        stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            nccl::recv(
                ptr as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                src as i32,
                self.comm,
                self.nccl_stream(stream),
            )
        }
        .map_err(|e| nccl_error("recv", e))?;
        Ok(())
    }
}

fn nccl_error(what: &'static str, e: nccl::NcclError) -> LowerError {
    LowerError::device(format!("nccl {what}: {e:?}"))
}

fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    match dt {
        DataType::F32 => sys::ncclDataType_t::ncclFloat32,
        DataType::F64 => sys::ncclDataType_t::ncclFloat64,
        DataType::F16 => sys::ncclDataType_t::ncclFloat16,
        DataType::BF16 => sys::ncclDataType_t::ncclBfloat16,
        DataType::I8 => sys::ncclDataType_t::ncclInt8,
        DataType::I32 => sys::ncclDataType_t::ncclInt32,
        DataType::I64 => sys::ncclDataType_t::ncclInt64,
        DataType::U8 => sys::ncclDataType_t::ncclUint8,
        DataType::U32 => sys::ncclDataType_t::ncclUint32,
        DataType::U64 => sys::ncclDataType_t::ncclUint64,
    }
}

fn to_nccl_op(op: ReduceOp) -> sys::ncclRedOp_t {
    match op {
        ReduceOp::Sum => sys::ncclRedOp_t::ncclSum,
        ReduceOp::Prod => sys::ncclRedOp_t::ncclProd,
        ReduceOp::Min => sys::ncclRedOp_t::ncclMin,
        ReduceOp::Max => sys::ncclRedOp_t::ncclMax,
    }
}

/// `ncclUniqueId` is `#[repr(C)]` around a single `[c_char; 128]`, the
/// layout `Id::internal()` exposes.
fn id_to_sys(id: &Id) -> &sys::ncclUniqueId {
    let internal = id.internal();
    unsafe { &*(internal as *const [std::ffi::c_char; 128] as *const sys::ncclUniqueId) }
}
