//! Kinds that run on the caller's buffers without scratch staging.

use crate::backend::CommBackend;
use crate::config::NEGOTIATION_BYTES;
use crate::error::{LowerError, Result};
use crate::runtime::executor::Call;
use crate::types::{DataType, Rank, ReduceOp};

/// In-place broadcast of every input from `root`.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn broadcast(call: &Call<'_>, root: Rank) -> Result<()> {
    let args = call.args;
    for (i, &count) in args.input_counts().iter().enumerate() {
        let addr = args.input_addrs()[i];
        unsafe {
            call.backend
                .broadcast(addr, count, call.dtype, root, call.stream)?;
            // Outputs alias the inputs unless the host gave distinct buffers.
            if let Some(&out) = args.output_addrs().get(i)
                && out != addr
            {
                call.copy(out, addr, count)?;
            }
        }
    }
    Ok(())
}

/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn reduce(call: &Call<'_>, root: Rank, op: ReduceOp) -> Result<()> {
    let args = call.args;
    call.require_outputs(args.input_num())?;
    for (i, &count) in args.input_counts().iter().enumerate() {
        unsafe {
            call.backend.reduce(
                args.input_addrs()[i],
                args.output_addrs()[i],
                count,
                call.dtype,
                op,
                root,
                call.stream,
            )?;
        }
    }
    Ok(())
}

/// Announce each input's element count, then send its payload.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn send(call: &Call<'_>, dest: Rank, tag: u32) -> Result<()> {
    let args = call.args;
    for (i, &count) in args.input_counts().iter().enumerate() {
        let announce = TempBuffer::new(call.backend, NEGOTIATION_BYTES)?;
        unsafe {
            call.backend.copy_from_host(
                &(count as u64).to_ne_bytes(),
                announce.ptr,
                call.stream,
            )?;
            call.backend
                .send(announce.ptr, 1, DataType::U64, dest, tag, call.stream)?;
            call.backend.synchronize(call.stream)?;
            call.backend
                .send(args.input_addrs()[i], count, call.dtype, dest, tag, call.stream)?;
        }
        tracing::trace!(dest, tag, count, "sent tensor");
    }
    Ok(())
}

/// Negotiate each output's element count with `src`, then receive it.
///
/// The count lands in a guarded device buffer that is freed exactly once,
/// whether or not the negotiation succeeds. A payload larger than its output
/// is drained before `ReceiveOverflow` is returned.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn receive(call: &Call<'_>, src: Rank, tag: u32) -> Result<()> {
    let args = call.args;
    for (i, &capacity) in args.output_counts().iter().enumerate() {
        let count = unsafe { negotiate(call, src, tag)? };
        if count > capacity {
            tracing::warn!(src, tag, count, capacity, "peer announced more than the output holds");
            unsafe { discard(call, src, tag, count) };
            return Err(LowerError::ReceiveOverflow {
                expected: capacity,
                actual: count,
            });
        }
        unsafe {
            call.backend
                .recv(args.output_addrs()[i], count, call.dtype, src, tag, call.stream)?;
        }
        tracing::trace!(src, tag, count, "received tensor");
    }
    Ok(())
}

/// Consume a payload that will not be delivered so the channel stays in step
/// with the sender.
unsafe fn discard(call: &Call<'_>, src: Rank, tag: u32, count: usize) {
    let drained = count
        .checked_mul(call.elem)
        .ok_or_else(|| LowerError::device(format!("{count} elements do not fit in memory")))
        .and_then(|bytes| TempBuffer::new(call.backend, bytes))
        .and_then(|sink| unsafe {
            call.backend
                .recv(sink.ptr, count, call.dtype, src, tag, call.stream)?;
            call.backend.synchronize(call.stream)
        });
    if let Err(e) = drained {
        tracing::error!(src, tag, count, "failed to drain rejected payload: {e}");
    }
}

/// Receive the sender's element count.
unsafe fn negotiate(call: &Call<'_>, src: Rank, tag: u32) -> Result<usize> {
    let buffer = TempBuffer::new(call.backend, NEGOTIATION_BYTES)?;
    let mut word = [0u8; NEGOTIATION_BYTES];
    let received = unsafe {
        call.backend
            .recv(buffer.ptr, 1, DataType::U64, src, tag, call.stream)
            .and_then(|()| {
                call.backend
                    .copy_to_host(buffer.ptr, &mut word, call.stream)
            })
    };
    if let Err(e) = received {
        tracing::warn!(src, tag, "size negotiation failed: {e}");
        return Err(LowerError::NegotiationFailed {
            src,
            reason: e.to_string(),
        });
    }
    let count = u64::from_ne_bytes(word);
    usize::try_from(count).map_err(|_| LowerError::NegotiationFailed {
        src,
        reason: format!("announced count {count} does not fit in memory"),
    })
}

/// Device buffer for an exchanged count or a drained payload, freed on drop.
struct TempBuffer<'b> {
    backend: &'b dyn CommBackend,
    ptr: u64,
}

impl<'b> TempBuffer<'b> {
    fn new(backend: &'b dyn CommBackend, bytes: usize) -> Result<Self> {
        let ptr = backend.alloc(bytes)?;
        Ok(Self { backend, ptr })
    }
}

impl Drop for TempBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `alloc` and is only freed here.
        if let Err(e) = unsafe { self.backend.free(self.ptr) } {
            tracing::warn!("failed to free temporary buffer: {e}");
        }
    }
}
