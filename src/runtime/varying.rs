//! Kinds whose per-rank counts arrive as host-visible count tensors.
//!
//! Each rank's segment is moved in rounds of at most the per-rank capacity.
//! All ranks must run the same number of rounds, so the round count is
//! derived from data every rank sees, or agreed explicitly when it is not.

use crate::backend::exclusive_prefix_sum;
use crate::error::{LowerError, Result};
use crate::runtime::executor::{Call, batch, require};
use crate::runtime::packing::{Geometry, round_chunk, rounds};
use crate::runtime::scratch::CclBuffer;
use crate::types::{DataType, ReduceOp};

/// Inputs: data, receive counts, receive displacements.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn all_gather_v(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
) -> Result<()> {
    let args = call.args;
    let world = call.backend.world_size() as usize;
    let me = call.backend.rank() as usize;
    call.require_inputs(3)?;
    call.require_outputs(1)?;
    let recv_counts = unsafe { call.read_counts(1, world)? };
    let recv_displs = unsafe { call.read_counts(2, world)? };
    let local = args.input_counts()[0];
    require("allgatherv local count", recv_counts[me], local)?;
    check_segments(
        "allgatherv output",
        &recv_counts,
        &recv_displs,
        args.output_counts()[0],
        call.elem,
    )?;

    let capacity = geometry.capacity();
    let total = agreed_rounds(&recv_counts, capacity)?;
    tracing::debug!(operation = "allgatherv", rounds = total, capacity, "round plan");

    let (data, out) = (args.input_addrs()[0], args.output_addrs()[0]);
    for k in 0..total {
        batch("allgatherv", k, || unsafe {
            let widest = widest_chunk(&recv_counts, k, capacity);
            let stride = geometry.stride_bytes(widest);
            call.copy(
                scratch.input(),
                call.at(data, k * capacity),
                round_chunk(local, k, capacity),
            )?;
            call.backend.all_gather(
                scratch.input(),
                scratch.output(),
                widest,
                stride,
                call.dtype,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for r in 0..world {
                call.copy(
                    call.at(out, recv_displs[r] + k * capacity),
                    scratch.output() + (r * stride) as u64,
                    round_chunk(recv_counts[r], k, capacity),
                )?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Inputs: data, send counts, send displacements. The output receives this
/// rank's reduced segment.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn reduce_scatter_v(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
    op: ReduceOp,
) -> Result<()> {
    let args = call.args;
    let world = call.backend.world_size() as usize;
    let me = call.backend.rank() as usize;
    call.require_inputs(3)?;
    call.require_outputs(1)?;
    let send_counts = unsafe { call.read_counts(1, world)? };
    let send_displs = unsafe { call.read_counts(2, world)? };
    check_segments(
        "reduce-scatterv input",
        &send_counts,
        &send_displs,
        args.input_counts()[0],
        call.elem,
    )?;
    check_segments(
        "reduce-scatterv output",
        &send_counts[me..=me],
        &[0],
        args.output_counts()[0],
        call.elem,
    )?;

    let capacity = geometry.capacity();
    let total = agreed_rounds(&send_counts, capacity)?;
    tracing::debug!(operation = "reduce_scatterv", rounds = total, capacity, "round plan");

    let (data, out) = (args.input_addrs()[0], args.output_addrs()[0]);
    for k in 0..total {
        batch("reduce_scatterv", k, || unsafe {
            let widest = widest_chunk(&send_counts, k, capacity);
            let stride = geometry.stride_bytes(widest);
            for r in 0..world {
                call.copy(
                    scratch.input() + (r * stride) as u64,
                    call.at(data, send_displs[r] + k * capacity),
                    round_chunk(send_counts[r], k, capacity),
                )?;
            }
            call.backend.reduce_scatter(
                scratch.input(),
                stride,
                scratch.output(),
                widest,
                call.dtype,
                op,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            call.copy(
                call.at(out, k * capacity),
                scratch.output(),
                round_chunk(send_counts[me], k, capacity),
            )
        })?;
    }
    Ok(())
}

/// Inputs: data, send counts, send displacements, receive counts, receive
/// displacements.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn all_to_all_v(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
) -> Result<()> {
    let args = call.args;
    let world = call.backend.world_size() as usize;
    call.require_inputs(5)?;
    call.require_outputs(1)?;
    let send_counts = unsafe { call.read_counts(1, world)? };
    let send_displs = unsafe { call.read_counts(2, world)? };
    let recv_counts = unsafe { call.read_counts(3, world)? };
    let recv_displs = unsafe { call.read_counts(4, world)? };
    check_segments(
        "alltoallv input",
        &send_counts,
        &send_displs,
        args.input_counts()[0],
        call.elem,
    )?;
    check_segments(
        "alltoallv output",
        &recv_counts,
        &recv_displs,
        args.output_counts()[0],
        call.elem,
    )?;

    let capacity = geometry.capacity();
    let both: Vec<usize> = send_counts.iter().chain(&recv_counts).copied().collect();
    let local = agreed_rounds(&both, capacity)?;
    // Peers may see larger segments than this rank does.
    let total = unsafe { agree_max(call, scratch, local)? };
    tracing::debug!(operation = "alltoallv", local, rounds = total, capacity, "round plan");

    let slot = geometry.stride_bytes(capacity) / call.elem;
    let displs: Vec<usize> = (0..world).map(|j| j * slot).collect();
    let (data, out) = (args.input_addrs()[0], args.output_addrs()[0]);
    for k in 0..total {
        batch("alltoallv", k, || unsafe {
            let sends: Vec<usize> = send_counts
                .iter()
                .map(|&c| round_chunk(c, k, capacity))
                .collect();
            let recvs: Vec<usize> = recv_counts
                .iter()
                .map(|&c| round_chunk(c, k, capacity))
                .collect();
            for j in 0..world {
                call.copy(
                    call.at(scratch.input(), displs[j]),
                    call.at(data, send_displs[j] + k * capacity),
                    sends[j],
                )?;
            }
            call.backend.all_to_all_v(
                scratch.input(),
                &sends,
                &displs,
                scratch.output(),
                &recvs,
                &displs,
                call.dtype,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for j in 0..world {
                call.copy(
                    call.at(out, recv_displs[j] + k * capacity),
                    call.at(scratch.output(), displs[j]),
                    recvs[j],
                )?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Inputs: data, the `world x world` count matrix. Segments are contiguous
/// in rank order on both sides.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn all_to_all_vc(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
) -> Result<()> {
    let args = call.args;
    let n = call.backend.world_size() as usize;
    let me = call.backend.rank() as usize;
    call.require_inputs(2)?;
    call.require_outputs(1)?;
    let matrix = unsafe { call.read_counts(1, n * n)? };
    let row: Vec<usize> = (0..n).map(|j| matrix[me * n + j]).collect();
    let col: Vec<usize> = (0..n).map(|i| matrix[i * n + me]).collect();
    let (send_base, recv_base) = (exclusive_prefix_sum(&row), exclusive_prefix_sum(&col));
    check_segments(
        "alltoallvc input",
        &row,
        &send_base,
        args.input_counts()[0],
        call.elem,
    )?;
    check_segments(
        "alltoallvc output",
        &col,
        &recv_base,
        args.output_counts()[0],
        call.elem,
    )?;

    let capacity = geometry.capacity();
    let total = agreed_rounds(&matrix, capacity)?;
    tracing::debug!(operation = "alltoallvc", rounds = total, capacity, "round plan");

    let (data, out) = (args.input_addrs()[0], args.output_addrs()[0]);
    for k in 0..total {
        batch("alltoallvc", k, || unsafe {
            let chunk: Vec<usize> = matrix
                .iter()
                .map(|&c| round_chunk(c, k, capacity))
                .collect();
            let sends: Vec<usize> = (0..n).map(|j| chunk[me * n + j]).collect();
            let recvs: Vec<usize> = (0..n).map(|i| chunk[i * n + me]).collect();
            let send_off = exclusive_prefix_sum(&sends);
            let recv_off = exclusive_prefix_sum(&recvs);
            for j in 0..n {
                call.copy(
                    call.at(scratch.input(), send_off[j]),
                    call.at(data, send_base[j] + k * capacity),
                    sends[j],
                )?;
            }
            call.backend.all_to_all_vc(
                scratch.input(),
                scratch.output(),
                &chunk,
                call.dtype,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for i in 0..n {
                call.copy(
                    call.at(out, recv_base[i] + k * capacity),
                    call.at(scratch.output(), recv_off[i]),
                    recvs[i],
                )?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Rounds needed for the largest of `counts`.
fn agreed_rounds(counts: &[usize], capacity: usize) -> Result<usize> {
    let largest = counts.iter().copied().max().unwrap_or(0);
    if largest > 0 && capacity == 0 {
        return Err(LowerError::SliceExceedsScratch {
            input: 0,
            count: largest,
            capacity,
        });
    }
    Ok(rounds(largest, capacity))
}

/// Largest chunk any rank moves in round `k`.
fn widest_chunk(counts: &[usize], k: usize, capacity: usize) -> usize {
    counts
        .iter()
        .map(|&c| round_chunk(c, k, capacity))
        .max()
        .unwrap_or(0)
}

/// Max-reduce a local value across the group through the scratch buffer.
unsafe fn agree_max(call: &Call<'_>, scratch: &CclBuffer, local: usize) -> Result<usize> {
    let mut word = (local as u64).to_ne_bytes();
    unsafe {
        call.backend
            .copy_from_host(&word, scratch.input(), call.stream)?;
        call.backend.all_reduce(
            scratch.input(),
            scratch.output(),
            1,
            DataType::U64,
            ReduceOp::Max,
            call.stream,
        )?;
        call.backend
            .copy_to_host(scratch.output(), &mut word, call.stream)?;
    }
    Ok(u64::from_ne_bytes(word) as usize)
}

/// Every `[displ, displ + count)` segment must lie inside a buffer of `len`
/// elements.
fn check_segments(
    field: &'static str,
    counts: &[usize],
    displs: &[usize],
    len: usize,
    elem: usize,
) -> Result<()> {
    for (&count, &displ) in counts.iter().zip(displs) {
        if displ.checked_add(count).is_none_or(|end| end > len) {
            return Err(LowerError::BufferOverflow {
                field,
                capacity: len.saturating_mul(elem),
                required: displ.saturating_add(count).saturating_mul(elem),
            });
        }
    }
    Ok(())
}
