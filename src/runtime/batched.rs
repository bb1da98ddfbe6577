//! Fixed-count kinds staged through the scratch buffer in packed batches.
//!
//! Every rank has the same shapes, so every rank computes the same batches
//! and enters each primitive with the same count.

use crate::error::Result;
use crate::runtime::executor::{Call, batch, require};
use crate::runtime::packing::{Batch, Geometry, pack};
use crate::runtime::scratch::CclBuffer;
use crate::types::ReduceOp;

/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn all_reduce(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
    op: ReduceOp,
) -> Result<()> {
    let args = call.args;
    call.require_outputs(args.input_num())?;
    let counts = args.input_counts();
    for (i, (&n, &m)) in counts.iter().zip(&args.output_counts()).enumerate() {
        require("allreduce output elements", n, m).inspect_err(|_| {
            tracing::warn!(output = i, "allreduce output size differs from input");
        })?;
    }
    let batches = pack(&counts, geometry.capacity())?;
    log_plan("allreduce", &batches, geometry);

    for (index, b) in batches.iter().enumerate() {
        batch("allreduce", index, || unsafe {
            stage_in(call, scratch.input(), b)?;
            call.backend.all_reduce(
                scratch.input(),
                scratch.output(),
                b.count(),
                call.dtype,
                op,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for s in &b.slices {
                call.copy(
                    call.at(args.output_addrs()[s.input], s.offset),
                    call.at(scratch.output(), s.batch_offset),
                    s.count,
                )?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Output `i` holds every rank's copy of input `i`, in rank order.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn all_gather(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
) -> Result<()> {
    let args = call.args;
    let world = call.backend.world_size() as usize;
    call.require_outputs(args.input_num())?;
    let counts = args.input_counts();
    for (&n, &m) in counts.iter().zip(&args.output_counts()) {
        require("allgather output elements", n * world, m)?;
    }
    let batches = pack(&counts, geometry.capacity())?;
    log_plan("allgather", &batches, geometry);

    for (index, b) in batches.iter().enumerate() {
        batch("allgather", index, || unsafe {
            let stride = geometry.stride_bytes(b.count());
            stage_in(call, scratch.input(), b)?;
            call.backend.all_gather(
                scratch.input(),
                scratch.output(),
                b.count(),
                stride,
                call.dtype,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for r in 0..world {
                let slot = scratch.output() + (r * stride) as u64;
                for s in &b.slices {
                    call.copy(
                        call.at(args.output_addrs()[s.input], r * counts[s.input] + s.offset),
                        call.at(slot, s.batch_offset),
                        s.count,
                    )?;
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Input `i` holds one segment per rank; output `i` receives this rank's
/// segment reduced across ranks.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn reduce_scatter(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
    op: ReduceOp,
) -> Result<()> {
    let args = call.args;
    let world = call.backend.world_size() as usize;
    call.require_outputs(args.input_num())?;
    let segments = args.output_counts();
    for (&n, &seg) in args.input_counts().iter().zip(&segments) {
        require("reduce-scatter input elements", seg * world, n)?;
    }
    let batches = pack(&segments, geometry.capacity())?;
    log_plan("reduce_scatter", &batches, geometry);

    for (index, b) in batches.iter().enumerate() {
        batch("reduce_scatter", index, || unsafe {
            let stride = geometry.stride_bytes(b.count());
            stage_in_per_rank(call, scratch.input(), stride, b, &segments, world)?;
            call.backend.reduce_scatter(
                scratch.input(),
                stride,
                scratch.output(),
                b.count(),
                call.dtype,
                op,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for s in &b.slices {
                call.copy(
                    call.at(args.output_addrs()[s.input], s.offset),
                    call.at(scratch.output(), s.batch_offset),
                    s.count,
                )?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Segment `r` of input `i` goes to rank `r`; segment `r` of output `i`
/// comes from rank `r`.
///
/// # Safety
/// See [`crate::runtime::Executor::execute`].
pub(crate) unsafe fn all_to_all(
    call: &Call<'_>,
    scratch: &CclBuffer,
    geometry: &Geometry,
) -> Result<()> {
    let args = call.args;
    let world = call.backend.world_size() as usize;
    call.require_outputs(args.input_num())?;
    let counts = args.input_counts();
    let mut segments = Vec::with_capacity(counts.len());
    for (&n, &m) in counts.iter().zip(&args.output_counts()) {
        require("alltoall output elements", n, m)?;
        require("alltoall input elements", n / world * world, n)?;
        segments.push(n / world);
    }
    let batches = pack(&segments, geometry.capacity())?;
    log_plan("alltoall", &batches, geometry);

    for (index, b) in batches.iter().enumerate() {
        batch("alltoall", index, || unsafe {
            let count = b.count();
            let stride = geometry.stride_bytes(count);
            let per_peer = vec![count; world];
            let displs: Vec<usize> = (0..world).map(|r| r * stride / call.elem).collect();
            stage_in_per_rank(call, scratch.input(), stride, b, &segments, world)?;
            call.backend.all_to_all_v(
                scratch.input(),
                &per_peer,
                &displs,
                scratch.output(),
                &per_peer,
                &displs,
                call.dtype,
                call.stream,
            )?;
            call.backend.synchronize(call.stream)?;
            for r in 0..world {
                let slot = scratch.output() + (r * stride) as u64;
                for s in &b.slices {
                    call.copy(
                        call.at(
                            args.output_addrs()[s.input],
                            r * segments[s.input] + s.offset,
                        ),
                        call.at(slot, s.batch_offset),
                        s.count,
                    )?;
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Copy each slice of the batch from its input into the scratch region.
unsafe fn stage_in(call: &Call<'_>, region: u64, b: &Batch) -> Result<()> {
    for s in &b.slices {
        unsafe {
            call.copy(
                call.at(region, s.batch_offset),
                call.at(call.args.input_addrs()[s.input], s.offset),
                s.count,
            )?;
        }
    }
    Ok(())
}

/// Like [`stage_in`], once per destination rank: segment `r` of each input
/// lands in slot `r` of the region.
unsafe fn stage_in_per_rank(
    call: &Call<'_>,
    region: u64,
    stride: usize,
    b: &Batch,
    segments: &[usize],
    world: usize,
) -> Result<()> {
    for r in 0..world {
        let slot = region + (r * stride) as u64;
        for s in &b.slices {
            unsafe {
                call.copy(
                    call.at(slot, s.batch_offset),
                    call.at(
                        call.args.input_addrs()[s.input],
                        r * segments[s.input] + s.offset,
                    ),
                    s.count,
                )?;
            }
        }
    }
    Ok(())
}

fn log_plan(operation: &'static str, batches: &[Batch], geometry: &Geometry) {
    tracing::debug!(
        operation,
        batches = batches.len(),
        capacity = geometry.capacity(),
        "packed scratch batches"
    );
    for (index, b) in batches.iter().enumerate() {
        tracing::trace!(
            operation,
            batch = index,
            count = b.count(),
            slices = ?b.slice_idxs().collect::<Vec<_>>(),
            "batch layout"
        );
    }
}
