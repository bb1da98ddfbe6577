use std::sync::Arc;

use ccl_lower::{
    CollectiveOp, CommBackend, DataType, HostGroup, LowerConfig, LowerError, ScratchPool,
};

use super::helpers::{
    FailingBackend, attrs, launch, ptr, ptr_mut, run_ranks, run_ranks_with, small_config, sum,
};

#[test]
fn test_first_failed_batch_aborts_the_rest() {
    // 16-byte scratch: one 4-element input per batch, three batches.
    let results = run_ranks_with(
        2,
        small_config(16),
        |group| Arc::new(FailingBackend::new(group, 1)),
        |ctx| {
            let inputs: Vec<Vec<f32>> = (0..3).map(|t| vec![t as f32 + 1.0; 4]).collect();
            let mut outputs = vec![vec![0.0f32; 4]; 3];
            let ins: Vec<_> = inputs.iter().map(|v| (ptr(v), 4)).collect();
            let outs: Vec<_> = outputs.iter_mut().map(|v| (ptr_mut(v), 4)).collect();
            let err = ctx
                .execute(&launch(attrs(sum(), DataType::F32), &ins, &outs))
                .unwrap_err();
            (err, ctx.backend.calls(), outputs)
        },
    );

    for (err, calls, outputs) in results {
        assert!(matches!(
            err,
            LowerError::BatchFailed {
                operation: "allreduce",
                batch: 1,
                ..
            }
        ));
        assert_eq!(calls, 2);
        // Completed batches keep their effect.
        assert_eq!(outputs[0], vec![2.0; 4]);
        assert_eq!(outputs[1], vec![0.0; 4]);
        assert_eq!(outputs[2], vec![0.0; 4]);
    }
}

#[test]
fn test_scratch_is_exclusive_per_group() {
    run_ranks(1, small_config(64), |ctx| {
        let data = vec![1.0f32; 4];
        let mut out = vec![0.0f32; 4];
        let args = launch(
            attrs(sum(), DataType::F32),
            &[(ptr(&data), 4)],
            &[(ptr_mut(&mut out), 4)],
        );

        let held = ctx.pool.checkout("world").unwrap();
        assert!(matches!(
            ctx.execute(&args),
            Err(LowerError::ScratchBusy { ref group }) if group == "world"
        ));
        // Other groups have their own buffer.
        assert!(ctx.pool.checkout("other").is_ok());
        drop(held);

        ctx.execute(&args).unwrap();
        ctx.execute(&args).unwrap();
        assert_eq!(out, vec![1.0; 4]);
    });
}

#[test]
fn test_scratch_is_allocated_once_and_freed_with_the_pool() {
    let group = Arc::new(HostGroup::create(1).remove(0));
    let backend: Arc<dyn CommBackend> = group.clone();
    let pool = ScratchPool::new(backend, small_config(64)).unwrap();
    assert_eq!(group.live_allocations(), 0);

    let first = pool.checkout("world").unwrap();
    let (input, output) = (first.input(), first.output());
    assert_eq!(first.bytes(), 64);
    drop(first);
    let again = pool.checkout("world").unwrap();
    assert_eq!((again.input(), again.output()), (input, output));
    drop(again);
    assert_eq!(group.live_allocations(), 2);

    drop(pool);
    assert_eq!(group.live_allocations(), 0);
}

#[test]
fn test_input_larger_than_a_batch() {
    run_ranks(1, small_config(16), |ctx| {
        let data = vec![1.0f32; 5];
        let mut out = vec![0.0f32; 5];
        let args = launch(
            attrs(sum(), DataType::F32),
            &[(ptr(&data), 5)],
            &[(ptr_mut(&mut out), 5)],
        );
        assert!(matches!(
            ctx.execute(&args),
            Err(LowerError::SliceExceedsScratch {
                input: 0,
                count: 5,
                capacity: 4
            })
        ));
    });
}

#[test]
fn test_rank_size_must_match_group() {
    run_ranks(2, small_config(64), |ctx| {
        let data = vec![1.0f32; 2];
        let mut out = vec![0.0f32; 6];
        let args = launch(
            attrs(CollectiveOp::AllGather { rank_size: 3 }, DataType::F32),
            &[(ptr(&data), 2)],
            &[(ptr_mut(&mut out), 6)],
        );
        assert!(matches!(
            ctx.execute(&args),
            Err(LowerError::ArgumentMismatch {
                what: "rank size",
                expected: 2,
                actual: 3
            })
        ));
    });
}

#[test]
fn test_allreduce_output_must_match_input() {
    run_ranks(1, small_config(64), |ctx| {
        let data = vec![1.0f32; 4];
        let mut out = vec![0.0f32; 3];
        let args = launch(
            attrs(sum(), DataType::F32),
            &[(ptr(&data), 4)],
            &[(ptr_mut(&mut out), 3)],
        );
        assert!(matches!(
            ctx.execute(&args),
            Err(LowerError::ArgumentMismatch { .. })
        ));
    });
}

#[test]
fn test_half_precision_reduction_is_unsupported_on_host() {
    run_ranks(1, small_config(64), |ctx| {
        let data = vec![0u16; 4];
        let mut out = vec![0u16; 4];
        let args = launch(
            attrs(sum(), DataType::F16),
            &[(ptr(&data), 4)],
            &[(ptr_mut(&mut out), 4)],
        );
        let err = ctx.execute(&args).unwrap_err();
        assert!(matches!(err, LowerError::BatchFailed { batch: 0, .. }));
        assert!(err.to_string().contains("unsupported data type"));
    });
}

#[test]
fn test_pool_rejects_bad_alignment() {
    let group: Arc<dyn CommBackend> = Arc::new(HostGroup::create(1).remove(0));
    let config = LowerConfig {
        scratch_bytes: 64,
        alignment: 24,
    };
    assert!(matches!(
        ScratchPool::new(group, config),
        Err(LowerError::InvalidAlignment { alignment: 24 })
    ));
}
