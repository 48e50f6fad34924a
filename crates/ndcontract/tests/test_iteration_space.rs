//! Task partitioning and movement codes of the iteration space.

use std::collections::HashSet;

use ndcontract::{DimKind, ExecKind, IterProperty, IterationSpace, OperandStrides};

fn sfc(kind: DimKind, size: i64, stride: i64) -> IterProperty {
    IterProperty::new(kind, size, stride, stride + 1, stride + 2).with_exec(ExecKind::Sfc)
}

fn omp(kind: DimKind, size: i64, stride: i64) -> IterProperty {
    IterProperty::new(kind, size, stride, stride, stride).with_exec(ExecKind::Omp)
}

/// Replays every thread's movement codes and checks that the threads cover
/// each `(omp, m, n, k)` task exactly once.
fn check_replay(iters: &[IterProperty], tm: usize, tn: usize, tomp: usize, expected_tasks: usize) {
    let space = IterationSpace::new(iters, tm, tn, tomp).unwrap();
    let raw: Vec<OperandStrides> = iters.iter().map(|iter| iter.strides()).collect();
    let mut converted = raw.clone();
    let infos = space.setup(&mut converted).unwrap();
    assert_eq!(infos.len(), tm * tn * tomp);

    let mut seen = HashSet::new();
    for (thread_id, info) in infos.iter().enumerate() {
        let path = space.traversal(thread_id).unwrap();
        let omp_len = (info.omp_end - info.omp_begin) as usize;
        assert_eq!(omp_len * path.len(), info.num_tasks());
        assert_eq!(info.movement_ids.len(), path.len());
        assert_eq!(info.movement_ids.last(), Some(&0));
        assert_eq!(info.k_count.len(), (info.sfc_size_m * info.sfc_size_n) as usize);
        assert_eq!(path[0], (info.sfc_begin_m, info.sfc_begin_n, 0));

        let (m, n, k) = path[0];
        let mut offset = info.offset;
        assert_eq!(offset, space.calculate_offset(m, n, k, &raw));
        for (step, &(m, n, k)) in path.iter().enumerate().skip(1) {
            let code = info.movement_ids[step - 1];
            let stride = converted[(code >> 1) as usize];
            offset = if code & 1 == 1 {
                offset - stride
            } else {
                offset + stride
            };
            assert_eq!(offset, space.calculate_offset(m, n, k, &raw), "thread {thread_id} step {step}");
        }

        for omp_id in info.omp_begin..info.omp_end {
            for &task in &path {
                assert!(seen.insert((omp_id, task)), "task visited twice");
            }
        }
    }
    assert_eq!(seen.len(), expected_tasks);
}

#[test]
fn test_replay_with_omp_loop() {
    let iters = [
        omp(DimKind::C, 2, 1000),
        sfc(DimKind::N, 2, 100),
        sfc(DimKind::N, 2, 10),
        sfc(DimKind::M, 3, 1),
    ];
    check_replay(&iters, 3, 1, 1, 24);
    check_replay(&iters, 1, 2, 2, 24);
    check_replay(&iters, 1, 1, 1, 24);
}

#[test]
fn test_replay_with_k_loops() {
    let iters = [
        sfc(DimKind::N, 2, 100),
        sfc(DimKind::N, 2, 10),
        sfc(DimKind::M, 3, 1),
        sfc(DimKind::M, 2, 3),
        sfc(DimKind::K, 2, 7),
        sfc(DimKind::K, 3, 17),
    ];
    check_replay(&iters, 2, 2, 1, 144);
}

#[test]
fn test_replay_odd_grid() {
    let iters = [
        sfc(DimKind::N, 3, 100),
        sfc(DimKind::N, 5, 11),
        sfc(DimKind::M, 3, 1),
        sfc(DimKind::M, 3, 3),
    ];
    check_replay(&iters, 1, 1, 1, 135);
}

#[test]
fn test_omp_offsets() {
    let iters = [
        omp(DimKind::C, 2, 1000),
        omp(DimKind::M, 3, 10),
        sfc(DimKind::N, 2, 1),
    ];
    let space = IterationSpace::new(&iters, 1, 1, 2).unwrap();
    let strides: Vec<OperandStrides> = iters.iter().map(|iter| iter.strides()).collect();

    assert_eq!(space.omp_offset(0, &strides), OperandStrides::default());
    assert_eq!(space.omp_offset(1, &strides).left, 10);
    assert_eq!(space.omp_offset(3, &strides).left, 1000);
    assert_eq!(space.omp_offset(4, &strides), OperandStrides::new(1010, 1010, 0, 1010));

    let mut converted = strides.clone();
    let infos = space.setup(&mut converted).unwrap();
    assert_eq!((infos[0].omp_begin, infos[0].omp_end), (0, 3));
    assert_eq!((infos[1].omp_begin, infos[1].omp_end), (3, 6));
    // OMP strides are left untouched
    assert_eq!(converted[0], strides[0]);
    assert_eq!(converted[1], strides[1]);
}

#[test]
fn test_task_counts() {
    let iters = [
        omp(DimKind::C, 4, 1000),
        sfc(DimKind::N, 3, 100),
        sfc(DimKind::M, 5, 1),
        sfc(DimKind::K, 2, 7),
    ];
    let space = IterationSpace::new(&iters, 1, 1, 1).unwrap();
    assert_eq!(space.num_tasks(), (4, 5, 3, 2));
    assert_eq!(space.num_sfc_loops(), 3);
    assert_eq!(space.sfc_loops_k().len(), 1);
}
