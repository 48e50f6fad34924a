//! Failure paths of the optimizer and the backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndcontract::{
    ContractionBackend, ContractionConfig, ContractionError, ContractionOptimizer, DataType,
    DimKind, ErrorCode, ExecKind, IterProperty, KernelType, MemoryManager, ScalarKernels,
    ThreadMemory,
};

fn prim(kind: DimKind, size: i64, l: i64, r: i64, o: i64) -> IterProperty {
    IterProperty::new(kind, size, l, r, o).with_exec(ExecKind::Prim)
}

/// `km,nk->nm` with m = 2, n = 3, k = 4 as kernel loops.
fn gemm_prims() -> Vec<IterProperty> {
    vec![
        prim(DimKind::M, 2, 1, 0, 1),
        prim(DimKind::N, 3, 0, 4, 2),
        prim(DimKind::K, 4, 2, 1, 0),
    ]
}

fn backend(
    iters: Vec<IterProperty>,
    first: KernelType,
    main: KernelType,
    last: KernelType,
) -> ContractionBackend<ScalarKernels> {
    ContractionBackend::init(
        iters,
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        first,
        main,
        last,
        1,
        1,
        1,
    )
}

fn compile_err(mut backend: ContractionBackend<ScalarKernels>) -> ContractionError {
    let err = backend.compile().unwrap_err();
    assert!(!backend.is_compiled());
    err
}

#[test]
fn test_mixed_data_types() {
    let mut b = ContractionBackend::<ScalarKernels>::init(
        gemm_prims(),
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp32,
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
        1,
        1,
        1,
    );
    let err = b.compile().unwrap_err();
    assert!(matches!(err, ContractionError::UnsupportedDataTypes { out: DataType::Fp32, .. }));
    assert_eq!(err.code(), ErrorCode::CompilationFailed);
}

#[test]
fn test_touch_kernel_must_be_unary() {
    let err = compile_err(backend(
        gemm_prims(),
        KernelType::Madd,
        KernelType::Madd,
        KernelType::Undefined,
    ));
    assert!(matches!(
        err,
        ContractionError::UnsupportedTouchKernel { kernel: KernelType::Madd }
    ));

    let err = compile_err(backend(
        gemm_prims(),
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::BrMadd,
    ));
    assert!(matches!(err, ContractionError::UnsupportedTouchKernel { .. }));
}

#[test]
fn test_missing_kernel_loops() {
    let b = ContractionBackend::<ScalarKernels>::init_from_arrays(
        &[DimKind::M, DimKind::N, DimKind::K],
        &[ExecKind::Seq, ExecKind::Prim, ExecKind::Prim],
        &[2, 3, 4],
        &[1, 0, 2],
        &[0, 4, 1],
        &[0, 0, 0],
        &[1, 2, 0],
        &[],
        &[],
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
        1,
        1,
        1,
    )
    .unwrap();
    let err = compile_err(b);
    assert!(matches!(err, ContractionError::KernelShape { kernel: KernelType::Madd, .. }));
}

#[test]
fn test_invalid_size() {
    let mut iters = vec![IterProperty::new(DimKind::C, 0, 8, 12, 6)];
    iters.extend(gemm_prims());
    let err = compile_err(backend(
        iters.clone(),
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
    ));
    assert!(matches!(
        err,
        ContractionError::InvalidSize { loop_id: 0, kind: DimKind::C, size: 0 }
    ));

    let config = ContractionConfig::default().with_threads(1);
    let err = ContractionOptimizer::new(iters, KernelType::Madd, DataType::Fp64, &config)
        .optimize()
        .unwrap_err();
    assert!(matches!(err, ContractionError::InvalidSize { .. }));
}

#[test]
fn test_omp_loop_over_k() {
    let mut iters = vec![IterProperty::new(DimKind::K, 2, 8, 12, 0).with_exec(ExecKind::Omp)];
    iters.extend(gemm_prims());
    let err = compile_err(backend(
        iters,
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
    ));
    assert!(matches!(err, ContractionError::ParallelLayout { loop_id: 0, .. }));
}

#[test]
fn test_unpacked_loop_in_packed_region() {
    // the right operand is packed along N but not along K
    let iters = vec![
        prim(DimKind::M, 2, 1, 0, 1),
        prim(DimKind::N, 3, 0, 4, 2).with_packing(0, 4),
        prim(DimKind::K, 4, 2, 1, 0),
    ];
    let err = compile_err(backend(
        iters,
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
    ));
    assert!(matches!(err, ContractionError::InvalidPacking { operand: "right", .. }));
}

#[test]
fn test_complex_dimension_errors() {
    let config = ContractionConfig::default().with_threads(1);
    let real = vec![
        IterProperty::new(DimKind::M, 4, 1, 0, 1),
        IterProperty::new(DimKind::N, 4, 0, 4, 4),
        IterProperty::new(DimKind::K, 4, 4, 1, 0),
    ];

    let err = ContractionOptimizer::new(real.clone(), KernelType::CpxMadd, DataType::Fp64, &config)
        .optimize()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCpxDim);

    let mut with_cpx = real.clone();
    with_cpx.push(IterProperty::new(DimKind::Cpx, 2, 16, 16, 16));
    let err = ContractionOptimizer::new(with_cpx.clone(), KernelType::Madd, DataType::Fp64, &config)
        .optimize()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCpxDim);

    with_cpx.push(IterProperty::new(DimKind::Cpx, 2, 32, 32, 32));
    let err = ContractionOptimizer::new(with_cpx, KernelType::CpxMadd, DataType::Fp64, &config)
        .optimize()
        .unwrap_err();
    assert!(matches!(err, ContractionError::InvalidCpxDim { .. }));

    // kernel complex loop of size 3
    let mut iters = vec![prim(DimKind::Cpx, 3, 8, 12, 6)];
    iters.extend(gemm_prims());
    let err = compile_err(backend(
        iters,
        KernelType::Undefined,
        KernelType::CpxMadd,
        KernelType::Undefined,
    ));
    assert_eq!(err.code(), ErrorCode::InvalidCpxDim);
}

#[test]
fn test_launch_checks() {
    let mut b = backend(
        gemm_prims(),
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Add,
    );
    let left = vec![1.0f64; 8];
    let right = vec![1.0f64; 12];
    let mut out = vec![0.0f64; 6];
    assert!(matches!(
        b.contract(&left, &right, None, &mut out).unwrap_err(),
        ContractionError::NotCompiled
    ));

    b.compile().unwrap();
    assert!(matches!(
        b.contract(&left[..7], &right, None, &mut out).unwrap_err(),
        ContractionError::BufferTooSmall { operand: "left", required: 8, actual: 7 }
    ));
    assert!(matches!(
        b.contract(&left, &right[..11], None, &mut out).unwrap_err(),
        ContractionError::BufferTooSmall { operand: "right", .. }
    ));
    assert!(matches!(
        b.contract(&left, &right, None, &mut out).unwrap_err(),
        ContractionError::MissingAuxiliary { kernel: KernelType::Add }
    ));

    let (left32, right32) = (vec![1.0f32; 8], vec![1.0f32; 12]);
    let mut out32 = vec![0.0f32; 6];
    assert!(matches!(
        b.contract(&left32, &right32, None, &mut out32).unwrap_err(),
        ContractionError::DataTypeMismatch { expected: DataType::Fp64, actual: DataType::Fp32 }
    ));

    // all aux strides are zero, so one element suffices
    let aux = [0.5f64];
    b.contract(&left, &right, Some(&aux), &mut out).unwrap();
    assert_eq!(out, vec![4.5; 6]);
}

#[test]
fn test_zero_targets_are_rejected() {
    let iters = vec![
        IterProperty::new(DimKind::M, 8, 1, 0, 1),
        IterProperty::new(DimKind::N, 8, 0, 8, 8),
        IterProperty::new(DimKind::K, 8, 8, 1, 0),
    ];
    let config = ContractionConfig::default().with_threads(1).with_targets(0, 0, 0);
    let err = ContractionBackend::<ScalarKernels>::optimized(
        iters.clone(),
        DataType::Fp64,
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
        &config,
    )
    .err()
    .unwrap();
    assert!(matches!(err, ContractionError::InvalidConfig { field: "target_m", value: 0 }));
    assert_eq!(err.code(), ErrorCode::CompilationFailed);

    let checks = [
        ContractionConfig::default().with_k_blocking(0),
        ContractionConfig::default().with_extra_packing(-2),
        ContractionConfig::default().with_max_cached_slots(0),
    ];
    for config in &checks {
        let err = ContractionOptimizer::new(iters.clone(), KernelType::Madd, DataType::Fp64, config)
            .optimize()
            .unwrap_err();
        assert!(matches!(err, ContractionError::InvalidConfig { .. }));
    }

    let mut config = ContractionConfig::default();
    config.aliasing_stride = 0;
    let err = ContractionOptimizer::new(iters, KernelType::Madd, DataType::Fp64, &config)
        .optimize()
        .unwrap_err();
    assert!(matches!(err, ContractionError::InvalidConfig { field: "aliasing_stride", .. }));
}

/// Default memory that hands out at most `max_slices` slices of at most
/// `max_len` bytes.
struct TruncatedMemory {
    inner: ThreadMemory,
    max_slices: Arc<AtomicUsize>,
    max_len: usize,
}

impl TruncatedMemory {
    fn new(max_slices: usize, max_len: usize) -> (Self, Arc<AtomicUsize>) {
        let slices = Arc::new(AtomicUsize::new(max_slices));
        let memory = Self {
            inner: ThreadMemory::new(),
            max_slices: Arc::clone(&slices),
            max_len,
        };
        (memory, slices)
    }
}

impl MemoryManager for TruncatedMemory {
    fn reserve_thread_memory(&mut self, size: usize, num_threads: usize) {
        self.inner.reserve_thread_memory(size, num_threads);
    }

    fn alloc_all_memory(&mut self) {
        self.inner.alloc_all_memory();
    }

    fn thread_memory(&mut self) -> Vec<&mut [u8]> {
        let max_slices = self.max_slices.load(Ordering::SeqCst);
        let max_len = self.max_len;
        self.inner
            .thread_memory()
            .into_iter()
            .take(max_slices)
            .map(|slice| {
                let len = slice.len().min(max_len);
                &mut slice[..len]
            })
            .collect()
    }
}

/// Four batches of `km,nk->nm` on four OMP threads, with the left operand
/// copied into scratch memory.
fn batched_backend(memory: TruncatedMemory) -> ContractionBackend<ScalarKernels> {
    let iters = vec![
        IterProperty::new(DimKind::C, 4, 8, 12, 6).with_exec(ExecKind::Omp),
        prim(DimKind::M, 2, 1, 0, 1).with_packing(1, 0),
        prim(DimKind::N, 3, 0, 4, 2),
        prim(DimKind::K, 4, 2, 1, 0).with_packing(2, 0),
    ];
    ContractionBackend::<ScalarKernels>::init(
        iters,
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        DataType::Fp64,
        KernelType::Undefined,
        KernelType::Madd,
        KernelType::Undefined,
        4,
        1,
        1,
    )
    .with_memory_manager(Box::new(memory))
}

#[test]
fn test_missing_thread_slices() {
    let (memory, _) = TruncatedMemory::new(1, usize::MAX);
    let mut backend = batched_backend(memory);
    let err = backend.compile().unwrap_err();
    assert!(matches!(err, ContractionError::ThreadMemory { threads: 4, slices: 1, .. }));
    assert_eq!(err.code(), ErrorCode::CompilationFailed);
    assert!(!backend.is_compiled());
}

#[test]
fn test_short_thread_slices() {
    let (memory, _) = TruncatedMemory::new(usize::MAX, 8);
    let mut backend = batched_backend(memory);
    let err = backend.compile().unwrap_err();
    assert!(matches!(
        err,
        ContractionError::ThreadMemory { threads: 4, shortest: 8, required, .. } if required > 8
    ));
    assert!(!backend.is_compiled());
}

#[test]
fn test_thread_slices_checked_at_launch() {
    let (memory, max_slices) = TruncatedMemory::new(usize::MAX, usize::MAX);
    let mut backend = batched_backend(memory);
    backend.compile().unwrap();
    assert_eq!(backend.num_threads(), 4);

    max_slices.store(1, Ordering::SeqCst);
    let left = vec![1.0f64; 32];
    let right = vec![1.0f64; 48];
    let mut out = vec![0.0f64; 24];
    let err = backend.contract(&left, &right, None, &mut out).unwrap_err();
    assert!(matches!(err, ContractionError::ThreadMemory { threads: 4, slices: 1, .. }));
    assert_eq!(out, vec![0.0; 24]);

    max_slices.store(usize::MAX, Ordering::SeqCst);
    backend.contract(&left, &right, None, &mut out).unwrap();
    assert_eq!(out, vec![4.0; 24]);
}
