//! Compiled execution of a binary contraction.
//!
//! # Overview
//!
//! [`ContractionBackend::compile`] turns a loop list (outermost first, ending
//! in the kernel loops) into a dispatch table with one handler per loop:
//!
//! ```text
//! SEQ   contract_iter           one loop, touch flags on K loops
//! OMP   contract_iter_parallel  whole OMP run, flat range per thread
//! SFC   contract_iter_sfc       whole SFC run, replays movement codes
//! PRIM  contract_iter_kernel    first touch, main kernel, last touch
//! ```
//!
//! Each handler receives the operand cursors for its level and calls the
//! handler of the next level. Packed operands are copied into thread-private
//! buffers by the handler directly in front of the packing loop.

use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::ContractionConfig;
use crate::error::{ContractionError, Result};
use crate::iteration_space::IterationSpace;
use crate::kernels::{FaerKernels, KernelFactory, KernelShape, MainKernel, TouchKernel};
use crate::memory::{MemoryManager, ThreadMemory};
use crate::optimizer::ContractionOptimizer;
use crate::packing::PackingKernel;
use crate::scalar::Scalar;
use crate::types::{
    Cursor, DataType, DimKind, ExecKind, IterProperty, KernelType, OperandStrides, ThreadInfo,
};

/// Handler of one loop level.
type LoopFn = unsafe fn(&CompiledPlan, &mut ThreadContext<'_>, usize, Cursor, bool, bool);

/// Which input a packing plan belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Left,
    Right,
}

impl Operand {
    fn name(self) -> &'static str {
        match self {
            Operand::Left => "left",
            Operand::Right => "right",
        }
    }

    fn stride(self, iter: &IterProperty) -> i64 {
        match self {
            Operand::Left => iter.stride_left,
            Operand::Right => iter.stride_right,
        }
    }

    fn packing_stride(self, iter: &IterProperty) -> i64 {
        match self {
            Operand::Left => iter.packing_stride_left,
            Operand::Right => iter.packing_stride_right,
        }
    }
}

/// Packing of one input operand.
#[derive(Debug)]
struct Packing {
    /// Loop whose handler input is the packed buffer.
    loop_id: usize,
    /// Buffer size of one slot in bytes.
    size_bytes: usize,
    kernel: PackingKernel,
}

/// Immutable state shared by all threads during a launch.
struct CompiledPlan {
    sizes: Vec<i64>,
    /// Byte strides; SFC loops hold movement offsets.
    strides: Vec<OperandStrides>,
    loop_fns: Vec<LoopFn>,
    num_omp_loops: usize,
    num_sfc_loops: usize,
    iteration_space: IterationSpace,
    packing_left: Option<Packing>,
    packing_right: Option<Packing>,
    num_cached_left: usize,
    num_cached_right: usize,
    first_touch: Option<Box<dyn TouchKernel>>,
    main: Box<dyn MainKernel>,
    last_touch: Option<Box<dyn TouchKernel>>,
    /// Element extents of left, right, out_aux and out.
    extents: [usize; 4],
    /// Scratch bytes per thread.
    reserved_bytes: usize,
}

impl CompiledPlan {
    fn packing_at(packing: &Option<Packing>, loop_id: usize) -> Option<&Packing> {
        packing.as_ref().filter(|packing| packing.loop_id == loop_id)
    }
}

/// Per-launch state of one thread.
struct ThreadContext<'a> {
    info: &'a mut ThreadInfo,
    memory_left: usize,
    memory_right: usize,
}

/// Compiler and executor of one binary contraction.
///
/// # Example
///
/// ```
/// use ndcontract::{ContractionBackend, DataType, DimKind, ExecKind, IterProperty, KernelType};
///
/// // C(m,n) = A(m,k) * B(k,n), column-major, m = 2, n = 3, k = 4
/// let prim = |kind, size, l, r, o| IterProperty::new(kind, size, l, r, o).with_exec(ExecKind::Prim);
/// let iters = vec![
///     prim(DimKind::M, 2, 1, 0, 1),
///     prim(DimKind::N, 3, 0, 4, 2),
///     prim(DimKind::K, 4, 2, 1, 0),
/// ];
/// let mut backend = ContractionBackend::<ndcontract::FaerKernels>::init(
///     iters,
///     DataType::Fp64, DataType::Fp64, DataType::Fp64, DataType::Fp64,
///     KernelType::Zero, KernelType::Madd, KernelType::Undefined,
///     1, 1, 1,
/// );
/// backend.compile().unwrap();
///
/// let a = vec![1.0; 8];
/// let b = vec![2.0; 12];
/// let mut c = vec![-1.0; 6];
/// backend.contract(&a, &b, None, &mut c).unwrap();
/// assert_eq!(c, vec![8.0; 6]);
/// ```
pub struct ContractionBackend<F: KernelFactory = FaerKernels> {
    iters: Vec<IterProperty>,
    dtype_left: DataType,
    dtype_right: DataType,
    dtype_comp: DataType,
    dtype_out: DataType,
    kernel_first_touch: KernelType,
    kernel_main: KernelType,
    kernel_last_touch: KernelType,
    num_threads_omp: usize,
    num_threads_m: usize,
    num_threads_n: usize,
    max_cached_slots: i64,
    factory: F,
    memory: Box<dyn MemoryManager>,
    pool: Option<ThreadPool>,
    plan: Option<CompiledPlan>,
    thread_infos: Vec<ThreadInfo>,
}

impl<F: KernelFactory> ContractionBackend<F> {
    /// Creates an uncompiled backend for the loop list `iters`.
    ///
    /// `KernelType::Undefined` disables a touch kernel.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        iters: Vec<IterProperty>,
        dtype_left: DataType,
        dtype_right: DataType,
        dtype_comp: DataType,
        dtype_out: DataType,
        kernel_first_touch: KernelType,
        kernel_main: KernelType,
        kernel_last_touch: KernelType,
        num_threads_omp: usize,
        num_threads_m: usize,
        num_threads_n: usize,
    ) -> Self {
        Self {
            iters,
            dtype_left,
            dtype_right,
            dtype_comp,
            dtype_out,
            kernel_first_touch,
            kernel_main,
            kernel_last_touch,
            num_threads_omp,
            num_threads_m,
            num_threads_n,
            max_cached_slots: ContractionConfig::default().max_cached_slots,
            factory: F::default(),
            memory: Box::new(ThreadMemory::new()),
            pool: None,
            plan: None,
            thread_infos: Vec::new(),
        }
    }

    /// Creates a backend from one array per loop attribute.
    ///
    /// Empty packing arrays mean no packing.
    #[allow(clippy::too_many_arguments)]
    pub fn init_from_arrays(
        dim_kinds: &[DimKind],
        exec_kinds: &[ExecKind],
        sizes: &[i64],
        strides_left: &[i64],
        strides_right: &[i64],
        strides_out_aux: &[i64],
        strides_out: &[i64],
        packing_strides_left: &[i64],
        packing_strides_right: &[i64],
        dtype_left: DataType,
        dtype_right: DataType,
        dtype_comp: DataType,
        dtype_out: DataType,
        kernel_first_touch: KernelType,
        kernel_main: KernelType,
        kernel_last_touch: KernelType,
        num_threads_omp: usize,
        num_threads_m: usize,
        num_threads_n: usize,
    ) -> Result<Self> {
        let num_loops = dim_kinds.len();
        let check = |field: &'static str, len: usize, optional: bool| {
            if len == num_loops || (optional && len == 0) {
                Ok(())
            } else {
                Err(ContractionError::LengthMismatch {
                    field,
                    expected: num_loops,
                    actual: len,
                })
            }
        };
        check("exec_kinds", exec_kinds.len(), false)?;
        check("sizes", sizes.len(), false)?;
        check("strides_left", strides_left.len(), false)?;
        check("strides_right", strides_right.len(), false)?;
        check("strides_out_aux", strides_out_aux.len(), false)?;
        check("strides_out", strides_out.len(), false)?;
        check("packing_strides_left", packing_strides_left.len(), true)?;
        check("packing_strides_right", packing_strides_right.len(), true)?;

        let iters = (0..num_loops)
            .map(|id| {
                IterProperty::new(
                    dim_kinds[id],
                    sizes[id],
                    strides_left[id],
                    strides_right[id],
                    strides_out[id],
                )
                .with_exec(exec_kinds[id])
                .with_out_aux(strides_out_aux[id])
                .with_packing(
                    packing_strides_left.get(id).copied().unwrap_or(0),
                    packing_strides_right.get(id).copied().unwrap_or(0),
                )
            })
            .collect();

        Ok(Self::init(
            iters,
            dtype_left,
            dtype_right,
            dtype_comp,
            dtype_out,
            kernel_first_touch,
            kernel_main,
            kernel_last_touch,
            num_threads_omp,
            num_threads_m,
            num_threads_n,
        ))
    }

    /// Optimizes `iters` with `config` and creates a backend for the result.
    ///
    /// `kernel_main` is `Madd` or `CpxMadd`; the optimizer may refine it.
    pub fn optimized(
        iters: Vec<IterProperty>,
        dtype: DataType,
        kernel_first_touch: KernelType,
        kernel_main: KernelType,
        kernel_last_touch: KernelType,
        config: &ContractionConfig,
    ) -> Result<Self> {
        let plan = ContractionOptimizer::new(iters, kernel_main, dtype, config).optimize()?;
        let mut backend = Self::init(
            plan.iters,
            dtype,
            dtype,
            dtype,
            dtype,
            kernel_first_touch,
            plan.kernel_main,
            kernel_last_touch,
            plan.num_threads_omp,
            plan.num_threads_m,
            plan.num_threads_n,
        );
        backend.max_cached_slots = config.max_cached_slots;
        Ok(backend)
    }

    /// Replaces the default [`ThreadMemory`] by `memory`.
    pub fn with_memory_manager(mut self, memory: Box<dyn MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    /// Loop list the backend was created with.
    pub fn iters(&self) -> &[IterProperty] {
        &self.iters
    }

    pub fn kernel_main(&self) -> KernelType {
        self.kernel_main
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    /// Number of threads of a launch, after clamping.
    pub fn num_threads(&self) -> usize {
        self.num_threads_omp * self.num_threads_m * self.num_threads_n
    }

    /// Per-thread task descriptors of the compiled plan.
    pub fn thread_infos(&self) -> &[ThreadInfo] {
        &self.thread_infos
    }

    /// Compiles the loop list; a second call is a no-op.
    pub fn compile(&mut self) -> Result<()> {
        if self.plan.is_some() {
            return Ok(());
        }

        let dtype = self.dtype_left;
        if [self.dtype_right, self.dtype_comp, self.dtype_out]
            .iter()
            .any(|&other| other != dtype)
        {
            return Err(ContractionError::UnsupportedDataTypes {
                left: self.dtype_left,
                right: self.dtype_right,
                comp: self.dtype_comp,
                out: self.dtype_out,
            });
        }
        for kernel in [self.kernel_first_touch, self.kernel_last_touch] {
            if kernel != KernelType::Undefined && !kernel.is_touch() {
                return Err(ContractionError::UnsupportedTouchKernel { kernel });
            }
        }
        if self.kernel_main.num_prims().is_none() {
            return Err(ContractionError::UnsupportedMainKernel {
                kernel: self.kernel_main,
            });
        }
        for (loop_id, iter) in self.iters.iter().enumerate() {
            if iter.size < 1 {
                return Err(ContractionError::InvalidSize {
                    loop_id,
                    kind: iter.dim_kind,
                    size: iter.size,
                });
            }
        }

        let shape = self.set_kernel_shape()?;
        debug!("kernel {:?} with shape {:?}", self.kernel_main, shape);

        let main = self.factory.main_kernel(self.kernel_main, &shape, dtype)?;
        let touch = |kernel: KernelType| -> Result<Option<Box<dyn TouchKernel>>> {
            if kernel == KernelType::Undefined {
                Ok(None)
            } else {
                self.factory.touch_kernel(kernel, &shape, dtype).map(Some)
            }
        };
        let first_touch = touch(self.kernel_first_touch)?;
        let last_touch = touch(self.kernel_last_touch)?;

        // fewer threads than parallel tasks
        let mut size_omp = 1;
        let mut size_sfc_m = 1;
        let mut size_sfc_n = 1;
        for iter in &self.iters {
            match (iter.exec_kind, iter.dim_kind) {
                (ExecKind::Omp, _) => size_omp *= iter.size,
                (ExecKind::Sfc, DimKind::M) => size_sfc_m *= iter.size,
                (ExecKind::Sfc, DimKind::N) => size_sfc_n *= iter.size,
                _ => {}
            }
        }
        self.num_threads_m = self.num_threads_m.clamp(1, size_sfc_m as usize);
        self.num_threads_n = self.num_threads_n.clamp(1, size_sfc_n as usize);
        self.num_threads_omp = self.num_threads_omp.clamp(1, size_omp as usize);
        let num_threads = self.num_threads();

        let num_bytes = dtype.num_bytes();
        let packing_left = self.create_packing(Operand::Left, num_bytes)?;
        let packing_right = self.create_packing(Operand::Right, num_bytes)?;

        let extents = self.element_extents();
        let mut strides: Vec<OperandStrides> = self
            .iters
            .iter()
            .map(|iter| iter.strides().scale(num_bytes))
            .collect();

        let iteration_space = IterationSpace::new(
            &self.iters,
            self.num_threads_m,
            self.num_threads_n,
            self.num_threads_omp,
        )?;
        let mut thread_infos = iteration_space.setup(&mut strides)?;

        let num_cached = iteration_space.get_caching_size(self.max_cached_slots);
        let num_cached_left = if packing_left.is_some() { num_cached } else { 0 };
        let num_cached_right = if packing_right.is_some() { num_cached } else { 0 };
        for info in &mut thread_infos {
            info.cached_ptrs_left = vec![None; num_cached_left];
            info.cached_ptrs_right = vec![None; num_cached_right];
        }

        let size_left = packing_left.as_ref().map_or(0, |p| p.size_bytes);
        let size_right = packing_right.as_ref().map_or(0, |p| p.size_bytes);
        let reserved = size_left * num_cached_left + size_right * num_cached_right;

        self.pool = if num_threads > 1 {
            Some(ThreadPoolBuilder::new().num_threads(num_threads).build()?)
        } else {
            None
        };

        self.memory.reserve_thread_memory(reserved, num_threads);
        match &self.pool {
            Some(pool) => pool.install(|| self.memory.alloc_all_memory()),
            None => self.memory.alloc_all_memory(),
        }
        check_thread_memory(self.memory.as_mut(), num_threads, reserved)?;

        let loop_fns: Vec<LoopFn> = self
            .iters
            .iter()
            .map(|iter| -> LoopFn {
                match iter.exec_kind {
                    ExecKind::Seq => contract_iter,
                    ExecKind::Omp => contract_iter_parallel,
                    ExecKind::Sfc => contract_iter_sfc,
                    ExecKind::Prim => contract_iter_kernel,
                }
            })
            .collect();

        debug!(
            "compiled {} loops: {} threads (omp={} m={} n={}), packing left={:?} right={:?}, {} cached slots, {} bytes per thread",
            self.iters.len(),
            num_threads,
            self.num_threads_omp,
            self.num_threads_m,
            self.num_threads_n,
            packing_left.as_ref().map(|p| p.loop_id),
            packing_right.as_ref().map(|p| p.loop_id),
            num_cached,
            reserved
        );

        self.plan = Some(CompiledPlan {
            sizes: self.iters.iter().map(|iter| iter.size).collect(),
            strides,
            loop_fns,
            num_omp_loops: iteration_space.omp_loops().len(),
            num_sfc_loops: iteration_space.num_sfc_loops(),
            iteration_space,
            packing_left,
            packing_right,
            num_cached_left,
            num_cached_right,
            first_touch,
            main,
            last_touch,
            extents,
            reserved_bytes: reserved,
        });
        self.thread_infos = thread_infos;
        Ok(())
    }

    /// Validates the trailing kernel loops and derives the kernel geometry.
    fn set_kernel_shape(&self) -> Result<KernelShape> {
        let kernel = self.kernel_main;
        let shape_error = |reason: String| ContractionError::KernelShape { kernel, reason };

        let num_prims = self
            .iters
            .iter()
            .rev()
            .take_while(|iter| iter.exec_kind == ExecKind::Prim)
            .count();
        let expected = kernel.num_prims().unwrap_or(0);
        if num_prims != expected {
            return Err(shape_error(format!(
                "expected {expected} trailing kernel loops, found {num_prims}"
            )));
        }

        let len = self.iters.len();
        let at = |offset: usize| &self.iters[len - offset];
        let (iter_m, iter_n, iter_k) = (at(3), at(2), at(1));
        if (iter_m.dim_kind, iter_n.dim_kind, iter_k.dim_kind) != (DimKind::M, DimKind::N, DimKind::K) {
            return Err(shape_error("kernel loops must be M, N, K".into()));
        }
        let slot4 = match kernel {
            KernelType::BrMadd => Some(DimKind::K),
            KernelType::PackedMadd | KernelType::CpxPackedMadd => Some(DimKind::C),
            KernelType::CpxMadd => Some(DimKind::Cpx),
            _ => None,
        };
        if let Some(kind) = slot4 {
            if at(4).dim_kind != kind {
                return Err(shape_error(format!("fourth kernel loop must be {kind:?}")));
            }
        }
        if kernel == KernelType::CpxPackedMadd && at(5).dim_kind != DimKind::Cpx {
            return Err(shape_error("fifth kernel loop must be CPX".into()));
        }

        let mut shape = KernelShape {
            m: iter_m.size,
            n: iter_n.size,
            k: iter_k.size,
            stride_m: iter_m.strides(),
            stride_n: iter_n.strides(),
            stride_k: iter_k.strides(),
            ..KernelShape::default()
        };
        if kernel == KernelType::BrMadd {
            shape.br = at(4).size;
            shape.stride_br = at(4).strides();
        }
        if matches!(kernel, KernelType::PackedMadd | KernelType::CpxPackedMadd) {
            shape.r = at(4).size;
            shape.stride_c = at(4).strides();
        }
        let r = shape.r;

        if shape.m == 1 || iter_m.stride_left == r || iter_m.stride_left == 1 {
            shape.trans_a = false;
            shape.lda = iter_k.stride_left;
        } else if shape.k == 1 || iter_k.stride_left == r || iter_k.stride_left == 1 {
            shape.trans_a = true;
            shape.lda = iter_m.stride_left;
        } else {
            return Err(shape_error("left operand has no unit stride in M or K".into()));
        }

        if shape.k == 1 || iter_k.stride_right == r || iter_k.stride_right == 1 {
            shape.trans_b = false;
            shape.ldb = iter_n.stride_right;
        } else if shape.n == 1 || iter_n.stride_right == r || iter_n.stride_right == 1 {
            shape.trans_b = true;
            shape.ldb = iter_k.stride_right;
        } else {
            return Err(shape_error("right operand has no unit stride in K or N".into()));
        }

        if shape.m == 1 || iter_m.stride_out == r {
            shape.ldc = iter_n.stride_out;
        } else {
            return Err(shape_error("output M stride must match the packed lanes".into()));
        }

        if shape.m == 1 || iter_m.stride_out_aux <= r {
            shape.stride_m_out_aux = iter_m.stride_out_aux;
            shape.stride_n_out_aux = iter_n.stride_out_aux;
        } else {
            return Err(shape_error("auxiliary M stride exceeds the packed lanes".into()));
        }

        // leading dimensions of size-1 loops
        if shape.k == 1 && !shape.trans_a {
            shape.lda = shape.m * r;
        }
        if shape.m == 1 && shape.trans_a {
            shape.lda = shape.k * r;
        }
        if shape.n == 1 && !shape.trans_b {
            shape.ldb = shape.k * r;
        }
        if shape.k == 1 && shape.trans_b {
            shape.ldb = shape.n * r;
        }
        if shape.n == 1 {
            shape.ldc = shape.m * r;
            shape.stride_n_out_aux = shape.m * r;
        }
        if shape.m == 1 {
            shape.stride_m_out_aux = r;
        }

        let cpx_slot = match kernel {
            KernelType::CpxMadd => Some(4),
            KernelType::CpxPackedMadd => Some(5),
            _ => None,
        };
        if let Some(slot) = cpx_slot {
            let iter_cpx = at(slot);
            if iter_cpx.size != 2 {
                return Err(ContractionError::InvalidCpxDim {
                    reason: format!("kernel complex dimension has size {}", iter_cpx.size),
                });
            }
            shape.cpx = 2;
            shape.stride_cpx = iter_cpx.strides();
        }

        Ok(shape)
    }

    /// Locates the packing loop of `operand` and builds its copy kernel.
    fn create_packing(&self, operand: Operand, num_bytes: i64) -> Result<Option<Packing>> {
        let mut packing_id: Option<usize> = None;
        let mut size = 0;
        for (loop_id, iter) in self.iters.iter().enumerate().rev() {
            if operand.packing_stride(iter) != 0 {
                packing_id = Some(loop_id);
                size += operand.stride(iter) * (iter.size - 1);
            }
            // packing unaffected by this loop moves outward
            if operand.stride(iter) == 0 && packing_id == Some(loop_id + 1) && !iter.is_parallel() {
                packing_id = Some(loop_id);
            }
        }
        let Some(loop_id) = packing_id else {
            return Ok(None);
        };

        let invalid = |id: usize, reason: &str| ContractionError::InvalidPacking {
            loop_id: id,
            operand: operand.name(),
            reason: reason.to_string(),
        };
        if loop_id > 0 && self.iters[loop_id - 1].exec_kind == ExecKind::Prim {
            return Err(invalid(loop_id, "packing loop inside the kernel loops"));
        }
        for (id, iter) in self.iters.iter().enumerate().skip(loop_id) {
            if iter.is_parallel() {
                return Err(invalid(id, "parallel loop inside the packed region"));
            }
            if operand.stride(iter) != 0 && operand.packing_stride(iter) == 0 {
                return Err(invalid(id, "unpacked loop inside the packed region"));
            }
        }

        let dims: Vec<(i64, i64, i64)> = self
            .iters
            .iter()
            .filter(|iter| operand.packing_stride(iter) != 0)
            .map(|iter| (iter.size, operand.packing_stride(iter), operand.stride(iter)))
            .collect();

        Ok(Some(Packing {
            loop_id,
            size_bytes: ((size + 1) * num_bytes) as usize,
            kernel: PackingKernel::new(&dims, num_bytes),
        }))
    }

    /// Elements reached by the plan in each operand.
    fn element_extents(&self) -> [usize; 4] {
        let extent = |stride: fn(&IterProperty) -> i64| -> usize {
            let reach: i64 = self
                .iters
                .iter()
                .map(|iter| stride(iter).abs() * (iter.size - 1))
                .sum();
            (reach + 1) as usize
        };
        [
            extent(|iter| {
                if iter.packing_stride_left != 0 {
                    iter.packing_stride_left
                } else {
                    iter.stride_left
                }
            }),
            extent(|iter| {
                if iter.packing_stride_right != 0 {
                    iter.packing_stride_right
                } else {
                    iter.stride_right
                }
            }),
            extent(|iter| iter.stride_out_aux),
            extent(|iter| iter.stride_out),
        ]
    }

    /// Contracts typed buffers after checking them against the compiled plan.
    ///
    /// `out_aux` is required when a touch kernel reads the auxiliary tensor.
    pub fn contract<T: Scalar>(
        &mut self,
        left: &[T],
        right: &[T],
        out_aux: Option<&[T]>,
        out: &mut [T],
    ) -> Result<()> {
        let num_threads = self.num_threads();
        let plan = self.plan.as_ref().ok_or(ContractionError::NotCompiled)?;
        if T::DATA_TYPE != self.dtype_out {
            return Err(ContractionError::DataTypeMismatch {
                expected: self.dtype_out,
                actual: T::DATA_TYPE,
            });
        }

        let [ext_left, ext_right, ext_aux, ext_out] = plan.extents;
        let check = |operand: &'static str, required: usize, actual: usize| {
            if actual < required {
                Err(ContractionError::BufferTooSmall {
                    operand,
                    required,
                    actual,
                })
            } else {
                Ok(())
            }
        };
        check("left", ext_left, left.len())?;
        check("right", ext_right, right.len())?;
        check("out", ext_out, out.len())?;

        let reads_aux = [self.kernel_first_touch, self.kernel_last_touch]
            .into_iter()
            .find(|kernel| kernel.reads_aux());
        let aux_ptr = match (out_aux, reads_aux) {
            (Some(aux), _) => {
                check("out_aux", ext_aux, aux.len())?;
                aux.as_ptr().cast::<u8>()
            }
            (None, Some(kernel)) => return Err(ContractionError::MissingAuxiliary { kernel }),
            (None, None) => std::ptr::null(),
        };
        check_thread_memory(self.memory.as_mut(), num_threads, plan.reserved_bytes)?;

        // SAFETY: all buffers cover the extents reached by the plan
        unsafe {
            self.contract_raw(
                left.as_ptr().cast(),
                right.as_ptr().cast(),
                aux_ptr,
                out.as_mut_ptr().cast(),
            );
        }
        Ok(())
    }

    /// Contracts raw buffers.
    ///
    /// Unlike [`contract`](Self::contract) this performs no checks. Calling
    /// it on an uncompiled backend is a caller error: debug builds panic,
    /// release builds return without touching `out`.
    ///
    /// # Safety
    ///
    /// Every pointer must be valid for all offsets reached by the compiled
    /// strides; `out_aux` may be null when no touch kernel reads it; `out`
    /// must not overlap the inputs. The memory manager must still hand out
    /// one slice of the reserved size per thread, as verified by `compile`.
    pub unsafe fn contract_raw(
        &mut self,
        left: *const u8,
        right: *const u8,
        out_aux: *const u8,
        out: *mut u8,
    ) {
        debug_assert!(self.plan.is_some(), "contract_raw on an uncompiled backend");
        let Some(plan) = self.plan.as_ref() else {
            return;
        };
        let base = Cursor::new(left, right, out_aux, out);
        let has_first_touch = plan.first_touch.is_some();
        let has_last_touch = plan.last_touch.is_some();
        let size_left = plan.packing_left.as_ref().map_or(0, |p| p.size_bytes) * plan.num_cached_left;

        let run = |(info, memory): (&mut ThreadInfo, &mut [u8])| {
            info.reset_caches();
            let memory_left = memory.as_mut_ptr() as usize;
            let mut ctx = ThreadContext {
                info,
                memory_left,
                memory_right: memory_left + size_left,
            };

            let mut cursor = base.advanced(&ctx.info.offset, 1);
            if let Some(packing) = CompiledPlan::packing_at(&plan.packing_left, 0) {
                // SAFETY: slot 0 holds one packed left operand
                unsafe { packing.kernel.execute(cursor.left_ptr(), ctx.memory_left as *mut u8) };
                cursor.left = ctx.memory_left;
            }
            if let Some(packing) = CompiledPlan::packing_at(&plan.packing_right, 0) {
                // SAFETY: slot 0 holds one packed right operand
                unsafe { packing.kernel.execute(cursor.right_ptr(), ctx.memory_right as *mut u8) };
                cursor.right = ctx.memory_right;
            }

            // SAFETY: the caller guarantees the operand extents
            unsafe { (plan.loop_fns[0])(plan, &mut ctx, 0, cursor, has_first_touch, has_last_touch) };
        };

        let memories = self.memory.thread_memory();
        debug_assert!(memories.len() >= self.thread_infos.len());
        match &self.pool {
            Some(pool) => pool.install(|| {
                self.thread_infos
                    .par_iter_mut()
                    .zip(memories)
                    .for_each(run)
            }),
            None => self.thread_infos.iter_mut().zip(memories).for_each(run),
        }
    }
}

impl ContractionBackend<FaerKernels> {
    /// Backend with the default kernel factory; see [`ContractionBackend::init`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        iters: Vec<IterProperty>,
        dtype: DataType,
        kernel_first_touch: KernelType,
        kernel_main: KernelType,
        kernel_last_touch: KernelType,
        num_threads_omp: usize,
        num_threads_m: usize,
        num_threads_n: usize,
    ) -> Self {
        Self::init(
            iters,
            dtype,
            dtype,
            dtype,
            dtype,
            kernel_first_touch,
            kernel_main,
            kernel_last_touch,
            num_threads_omp,
            num_threads_m,
            num_threads_n,
        )
    }
}

/// Requires one scratch slice of at least `required` bytes per thread.
fn check_thread_memory(memory: &mut dyn MemoryManager, threads: usize, required: usize) -> Result<()> {
    let slices = memory.thread_memory();
    let shortest = slices
        .iter()
        .take(threads)
        .map(|slice| slice.len())
        .min()
        .unwrap_or(0);
    if slices.len() < threads || shortest < required {
        return Err(ContractionError::ThreadMemory {
            threads,
            slices: slices.len(),
            required,
            shortest,
        });
    }
    Ok(())
}

/// Copies the operand slice at `src` into `slot` unless the slot already
/// holds it; returns the slot address.
///
/// # Safety
///
/// `memory` must hold `cached.len()` slots of `packing.size_bytes` bytes.
#[inline]
unsafe fn pack_cached(packing: &Packing, memory: usize, cached: &mut [Option<usize>], slot: usize, src: usize) -> usize {
    let dst = memory + slot * packing.size_bytes;
    if cached[slot] != Some(src) {
        unsafe { packing.kernel.execute(src as *const u8, dst as *mut u8) };
        cached[slot] = Some(src);
    }
    dst
}

unsafe fn contract_iter(
    plan: &CompiledPlan,
    ctx: &mut ThreadContext<'_>,
    loop_id: usize,
    mut cursor: Cursor,
    first_access: bool,
    last_access: bool,
) {
    let size = plan.sizes[loop_id];
    let next = loop_id + 1;
    let is_k = plan.iteration_space.dim_kind(loop_id) == DimKind::K;
    let packing_left = CompiledPlan::packing_at(&plan.packing_left, next);
    let packing_right = CompiledPlan::packing_at(&plan.packing_right, next);

    for it in 0..size {
        let first = first_access && (!is_k || it == 0);
        let last = last_access && (!is_k || it == size - 1);

        let mut active = cursor;
        if let Some(packing) = packing_left {
            unsafe { packing.kernel.execute(cursor.left_ptr(), ctx.memory_left as *mut u8) };
            active.left = ctx.memory_left;
        }
        if let Some(packing) = packing_right {
            unsafe { packing.kernel.execute(cursor.right_ptr(), ctx.memory_right as *mut u8) };
            active.right = ctx.memory_right;
        }

        unsafe { (plan.loop_fns[next])(plan, ctx, next, active, first, last) };
        cursor = cursor.advanced(&plan.strides[loop_id], 1);
    }
}

unsafe fn contract_iter_parallel(
    plan: &CompiledPlan,
    ctx: &mut ThreadContext<'_>,
    loop_id: usize,
    cursor: Cursor,
    first_access: bool,
    last_access: bool,
) {
    let next = loop_id + plan.num_omp_loops;
    let packing_left = CompiledPlan::packing_at(&plan.packing_left, next);
    let packing_right = CompiledPlan::packing_at(&plan.packing_right, next);

    for it in ctx.info.omp_begin..ctx.info.omp_end {
        let offset = plan.iteration_space.omp_offset(it, &plan.strides);
        let mut active = cursor.advanced(&offset, 1);

        if let Some(packing) = packing_left {
            active.left = unsafe {
                pack_cached(packing, ctx.memory_left, &mut ctx.info.cached_ptrs_left, 0, active.left)
            };
        }
        if let Some(packing) = packing_right {
            active.right = unsafe {
                pack_cached(packing, ctx.memory_right, &mut ctx.info.cached_ptrs_right, 0, active.right)
            };
        }

        unsafe { (plan.loop_fns[next])(plan, ctx, next, active, first_access, last_access) };
    }
}

unsafe fn contract_iter_sfc(
    plan: &CompiledPlan,
    ctx: &mut ThreadContext<'_>,
    loop_id: usize,
    mut cursor: Cursor,
    first_access: bool,
    last_access: bool,
) {
    let next = loop_id + plan.num_sfc_loops;
    let packing_left = CompiledPlan::packing_at(&plan.packing_left, next);
    let packing_right = CompiledPlan::packing_at(&plan.packing_right, next);

    let num_tasks = ctx.info.movement_ids.len();
    let size_k = ctx.info.sfc_size_k;
    let (mut id_m, mut id_n) = (0i64, 0i64);
    for it in 0..num_tasks {
        // visits of the current output cell decide the K boundary
        let cell = (id_m + id_n * ctx.info.sfc_size_m) as usize;
        let count = ctx.info.k_count[cell];
        let first = first_access && count == 0;
        let last = last_access && count == size_k - 1;
        ctx.info.k_count[cell] = (count + 1) % size_k;

        let mut active = cursor;
        if let Some(packing) = packing_left {
            let slot = id_m as usize % plan.num_cached_left;
            active.left = unsafe {
                pack_cached(packing, ctx.memory_left, &mut ctx.info.cached_ptrs_left, slot, cursor.left)
            };
        }
        if let Some(packing) = packing_right {
            let slot = id_n as usize % plan.num_cached_right;
            active.right = unsafe {
                pack_cached(packing, ctx.memory_right, &mut ctx.info.cached_ptrs_right, slot, cursor.right)
            };
        }

        unsafe { (plan.loop_fns[next])(plan, ctx, next, active, first, last) };

        if it + 1 < num_tasks {
            let movement = ctx.info.movement_ids[it];
            let direction = if movement & 1 == 1 { -1 } else { 1 };
            let moved_loop = (movement >> 1) as usize;
            match plan.iteration_space.dim_kind(moved_loop) {
                DimKind::M => id_m += direction,
                DimKind::N => id_n += direction,
                _ => {}
            }
            cursor = cursor.advanced(&plan.strides[moved_loop], direction);
        }
    }
}

unsafe fn contract_iter_kernel(
    plan: &CompiledPlan,
    _ctx: &mut ThreadContext<'_>,
    _loop_id: usize,
    cursor: Cursor,
    first_access: bool,
    last_access: bool,
) {
    unsafe {
        if first_access {
            if let Some(kernel) = &plan.first_touch {
                kernel.execute(cursor.out_aux_ptr(), cursor.out_ptr());
            }
        }
        plan.main
            .execute(cursor.left_ptr(), cursor.right_ptr(), cursor.out_ptr());
        if last_access {
            if let Some(kernel) = &plan.last_touch {
                kernel.execute(cursor.out_aux_ptr(), cursor.out_ptr());
            }
        }
    }
}
