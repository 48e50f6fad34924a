//! Loop optimizer for binary contractions.
//!
//! Turns an unordered list of [`IterProperty`] entries into a loop nest whose
//! innermost entries form the micro-kernel (`PRIM`), whose middle entries are
//! distributed over threads (`OMP`/`SFC`), and whose outer entries run
//! sequentially.
//!
//! # Passes
//!
//! ```text
//! remove_empty_iters
//! sort_and_fuse_iters            contiguous runs of one kind become one loop
//! set_primitive_iters            kernel M, N, K (+ C, BR, CPX) and packing
//! remove_empty_iters
//! reorder_and_parallelize_iters  SFC/OMP blocking, K blocking, stride order
//! thread split                   threads over m, n and omp
//! ```
//!
//! The product of sizes per dimension kind is unchanged by every pass.

use log::{debug, trace, warn};

use crate::config::ContractionConfig;
use crate::error::{ContractionError, Result};
use crate::types::{DataType, DimKind, ExecKind, IterProperty, KernelType, PackedGemmSupport};

const PRIM_BR: usize = 0;
const PRIM_C: usize = 1;
const PRIM_M: usize = 2;
const PRIM_N: usize = 3;
const PRIM_K: usize = 4;

/// Dimension kind installed for each kernel slot.
const PRIM_DIM_KINDS: [DimKind; 5] = [DimKind::K, DimKind::C, DimKind::M, DimKind::N, DimKind::K];

/// Loop nest produced by [`ContractionOptimizer::optimize`].
#[derive(Debug, Clone)]
pub struct OptimizedContraction {
    /// Loops, outermost first, ending in the kernel loops.
    pub iters: Vec<IterProperty>,
    /// Main kernel matching the trailing `PRIM` loops.
    pub kernel_main: KernelType,
    pub num_threads_m: usize,
    pub num_threads_n: usize,
    pub num_threads_omp: usize,
}

/// Optimizer state for one contraction.
///
/// # Example
///
/// ```
/// use ndcontract::{ContractionConfig, ContractionOptimizer, DataType, DimKind, ExecKind, IterProperty, KernelType};
///
/// // C(m,n) += A(m,k) * B(k,n), column-major, m = 64, n = 32, k = 128
/// let iters = vec![
///     IterProperty::new(DimKind::M, 64, 1, 0, 1),
///     IterProperty::new(DimKind::N, 32, 0, 128, 64),
///     IterProperty::new(DimKind::K, 128, 64, 1, 0),
/// ];
/// let config = ContractionConfig::default().with_threads(1);
/// let plan = ContractionOptimizer::new(iters, KernelType::Madd, DataType::Fp64, &config)
///     .optimize()
///     .unwrap();
///
/// let n = plan.iters.len();
/// assert!(plan.iters[n - 3..].iter().all(|it| it.exec_kind == ExecKind::Prim));
/// ```
#[derive(Debug, Clone)]
pub struct ContractionOptimizer {
    iters: Vec<IterProperty>,
    kernel_main: KernelType,
    config: ContractionConfig,
    num_threads: i64,
    num_bytes_out: i64,
    target_extra_packing: i64,
    size_sfc_m: i64,
    size_sfc_n: i64,
}

impl ContractionOptimizer {
    /// Creates an optimizer for `iters` with the requested main kernel
    /// (`Madd` or `CpxMadd`).
    pub fn new(
        iters: Vec<IterProperty>,
        kernel_main: KernelType,
        dtype_out: DataType,
        config: &ContractionConfig,
    ) -> Self {
        Self {
            iters,
            kernel_main,
            num_threads: config.resolved_threads() as i64,
            num_bytes_out: dtype_out.num_bytes(),
            target_extra_packing: config.target_extra_packing,
            config: config.clone(),
            size_sfc_m: 1,
            size_sfc_n: 1,
        }
    }

    /// Runs all passes and returns the optimized loop nest.
    pub fn optimize(mut self) -> Result<OptimizedContraction> {
        self.config.validate()?;
        for (loop_id, iter) in self.iters.iter().enumerate() {
            if iter.size < 1 {
                return Err(ContractionError::InvalidSize {
                    loop_id,
                    kind: iter.dim_kind,
                    size: iter.size,
                });
            }
        }

        self.remove_empty_iters();
        self.sort_and_fuse_iters();
        self.set_primitive_iters()?;
        self.remove_empty_iters();
        self.reorder_and_parallelize_iters();

        let (num_threads_m, num_threads_n, num_threads_omp) = self.split_threads();
        debug!(
            "optimized contraction: kernel {:?}, threads m={} n={} omp={}, {} loops",
            self.kernel_main,
            num_threads_m,
            num_threads_n,
            num_threads_omp,
            self.iters.len()
        );

        Ok(OptimizedContraction {
            iters: self.iters,
            kernel_main: self.kernel_main,
            num_threads_m,
            num_threads_n,
            num_threads_omp,
        })
    }

    /// Drops non-kernel loops of size one.
    fn remove_empty_iters(&mut self) {
        self.iters
            .retain(|iter| iter.size != 1 || iter.exec_kind == ExecKind::Prim);
    }

    /// Orders the loops by kind, then output stride, then right stride, and
    /// merges neighbours of the same kind that are contiguous in all operands.
    fn sort_and_fuse_iters(&mut self) {
        self.iters.sort_by(|a, b| b.stride_right.cmp(&a.stride_right));
        self.iters.sort_by(|a, b| b.stride_out.cmp(&a.stride_out));
        self.iters.sort_by(|a, b| a.dim_kind.cmp(&b.dim_kind));

        let mut id = 0;
        while id + 1 < self.iters.len() {
            let next = self.iters[id + 1];
            let cur = &mut self.iters[id];
            let size = next.size;
            if cur.dim_kind == next.dim_kind
                && next.stride_left * size == cur.stride_left
                && next.stride_right * size == cur.stride_right
                && next.stride_out * size == cur.stride_out
                && next.stride_out_aux * size == cur.stride_out_aux
            {
                cur.size *= size;
                cur.stride_left /= size;
                cur.stride_right /= size;
                cur.stride_out /= size;
                cur.stride_out_aux /= size;
                self.iters.remove(id + 1);
            } else {
                id += 1;
            }
        }
    }

    /// Last loops with the given strides in left, right and out.
    fn find_iters_with_stride(
        &self,
        stride_left: i64,
        stride_right: i64,
        stride_out: i64,
    ) -> (Option<usize>, Option<usize>, Option<usize>) {
        let mut found = (None, None, None);
        for (id, iter) in self.iters.iter().enumerate() {
            if iter.stride_left == stride_left {
                found.0 = Some(id);
            }
            if iter.stride_right == stride_right {
                found.1 = Some(id);
            }
            if iter.stride_out == stride_out {
                found.2 = Some(id);
            }
        }
        found
    }

    /// Loop of the given kind with the smallest stride sum.
    fn find_iter_with_dimtype(&self, kind: DimKind, exclude: Option<usize>) -> Option<usize> {
        let mut best = None;
        let mut min_stride = i64::MAX;
        for (id, iter) in self.iters.iter().enumerate() {
            if iter.dim_kind == kind && Some(id) != exclude && iter.stride_sum() < min_stride {
                best = Some(id);
                min_stride = iter.stride_sum();
            }
        }
        best
    }

    fn is_kind(&self, id: Option<usize>, kind: DimKind) -> bool {
        id.is_some_and(|id| self.iters[id].dim_kind == kind)
    }

    fn size_all_m_n(&self) -> (i64, i64) {
        self.iters.iter().fold((1, 1), |(m, n), iter| match iter.dim_kind {
            DimKind::M => (m * iter.size, n),
            DimKind::N => (m, n * iter.size),
            _ => (m, n),
        })
    }

    /// Selects the kernel loops, decides packing and installs the kernel at
    /// the tail of the loop list.
    fn set_primitive_iters(&mut self) -> Result<()> {
        if !matches!(self.kernel_main, KernelType::Madd | KernelType::CpxMadd) {
            return Err(ContractionError::UnsupportedMainKernel {
                kernel: self.kernel_main,
            });
        }

        // the complex dimension is kept aside and re-added as a kernel loop
        let complex_iter = match self.find_iter_with_dimtype(DimKind::Cpx, None) {
            Some(id) => {
                let iter = self.iters.remove(id);
                if iter.size != 2 || self.kernel_main != KernelType::CpxMadd {
                    return Err(ContractionError::InvalidCpxDim {
                        reason: format!(
                            "size {} with main kernel {:?}",
                            iter.size, self.kernel_main
                        ),
                    });
                }
                if self.find_iter_with_dimtype(DimKind::Cpx, None).is_some() {
                    return Err(ContractionError::InvalidCpxDim {
                        reason: "more than one complex dimension".into(),
                    });
                }
                Some(iter)
            }
            None if self.kernel_main == KernelType::CpxMadd => {
                return Err(ContractionError::InvalidCpxDim {
                    reason: "complex kernel without complex dimension".into(),
                });
            }
            None => None,
        };

        let mut packing_left = false;
        let mut packing_right = false;
        let mut extra_packing_left: Option<usize> = None;
        let mut extra_packing_right: Option<usize> = None;

        let mut iter_required = [false, false, true, true, true];
        let mut kernel_targets = [
            1,
            1,
            self.config.target_m,
            self.config.target_n,
            self.config.target_k,
        ];
        let mut potential_size = [1i64; 5];
        let mut potential_iter: [Option<usize>; 5] = [None; 5];

        // step 1: candidate kernel loops
        let mut transpose_a = false;
        let mut transpose_b = false;
        let (mut small_left, mut small_right, mut small_out) = self.find_iters_with_stride(1, 1, 1);

        if self.config.packed_gemm_support != PackedGemmSupport::None
            && self.is_kind(small_out, DimKind::C)
        {
            let c_id = small_out.unwrap_or_default();
            potential_iter[PRIM_C] = Some(c_id);
            potential_size[PRIM_C] = self.iters[c_id].size;

            let mut requires_new_left = false;
            let mut requires_new_right = false;
            if self.config.packed_gemm_support == PackedGemmSupport::AllStrideOne {
                if small_left != small_out {
                    packing_left = true;
                }
                if small_right != small_out {
                    packing_right = true;
                }
                requires_new_left = !packing_left;
                requires_new_right = !packing_right;
            }

            let c_size = self.iters[c_id].size;
            (small_left, small_right, small_out) = self.find_iters_with_stride(
                if requires_new_left { c_size } else { 1 },
                if requires_new_right { c_size } else { 1 },
                c_size,
            );
        }

        if self.is_kind(small_out, DimKind::M) {
            potential_iter[PRIM_M] = small_out;
            potential_size[PRIM_M] = small_out.map_or(1, |id| self.iters[id].size);
            if small_out != small_left {
                transpose_a = true;
            }
        }

        if self.is_kind(small_right, DimKind::N) {
            potential_iter[PRIM_N] = small_right;
            transpose_b = true;
        } else {
            potential_iter[PRIM_N] = self.find_iter_with_dimtype(DimKind::N, None);
        }
        potential_size[PRIM_N] = potential_iter[PRIM_N].map_or(1, |id| self.iters[id].size);

        if !transpose_b && self.is_kind(small_right, DimKind::K) {
            // right operand decides the K loop
            potential_iter[PRIM_K] = small_right;
            if transpose_a && small_left != small_right {
                packing_left = true;
                extra_packing_left = small_left;
            }
        } else if transpose_a && self.is_kind(small_left, DimKind::K) {
            // left operand decides the K loop
            potential_iter[PRIM_K] = small_left;
            if !transpose_b {
                packing_right = true;
                extra_packing_right = small_right;
            }
        } else if let Some(k_id) = self.find_iter_with_dimtype(DimKind::K, None) {
            potential_iter[PRIM_K] = Some(k_id);
            if transpose_a {
                packing_left = true;
                extra_packing_left = small_left;
            }
            if !transpose_b {
                packing_right = true;
                extra_packing_right = small_right;
            }
        }
        potential_size[PRIM_K] = potential_iter[PRIM_K].map_or(1, |id| self.iters[id].size);

        if self.config.br_gemm_support && potential_size[PRIM_C] <= 1 {
            if self.is_kind(extra_packing_left, DimKind::K) {
                potential_iter[PRIM_BR] = extra_packing_left.take();
                iter_required[PRIM_BR] = true;
            } else if self.is_kind(extra_packing_right, DimKind::K) {
                potential_iter[PRIM_BR] = extra_packing_right.take();
                iter_required[PRIM_BR] = true;
            } else if let Some(k_id) = potential_iter[PRIM_K] {
                potential_iter[PRIM_BR] = self.find_iter_with_dimtype(DimKind::K, Some(k_id));
            }
            potential_size[PRIM_BR] = potential_iter[PRIM_BR].map_or(1, |id| self.iters[id].size);
        }

        let extra_packing_left_required = extra_packing_left.is_some();
        let extra_packing_right_required = extra_packing_right.is_some();

        // step 2: kernel targets; strides on a cache-set multiple are packed
        let alias = self.config.aliasing_stride;
        let stride_of = |slot: usize, left: bool| {
            potential_iter[slot].map_or(1, |id| {
                if left {
                    self.iters[id].stride_left
                } else {
                    self.iters[id].stride_right
                }
            })
        };
        if potential_size[PRIM_K] > 1 && stride_of(PRIM_K, true) % alias == 0 {
            packing_left = true;
        }
        if potential_size[PRIM_M] > 1 && stride_of(PRIM_M, true) % alias == 0 {
            packing_left = true;
        }
        if potential_size[PRIM_K] > 1 && stride_of(PRIM_K, false) % alias == 0 {
            packing_right = true;
        }
        if potential_size[PRIM_N] > 1 && stride_of(PRIM_N, false) % alias == 0 {
            packing_right = true;
        }
        if transpose_a {
            packing_left = true;
        }
        debug!(
            "kernel candidates {:?} with sizes {:?}, transpose a={} b={}, packing left={} right={}",
            potential_iter, potential_size, transpose_a, transpose_b, packing_left, packing_right
        );

        self.set_kernel_targets_heuristic(&potential_size, &mut kernel_targets, &iter_required);
        debug!("kernel targets {:?}", kernel_targets);

        // step 3: split the candidates to their targets
        if let Some(id) = extra_packing_right {
            self.split_iter(id, self.target_extra_packing, ExecKind::Seq);
        }
        if let Some(id) = extra_packing_left {
            self.split_iter(id, self.target_extra_packing, ExecKind::Seq);
        }

        if let Some(mut iter) = complex_iter {
            iter.exec_kind = ExecKind::Prim;
            self.iters.push(iter);
            self.kernel_main = if kernel_targets[PRIM_C] > 1 {
                KernelType::CpxPackedMadd
            } else {
                KernelType::CpxMadd
            };
        } else if kernel_targets[PRIM_C] > 1 {
            self.kernel_main = KernelType::PackedMadd;
        } else if kernel_targets[PRIM_BR] > 1 {
            self.kernel_main = KernelType::BrMadd;
        }

        for prim_id in 0..5 {
            match potential_iter[prim_id] {
                Some(id) if kernel_targets[prim_id] > 1 => {
                    self.split_iter(id, kernel_targets[prim_id], ExecKind::Prim);
                }
                _ if iter_required[prim_id] => {
                    self.iters.push(IterProperty {
                        dim_kind: PRIM_DIM_KINDS[prim_id],
                        exec_kind: ExecKind::Prim,
                        ..IterProperty::default()
                    });
                }
                _ => {}
            }
        }

        if packing_left || packing_right {
            self.set_packing_strides(
                packing_left,
                packing_right,
                extra_packing_left_required,
                extra_packing_right_required,
            );
        }

        Ok(())
    }

    /// Replaces the kernel strides of packed operands by contiguous buffer
    /// strides and records the original strides as packing strides.
    fn set_packing_strides(
        &mut self,
        packing_left: bool,
        packing_right: bool,
        extra_left: bool,
        extra_right: bool,
    ) {
        // offsets from the end of the loop list
        let mut order: Vec<i64> = vec![-3, -2, -1];
        let mut next_id = -4;
        if matches!(
            self.kernel_main,
            KernelType::PackedMadd | KernelType::CpxPackedMadd
        ) {
            if self.config.packed_gemm_support == PackedGemmSupport::AllStrideOne {
                order.insert(0, next_id);
            } else {
                order.push(next_id);
            }
            next_id -= 1;
        }
        if self.kernel_main == KernelType::BrMadd {
            order.push(next_id);
            next_id -= 1;
        }
        if matches!(
            self.kernel_main,
            KernelType::CpxMadd | KernelType::CpxPackedMadd
        ) {
            order.push(next_id);
            next_id -= 1;
        }
        if extra_left {
            order.push(next_id);
            next_id -= 1;
        }
        if extra_right {
            order.push(next_id);
        }

        let len = self.iters.len() as i64;
        let mut stride_left = 1;
        let mut stride_right = 1;
        for offset in order {
            let Ok(id) = usize::try_from(len + offset) else {
                warn!("packing slot {offset} lies before the first of {len} loops");
                continue;
            };
            let iter = &mut self.iters[id];
            if iter.stride_left > 0 && packing_left {
                iter.packing_stride_left = iter.stride_left;
                iter.stride_left = stride_left;
                stride_left *= iter.size;
            }
            if iter.stride_right > 0 && packing_right {
                iter.packing_stride_right = iter.stride_right;
                iter.stride_right = stride_right;
                stride_right *= iter.size;
            }
        }
        trace!(
            "packing buffers: left {} elements, right {} elements",
            stride_left, stride_right
        );
    }

    /// Adapts kernel targets to the available loop sizes.
    ///
    /// Budget a candidate cannot use moves outward: K to BR, BR to M, M to N.
    fn set_kernel_targets_heuristic(
        &mut self,
        potential: &[i64; 5],
        targets: &mut [i64; 5],
        required: &[bool; 5],
    ) {
        if potential[PRIM_C] > 1 {
            targets[PRIM_C] = potential[PRIM_C];
        }
        if potential[PRIM_K] < targets[PRIM_K] {
            targets[PRIM_BR] *= targets[PRIM_K] / potential[PRIM_K];
            targets[PRIM_K] = potential[PRIM_K];
        }
        if potential[PRIM_BR] < targets[PRIM_BR] {
            targets[PRIM_M] *= targets[PRIM_BR] / potential[PRIM_BR];
            targets[PRIM_BR] = potential[PRIM_BR];
        }
        if potential[PRIM_M] < targets[PRIM_M] {
            targets[PRIM_N] *= targets[PRIM_M] / potential[PRIM_M];
            targets[PRIM_M] = potential[PRIM_M];
        }
        if potential[PRIM_N] < targets[PRIM_N] {
            targets[PRIM_N] = potential[PRIM_N];
        }

        // a BR loop that doubles as extra packing loop gets the packing size
        if required[PRIM_BR]
            && potential[PRIM_BR] > targets[PRIM_BR]
            && self.target_extra_packing > targets[PRIM_BR]
        {
            targets[PRIM_BR] = self.target_extra_packing;
        }

        // keep enough output tiles for all threads
        let (size_m, size_n) = self.size_all_m_n();
        let parallelism = size_m * size_n;
        while parallelism / (targets[PRIM_M] * targets[PRIM_N]) < self.num_threads
            && targets[PRIM_M] * targets[PRIM_N] > 1
        {
            if targets[PRIM_M] < targets[PRIM_N] {
                targets[PRIM_N] /= 2;
            } else {
                targets[PRIM_M] /= 2;
            }
        }

        // no reuse of packed panels: pack more per call
        if size_m / targets[PRIM_M] == 1 || size_n / targets[PRIM_N] == 1 {
            self.target_extra_packing *= 2;
        }
    }

    /// Splits loop `id` into an outer part that stays in place and an inner
    /// part of size `find_split(size, target)` appended to the list.
    fn split_iter(&mut self, id: usize, target: i64, exec_kind: ExecKind) {
        let split = find_split(self.iters[id].size, target);

        let mut inner = self.iters[id];
        inner.exec_kind = exec_kind;
        inner.size = split;
        self.iters.push(inner);

        let outer = &mut self.iters[id];
        outer.size /= split;
        outer.stride_left *= split;
        outer.stride_right *= split;
        outer.stride_out_aux *= split;
        outer.stride_out *= split;
    }

    /// Moves loops of `kind` out of the list until their sizes reach `target`.
    ///
    /// Returns the moved loops (larger strides first) and the product of their
    /// sizes.
    fn move_iters_until(&mut self, target: i64, kind: DimKind, exec_kind: ExecKind) -> (Vec<IterProperty>, i64) {
        let mut moved = Vec::new();
        let mut size_total = 1;
        let mut target_remaining = target;

        while target_remaining > 1 {
            let Some(mut id) = self.find_iter_with_dimtype(kind, None) else {
                break;
            };
            let size_iter = self.iters[id].size;
            if size_iter > target_remaining {
                self.split_iter(id, target_remaining, exec_kind);
                if self.iters[id].size == 1 {
                    self.iters.remove(id);
                }
                id = self.iters.len() - 1;
            }

            let mut iter = self.iters.remove(id);
            iter.exec_kind = exec_kind;
            size_total *= iter.size;
            moved.insert(0, iter);
            target_remaining /= size_iter;
        }

        (moved, size_total)
    }

    /// Assigns parallel loops and orders the remaining sequential loops.
    fn reorder_and_parallelize_iters(&mut self) {
        let (kernel_iters, rest): (Vec<_>, Vec<_>) = self.iters.drain(..).partition(|iter| {
            iter.exec_kind == ExecKind::Prim
                || iter.packing_stride_left > 0
                || iter.packing_stride_right > 0
        });
        self.iters = rest;

        let kernel_size_out: i64 = kernel_iters
            .iter()
            .filter(|iter| iter.dim_kind != DimKind::K)
            .map(|iter| iter.size)
            .product();

        // about half of L2 holds output tiles
        let target_thread_tasks =
            (self.config.l2_cache_size / 2 / (kernel_size_out * self.num_bytes_out)).max(1);
        let target_parallel = self.num_threads * target_thread_tasks;

        let (mut target_m, mut target_n) = self.size_all_m_n();
        while target_m * target_n > target_parallel {
            if target_m >= target_n {
                target_m /= 2;
            } else {
                target_n /= 2;
            }
        }
        let target_c = target_parallel / (target_m * target_n).max(1);
        trace!(
            "parallel targets m={} n={} c={} ({} tasks per thread)",
            target_m, target_n, target_c, target_thread_tasks
        );

        let parallel_kind = if self.config.generate_sfcs {
            ExecKind::Sfc
        } else {
            ExecKind::Omp
        };
        let (n_iters, size_n) = self.move_iters_until(target_n, DimKind::N, parallel_kind);
        let (m_iters, size_m) = self.move_iters_until(target_m, DimKind::M, parallel_kind);
        if self.config.generate_sfcs {
            self.size_sfc_m = size_m;
            self.size_sfc_n = size_n;
        }
        let (k_iters, _) =
            self.move_iters_until(self.config.target_k_blocking, DimKind::K, ExecKind::Seq);
        let (c_iters, _) = self.move_iters_until(target_c, DimKind::C, ExecKind::Omp);

        self.iters
            .sort_by(|a, b| b.stride_sum().cmp(&a.stride_sum()));

        self.iters.extend(k_iters);
        self.iters.extend(c_iters);
        self.iters.extend(n_iters);
        self.iters.extend(m_iters);
        self.iters.extend(kernel_iters);
    }

    /// Distributes the threads over the SFC axes, rest goes to OMP.
    fn split_threads(&self) -> (usize, usize, usize) {
        let num_threads = self.num_threads;
        let size_m = self.size_sfc_m;
        let size_n = self.size_sfc_n;

        let mut best_performance = 0.0;
        let mut best_threads_m = 1;
        for threads_m in divisors(num_threads) {
            let threads_n = num_threads / threads_m;
            let tasks_m = (size_m + threads_m - 1) / threads_m;
            let tasks_n = (size_n + threads_n - 1) / threads_n;
            let avg_task_m = size_m as f64 / threads_m as f64;
            let avg_task_n = size_n as f64 / threads_n as f64;

            // similar task counts in m and n, evenly filled threads
            let mut performance =
                1.0 - ((tasks_m - tasks_n).abs() as f64 / size_m.max(size_n) as f64);
            performance *= avg_task_m / tasks_m as f64;
            performance *= avg_task_n / tasks_n as f64;

            if best_performance < performance {
                best_performance = performance;
                best_threads_m = threads_m;
            }
        }

        let threads_m = best_threads_m.min(size_m).max(1);
        let threads_n = (num_threads / best_threads_m).min(size_n).max(1);
        let threads_omp = (num_threads / (threads_m * threads_n)).max(1);
        (threads_m as usize, threads_n as usize, threads_omp as usize)
    }
}

/// Divisors of `num` in pairs `(i, num / i)` for `i ≤ √num`.
fn divisors(num: i64) -> Vec<i64> {
    let mut result = Vec::new();
    let mut i = 1;
    while i * i <= num {
        if num % i == 0 {
            result.push(i);
            if i != num / i {
                result.push(num / i);
            }
        }
        i += 1;
    }
    result
}

/// Divisor of `dim_size` closest to `target` on a logarithmic scale.
///
/// # Examples
///
/// ```
/// use ndcontract::optimizer::find_split;
///
/// assert_eq!(find_split(2048, 16), 16);
/// assert_eq!(find_split(12, 5), 6);
/// assert_eq!(find_split(7, 4), 7);
/// ```
pub fn find_split(dim_size: i64, target: i64) -> i64 {
    let distance = |factor: i64| (factor as f64 / target as f64).ln().abs();

    let mut best_factor = dim_size;
    let mut best_distance = distance(dim_size);

    let mut i = 1;
    while i * i <= dim_size {
        if dim_size % i == 0 {
            for factor in [i, dim_size / i] {
                let d = distance(factor);
                if best_distance > d {
                    best_factor = factor;
                    best_distance = d;
                }
            }
        }
        i += 1;
    }

    best_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::size_per_kind;

    fn trailing_prims(iters: &[IterProperty]) -> Vec<IterProperty> {
        iters
            .iter()
            .rev()
            .take_while(|iter| iter.exec_kind == ExecKind::Prim)
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    fn check_kernel(plan: &OptimizedContraction) {
        let prims = trailing_prims(&plan.iters);
        assert_eq!(Some(prims.len()), plan.kernel_main.num_prims());
        let n = prims.len();
        assert_eq!(prims[n - 3].dim_kind, DimKind::M);
        assert_eq!(prims[n - 2].dim_kind, DimKind::N);
        assert_eq!(prims[n - 1].dim_kind, DimKind::K);
        for prim in &prims[n - 3..] {
            assert!(prim.size > 1, "kernel loop {:?} has size 1", prim);
        }
    }

    fn optimize(
        iters: Vec<IterProperty>,
        config: &ContractionConfig,
    ) -> OptimizedContraction {
        let before = size_per_kind(&iters);
        let plan = ContractionOptimizer::new(iters, KernelType::Madd, DataType::Fp32, config)
            .optimize()
            .unwrap();
        assert_eq!(before, size_per_kind(&plan.iters));
        plan
    }

    #[test]
    fn test_find_split() {
        assert_eq!(find_split(2048, 16), 16);
        assert_eq!(find_split(64, 64), 64);
        assert_eq!(find_split(128, 64), 64);
        assert_eq!(find_split(7, 4), 7);
        assert_eq!(find_split(12, 5), 6);
        assert_eq!(find_split(12, 1), 1);
    }

    #[test]
    fn test_divisors() {
        let mut d = divisors(72);
        d.sort();
        assert_eq!(d, vec![1, 2, 3, 4, 6, 8, 9, 12, 18, 24, 36, 72]);
        assert_eq!(divisors(1), vec![1]);
    }

    #[test]
    fn test_sort_and_fuse() {
        let iters = vec![
            IterProperty::new(DimKind::M, 32, 8, 0, 8),
            IterProperty::new(DimKind::K, 64, 256, 1, 0),
            IterProperty::new(DimKind::M, 2, 1, 0, 1),
            IterProperty::new(DimKind::N, 128, 0, 64, 256),
            IterProperty::new(DimKind::M, 4, 2, 0, 2),
        ];
        let config = ContractionConfig::default().with_threads(1);
        let mut opt = ContractionOptimizer::new(iters, KernelType::Madd, DataType::Fp32, &config);
        opt.sort_and_fuse_iters();

        assert_eq!(opt.iters.len(), 3);
        assert_eq!(opt.iters[0], IterProperty::new(DimKind::M, 256, 1, 0, 1));
        assert_eq!(opt.iters[1].dim_kind, DimKind::N);
        assert_eq!(opt.iters[2].dim_kind, DimKind::K);
    }

    #[test]
    fn test_split_iter() {
        let config = ContractionConfig::default().with_threads(1);
        let mut opt = ContractionOptimizer::new(
            vec![IterProperty::new(DimKind::M, 24, 2, 0, 3)],
            KernelType::Madd,
            DataType::Fp32,
            &config,
        );
        opt.split_iter(0, 4, ExecKind::Prim);
        assert_eq!(opt.iters[0].size, 6);
        assert_eq!(opt.iters[0].stride_left, 8);
        assert_eq!(opt.iters[0].stride_out, 12);
        assert_eq!(opt.iters[1].size, 4);
        assert_eq!(opt.iters[1].stride_left, 2);
        assert_eq!(opt.iters[1].exec_kind, ExecKind::Prim);
    }

    #[test]
    fn test_simple_contraction() {
        let iters = vec![
            IterProperty::new(DimKind::M, 32, 8, 0, 8),
            IterProperty::new(DimKind::K, 64, 256, 1, 0),
            IterProperty::new(DimKind::M, 2, 1, 0, 1),
            IterProperty::new(DimKind::N, 128, 0, 64, 256),
            IterProperty::new(DimKind::M, 4, 2, 0, 2),
        ];
        let config = ContractionConfig::default()
            .with_threads(1)
            .with_sfcs(false);
        let plan = optimize(iters, &config);
        check_kernel(&plan);
        assert_eq!(plan.kernel_main, KernelType::Madd);

        let n = plan.iters.len();
        assert_eq!(plan.iters[n - 3].size, 64);
        assert_eq!(plan.iters[n - 2].size, 64);
        assert_eq!(plan.iters[n - 1].size, 64);
        assert_eq!(
            (plan.num_threads_m, plan.num_threads_n, plan.num_threads_omp),
            (1, 1, 1)
        );
    }

    #[test]
    fn test_matmul_blocking_packs_aliasing_strides() {
        let iters = vec![
            IterProperty::new(DimKind::N, 2048, 0, 2048, 2048),
            IterProperty::new(DimKind::K, 2048, 2048, 1, 0),
            IterProperty::new(DimKind::M, 2048, 1, 0, 1),
        ];
        let config = ContractionConfig::default()
            .with_threads(72)
            .with_sfcs(false)
            .with_packed_gemm_support(PackedGemmSupport::None);
        let plan = optimize(iters, &config);
        check_kernel(&plan);

        let n = plan.iters.len();
        let (m, nn, k) = (plan.iters[n - 3], plan.iters[n - 2], plan.iters[n - 1]);
        assert_eq!((m.size, nn.size, k.size), (16, 64, 256));
        // left buffer is m-major, right buffer n-major
        assert_eq!((m.stride_left, k.stride_left), (1, 16));
        assert_eq!((k.packing_stride_left, k.packing_stride_right), (2048, 1));
        assert_eq!((nn.stride_right, k.stride_right), (1, 64));

        // K block, then flat parallel N and M
        assert_eq!(plan.iters[0].dim_kind, DimKind::K);
        assert_eq!(plan.iters[0].exec_kind, ExecKind::Seq);
        assert!(plan.iters[1..n - 3]
            .iter()
            .all(|iter| iter.exec_kind == ExecKind::Omp));
        assert_eq!(plan.num_threads_omp, 72);
    }

    #[test]
    fn test_transposed_kernel() {
        let iters = vec![
            IterProperty::new(DimKind::K, 64, 4096, 64, 0),
            IterProperty::new(DimKind::N, 64, 0, 1, 64),
            IterProperty::new(DimKind::K, 64, 1, 4096, 0),
            IterProperty::new(DimKind::M, 64, 64, 0, 1),
        ];
        let config = ContractionConfig::default()
            .with_threads(72)
            .with_sfcs(false)
            .with_packed_gemm_support(PackedGemmSupport::OutStrideOne);
        let plan = optimize(iters, &config);
        check_kernel(&plan);

        let n = plan.iters.len();
        let (m, nn, k) = (plan.iters[n - 3], plan.iters[n - 2], plan.iters[n - 1]);
        assert_eq!((m.size, nn.size, k.size), (4, 8, 64));
        // the transposed left operand is packed m-major
        assert_eq!(m.stride_left, 1);
        assert_eq!(m.packing_stride_left, 64);
        assert_eq!(k.stride_left, 4);
        assert_eq!(k.packing_stride_right, 4096);
    }

    #[test]
    fn test_sfc_assignment_order() {
        // C(m,n) += A(m,k) B(k,n) with m = n = 256, k = 64
        let iters = vec![
            IterProperty::new(DimKind::M, 256, 1, 0, 1),
            IterProperty::new(DimKind::N, 256, 0, 64, 256),
            IterProperty::new(DimKind::K, 64, 256, 1, 0),
        ];
        let config = ContractionConfig::default().with_threads(4);
        let plan = optimize(iters, &config);
        check_kernel(&plan);

        let parallel: Vec<_> = plan
            .iters
            .iter()
            .filter(|iter| iter.is_parallel())
            .collect();
        assert!(!parallel.is_empty());
        assert!(parallel.iter().all(|iter| iter.exec_kind == ExecKind::Sfc));
        let first_m = parallel.iter().position(|iter| iter.dim_kind == DimKind::M);
        let last_n = parallel.iter().rposition(|iter| iter.dim_kind == DimKind::N);
        if let (Some(first_m), Some(last_n)) = (first_m, last_n) {
            assert!(last_n < first_m);
        }
        assert_eq!(
            plan.num_threads_m * plan.num_threads_n * plan.num_threads_omp,
            4
        );
    }

    #[test]
    fn test_batched_packed_gemm() {
        // ckm,cnk->nmc with c = 4 innermost in the output
        let (c, m, n, k) = (4, 8, 6, 5);
        let iters = vec![
            IterProperty::new(DimKind::C, c, k * m, n * k, 1),
            IterProperty::new(DimKind::M, m, 1, 0, c),
            IterProperty::new(DimKind::N, n, 0, k, c * m),
            IterProperty::new(DimKind::K, k, m, 1, 0),
        ];
        let config = ContractionConfig::default().with_threads(1);
        let plan = optimize(iters, &config);
        assert_eq!(plan.kernel_main, KernelType::PackedMadd);
        check_kernel(&plan);

        let n_iters = plan.iters.len();
        let c_prim = plan.iters[n_iters - 4];
        assert_eq!(c_prim.dim_kind, DimKind::C);
        assert_eq!(c_prim.size, c);
        // both inputs are repacked with the C dimension innermost
        assert_eq!(c_prim.stride_left, 1);
        assert_eq!(c_prim.stride_right, 1);
    }

    #[test]
    fn test_br_gemm() {
        // two K loops: the smaller-stride one is the kernel K, the other BR
        let iters = vec![
            IterProperty::new(DimKind::M, 32, 1, 0, 1),
            IterProperty::new(DimKind::N, 32, 0, 16, 32),
            IterProperty::new(DimKind::K, 16, 32, 1, 0),
            IterProperty::new(DimKind::K, 8, 512, 512, 0),
        ];
        let config = ContractionConfig::default()
            .with_threads(1)
            .with_br_gemm_support(true);
        let plan = optimize(iters, &config);
        assert_eq!(plan.kernel_main, KernelType::BrMadd);
        check_kernel(&plan);
        let n = plan.iters.len();
        assert_eq!(plan.iters[n - 4].dim_kind, DimKind::K);
        assert!(plan.iters[n - 4].size > 1);
    }

    #[test]
    fn test_complex_dimension() {
        let iters = vec![
            IterProperty::new(DimKind::Cpx, 2, 64, 64, 64),
            IterProperty::new(DimKind::M, 8, 1, 0, 1),
            IterProperty::new(DimKind::N, 8, 0, 8, 8),
            IterProperty::new(DimKind::K, 8, 8, 1, 0),
        ];
        let config = ContractionConfig::default().with_threads(1);
        let plan = ContractionOptimizer::new(iters, KernelType::CpxMadd, DataType::Fp64, &config)
            .optimize()
            .unwrap();
        assert_eq!(plan.kernel_main, KernelType::CpxMadd);
        check_kernel(&plan);
        let n = plan.iters.len();
        assert_eq!(plan.iters[n - 4].dim_kind, DimKind::Cpx);
    }

    #[test]
    fn test_invalid_complex_dimension() {
        let config = ContractionConfig::default().with_threads(1);
        let iters = vec![
            IterProperty::new(DimKind::Cpx, 3, 64, 64, 64),
            IterProperty::new(DimKind::M, 8, 1, 0, 1),
            IterProperty::new(DimKind::N, 8, 0, 8, 8),
            IterProperty::new(DimKind::K, 8, 8, 1, 0),
        ];
        let err = ContractionOptimizer::new(iters.clone(), KernelType::CpxMadd, DataType::Fp64, &config)
            .optimize()
            .unwrap_err();
        assert!(matches!(err, ContractionError::InvalidCpxDim { .. }));

        let mut real = iters;
        real[0].size = 2;
        let err = ContractionOptimizer::new(real, KernelType::Madd, DataType::Fp64, &config)
            .optimize()
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidCpxDim);
    }

    #[test]
    fn test_invalid_main_kernel() {
        let config = ContractionConfig::default().with_threads(1);
        let iters = vec![IterProperty::new(DimKind::M, 8, 1, 0, 1)];
        let err = ContractionOptimizer::new(iters, KernelType::Relu, DataType::Fp64, &config)
            .optimize()
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CompilationFailed);
    }
}
