//! Iteration model shared by the optimizer, the iteration space and the backend.
//!
//! A contraction `left, right -> out` (with an optional auxiliary output
//! tensor `out_aux`) is described by a flat list of [`IterProperty`] entries,
//! one per loop. The list is ordered outermost to innermost.

use std::ops::{Add, Mul, Neg, Sub};

/// Classification of a loop by the operands it indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DimKind {
    /// Batch dimension: left, right and out.
    C = 0,
    /// Left and out.
    M = 1,
    /// Right and out.
    N = 2,
    /// Reduction: left and right.
    K = 3,
    /// Real/imaginary pair of size 2.
    Cpx = 4,
    /// Left only.
    I = 5,
    /// Right only.
    J = 6,
    Undefined = 99,
}

/// How a loop is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecKind {
    /// Flat thread-parallel distribution.
    Omp = 0,
    /// Plain sequential loop.
    Seq = 1,
    /// Thread-parallel along a space-filling curve.
    Sfc = 2,
    /// Folded into the kernel call.
    Prim = 3,
}

/// Kernel tags for touch and main kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KernelType {
    Zero = 0,
    Relu = 1,
    Add = 2,
    Copy = 3,
    Madd = 4,
    CpxZero = 6,
    CpxAdd = 7,
    CpxMadd = 8,
    CpxCopy = 9,
    BrMadd = 12,
    PackedMadd = 13,
    CpxPackedMadd = 14,
    Undefined = 99,
}

impl KernelType {
    /// Number of trailing primitive loops the main kernel consumes.
    pub fn num_prims(self) -> Option<usize> {
        match self {
            KernelType::Madd => Some(3),
            KernelType::BrMadd | KernelType::CpxMadd | KernelType::PackedMadd => Some(4),
            KernelType::CpxPackedMadd => Some(5),
            _ => None,
        }
    }

    /// Whether the tag is a unary kernel usable as first or last touch.
    pub fn is_touch(self) -> bool {
        matches!(
            self,
            KernelType::Zero
                | KernelType::Relu
                | KernelType::Add
                | KernelType::Copy
                | KernelType::CpxZero
                | KernelType::CpxAdd
                | KernelType::CpxCopy
        )
    }

    /// Whether the touch kernel reads the auxiliary output tensor.
    pub fn reads_aux(self) -> bool {
        matches!(
            self,
            KernelType::Add | KernelType::Copy | KernelType::CpxAdd | KernelType::CpxCopy
        )
    }

    pub fn is_complex(self) -> bool {
        matches!(
            self,
            KernelType::CpxZero
                | KernelType::CpxAdd
                | KernelType::CpxMadd
                | KernelType::CpxCopy
                | KernelType::CpxPackedMadd
        )
    }
}

/// Element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Fp32 = 0,
    Fp64 = 1,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn num_bytes(self) -> i64 {
        match self {
            DataType::Fp32 => 4,
            DataType::Fp64 => 8,
        }
    }
}

/// Packed GEMM capability of the kernel provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackedGemmSupport {
    /// No packed C dimension.
    None,
    /// Packed C dimension has stride one in all operands.
    AllStrideOne,
    /// Packed C dimension has stride one in the output only.
    OutStrideOne,
}

/// Four strides or offsets, one per operand.
///
/// Used in element units by the optimizer and in byte units by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OperandStrides {
    pub left: i64,
    pub right: i64,
    pub out_aux: i64,
    pub out: i64,
}

impl OperandStrides {
    pub fn new(left: i64, right: i64, out_aux: i64, out: i64) -> Self {
        Self {
            left,
            right,
            out_aux,
            out,
        }
    }

    /// Multiplies every component by `factor`.
    pub fn scale(self, factor: i64) -> Self {
        self * factor
    }
}

impl Add for OperandStrides {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.left + rhs.left,
            self.right + rhs.right,
            self.out_aux + rhs.out_aux,
            self.out + rhs.out,
        )
    }
}

impl Sub for OperandStrides {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.left - rhs.left,
            self.right - rhs.right,
            self.out_aux - rhs.out_aux,
            self.out - rhs.out,
        )
    }
}

impl Mul<i64> for OperandStrides {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self {
        Self::new(
            self.left * rhs,
            self.right * rhs,
            self.out_aux * rhs,
            self.out * rhs,
        )
    }
}

impl Neg for OperandStrides {
    type Output = Self;

    fn neg(self) -> Self {
        self * -1
    }
}

/// Absolute byte addresses of the four operand streams.
///
/// Addresses are kept as integers so that cursors can cross thread
/// boundaries and so that the auxiliary stream may be null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub left: usize,
    pub right: usize,
    pub out_aux: usize,
    pub out: usize,
}

impl Cursor {
    pub fn new(left: *const u8, right: *const u8, out_aux: *const u8, out: *mut u8) -> Self {
        Self {
            left: left as usize,
            right: right as usize,
            out_aux: out_aux as usize,
            out: out as usize,
        }
    }

    /// Cursor moved by `strides × factor` bytes.
    #[inline]
    pub fn advanced(self, strides: &OperandStrides, factor: i64) -> Self {
        Self {
            left: self.left.wrapping_add_signed((strides.left * factor) as isize),
            right: self.right.wrapping_add_signed((strides.right * factor) as isize),
            out_aux: self
                .out_aux
                .wrapping_add_signed((strides.out_aux * factor) as isize),
            out: self.out.wrapping_add_signed((strides.out * factor) as isize),
        }
    }

    #[inline]
    pub fn left_ptr(&self) -> *const u8 {
        self.left as *const u8
    }

    #[inline]
    pub fn right_ptr(&self) -> *const u8 {
        self.right as *const u8
    }

    #[inline]
    pub fn out_aux_ptr(&self) -> *const u8 {
        self.out_aux as *const u8
    }

    #[inline]
    pub fn out_ptr(&self) -> *mut u8 {
        self.out as *mut u8
    }
}

/// Descriptor of one loop of the contraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterProperty {
    pub dim_kind: DimKind,
    pub exec_kind: ExecKind,
    pub size: i64,
    pub stride_left: i64,
    pub stride_right: i64,
    pub stride_out_aux: i64,
    pub stride_out: i64,
    /// Original left stride when the left operand is packed; 0 otherwise.
    pub packing_stride_left: i64,
    /// Original right stride when the right operand is packed; 0 otherwise.
    pub packing_stride_right: i64,
}

impl Default for IterProperty {
    fn default() -> Self {
        Self {
            dim_kind: DimKind::Undefined,
            exec_kind: ExecKind::Seq,
            size: 1,
            stride_left: 0,
            stride_right: 0,
            stride_out_aux: 0,
            stride_out: 0,
            packing_stride_left: 0,
            packing_stride_right: 0,
        }
    }
}

impl IterProperty {
    /// Sequential loop with the given strides; the auxiliary stride is 0.
    ///
    /// # Example
    ///
    /// ```
    /// use ndcontract::{DimKind, ExecKind, IterProperty};
    ///
    /// let m = IterProperty::new(DimKind::M, 8, 1, 0, 1);
    /// assert_eq!(m.exec_kind, ExecKind::Seq);
    /// assert_eq!(m.stride_out_aux, 0);
    /// ```
    pub fn new(dim_kind: DimKind, size: i64, stride_left: i64, stride_right: i64, stride_out: i64) -> Self {
        Self {
            dim_kind,
            size,
            stride_left,
            stride_right,
            stride_out,
            ..Self::default()
        }
    }

    pub fn with_exec(mut self, exec_kind: ExecKind) -> Self {
        self.exec_kind = exec_kind;
        self
    }

    pub fn with_out_aux(mut self, stride_out_aux: i64) -> Self {
        self.stride_out_aux = stride_out_aux;
        self
    }

    pub fn with_packing(mut self, packing_stride_left: i64, packing_stride_right: i64) -> Self {
        self.packing_stride_left = packing_stride_left;
        self.packing_stride_right = packing_stride_right;
        self
    }

    /// The four logical strides.
    pub fn strides(&self) -> OperandStrides {
        OperandStrides::new(
            self.stride_left,
            self.stride_right,
            self.stride_out_aux,
            self.stride_out,
        )
    }

    pub(crate) fn stride_sum(&self) -> i64 {
        self.stride_left + self.stride_right + self.stride_out
    }

    pub(crate) fn is_parallel(&self) -> bool {
        matches!(self.exec_kind, ExecKind::Omp | ExecKind::Sfc)
    }
}

/// Per-thread task descriptor produced by the iteration space.
#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    /// Byte offsets of the thread's first SFC task.
    pub offset: OperandStrides,
    /// Flat range of OMP tasks owned by the thread.
    pub omp_begin: i64,
    pub omp_end: i64,
    /// First SFC ids owned by the thread.
    pub sfc_begin_m: i64,
    pub sfc_begin_n: i64,
    /// Extent of the thread's SFC box.
    pub sfc_size_m: i64,
    pub sfc_size_n: i64,
    pub sfc_size_k: i64,
    /// `(loop_index << 1) | direction` per task; the last entry is padding.
    pub movement_ids: Vec<u8>,
    /// Visits per `(m, n)` cell, modulo `sfc_size_k`.
    pub k_count: Vec<i64>,
    /// Source addresses currently held by the left packing slots.
    pub cached_ptrs_left: Vec<Option<usize>>,
    /// Source addresses currently held by the right packing slots.
    pub cached_ptrs_right: Vec<Option<usize>>,
}

impl ThreadInfo {
    /// Number of kernel-level tasks of one pass over the thread's parallel share.
    pub fn num_tasks(&self) -> usize {
        (self.omp_end - self.omp_begin).max(0) as usize * self.movement_ids.len().max(1)
    }

    pub(crate) fn reset_caches(&mut self) {
        self.cached_ptrs_left.iter_mut().for_each(|p| *p = None);
        self.cached_ptrs_right.iter_mut().for_each(|p| *p = None);
        self.k_count.iter_mut().for_each(|c| *c = 0);
    }
}

/// Product of sizes per kind `C, M, N, K`.
pub fn size_per_kind(iters: &[IterProperty]) -> [i64; 4] {
    let mut sizes = [1; 4];
    for iter in iters {
        match iter.dim_kind {
            DimKind::C => sizes[0] *= iter.size,
            DimKind::M => sizes[1] *= iter.size,
            DimKind::N => sizes[2] *= iter.size,
            DimKind::K => sizes[3] *= iter.size,
            _ => {}
        }
    }
    sizes
}
