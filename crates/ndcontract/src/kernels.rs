//! Micro-kernels invoked by the backend at the innermost loop level.
//!
//! The backend only sees opaque callables: a main kernel
//! `(left, right, out)` and touch kernels `(out_aux, out)`. Kernels are
//! created once per compile by a [`KernelFactory`] from the [`KernelShape`]
//! of the trailing `PRIM` loops.
//!
//! Two factories are provided:
//!
//! - [`ScalarKernels`]: plain strided loops for every kernel tag
//! - [`FaerKernels`]: `faer` GEMM for the real main kernels, scalar loops
//!   for everything else

use std::marker::PhantomData;

use faer::linalg::matmul::matmul;
use faer::{Accum, MatMut, MatRef, Par};

use crate::error::{ContractionError, Result};
use crate::scalar::Scalar;
use crate::types::{DataType, KernelType, OperandStrides};

/// Main kernel `out += left · right` over the kernel loops.
pub trait MainKernel: Send + Sync {
    /// # Safety
    ///
    /// The pointers must address the first element of the operand tiles
    /// described by the kernel shape, and `out` must not alias the inputs.
    unsafe fn execute(&self, left: *const u8, right: *const u8, out: *mut u8);
}

/// Unary kernel applied on the output tile.
pub trait TouchKernel: Send + Sync {
    /// # Safety
    ///
    /// `out` must address the output tile described by the kernel shape;
    /// `out_aux` must address the auxiliary tile when the kernel reads it.
    unsafe fn execute(&self, out_aux: *const u8, out: *mut u8);
}

/// Creates the kernels of a compiled contraction.
pub trait KernelFactory: Default + Send + Sync {
    fn main_kernel(
        &self,
        kernel: KernelType,
        shape: &KernelShape,
        dtype: DataType,
    ) -> Result<Box<dyn MainKernel>>;

    fn touch_kernel(
        &self,
        kernel: KernelType,
        shape: &KernelShape,
        dtype: DataType,
    ) -> Result<Box<dyn TouchKernel>>;
}

/// Geometry of the kernel loops.
///
/// Sizes and strides are in elements. `lda`, `ldb` and `ldc` are the leading
/// dimensions of a column-major GEMM view of the operands; the per-loop
/// strides describe the same tiles without that restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelShape {
    pub m: i64,
    pub n: i64,
    pub k: i64,
    /// Batch-reduce count.
    pub br: i64,
    /// Packed C lanes.
    pub r: i64,
    /// Complex planes, 1 or 2.
    pub cpx: i64,
    pub trans_a: bool,
    pub trans_b: bool,
    pub lda: i64,
    pub ldb: i64,
    pub ldc: i64,
    pub stride_m_out_aux: i64,
    pub stride_n_out_aux: i64,
    pub stride_m: OperandStrides,
    pub stride_n: OperandStrides,
    pub stride_k: OperandStrides,
    pub stride_br: OperandStrides,
    pub stride_c: OperandStrides,
    pub stride_cpx: OperandStrides,
}

impl Default for KernelShape {
    fn default() -> Self {
        Self {
            m: 1,
            n: 1,
            k: 1,
            br: 1,
            r: 1,
            cpx: 1,
            trans_a: false,
            trans_b: false,
            lda: 1,
            ldb: 1,
            ldc: 1,
            stride_m_out_aux: 0,
            stride_n_out_aux: 0,
            stride_m: OperandStrides::default(),
            stride_n: OperandStrides::default(),
            stride_k: OperandStrides::default(),
            stride_br: OperandStrides::default(),
            stride_c: OperandStrides::default(),
            stride_cpx: OperandStrides::default(),
        }
    }
}

/// Element-wise operation of a touch kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TouchOp {
    Zero,
    Relu,
    Copy,
    Add,
}

impl TouchOp {
    fn from_kernel(kernel: KernelType) -> Result<Self> {
        match kernel {
            KernelType::Zero | KernelType::CpxZero => Ok(TouchOp::Zero),
            KernelType::Relu => Ok(TouchOp::Relu),
            KernelType::Copy | KernelType::CpxCopy => Ok(TouchOp::Copy),
            KernelType::Add | KernelType::CpxAdd => Ok(TouchOp::Add),
            _ => Err(ContractionError::UnsupportedTouchKernel { kernel }),
        }
    }
}

#[inline]
unsafe fn at<T>(ptr: *const u8, offset: i64) -> *const T {
    unsafe { ptr.cast::<T>().offset(offset as isize) }
}

#[inline]
unsafe fn at_mut<T>(ptr: *mut u8, offset: i64) -> *mut T {
    unsafe { ptr.cast::<T>().offset(offset as isize) }
}

struct ScalarMadd<T> {
    shape: KernelShape,
    _marker: PhantomData<T>,
}

impl<T: Scalar> MainKernel for ScalarMadd<T> {
    unsafe fn execute(&self, left: *const u8, right: *const u8, out: *mut u8) {
        let s = &self.shape;
        for c in 0..s.r {
            for n in 0..s.n {
                for m in 0..s.m {
                    let mut acc = T::zero();
                    for br in 0..s.br {
                        for k in 0..s.k {
                            let l = c * s.stride_c.left
                                + m * s.stride_m.left
                                + br * s.stride_br.left
                                + k * s.stride_k.left;
                            let r = c * s.stride_c.right
                                + n * s.stride_n.right
                                + br * s.stride_br.right
                                + k * s.stride_k.right;
                            // SAFETY: offsets stay inside the tiles of the shape
                            acc = acc + unsafe { *at::<T>(left, l) * *at::<T>(right, r) };
                        }
                    }
                    let o = c * s.stride_c.out + m * s.stride_m.out + n * s.stride_n.out;
                    unsafe {
                        let dst = at_mut::<T>(out, o);
                        *dst = *dst + acc;
                    }
                }
            }
        }
    }
}

/// Complex multiply-add with real and imaginary planes `stride_cpx` apart.
struct ScalarCpxMadd<T> {
    shape: KernelShape,
    _marker: PhantomData<T>,
}

impl<T: Scalar> MainKernel for ScalarCpxMadd<T> {
    unsafe fn execute(&self, left: *const u8, right: *const u8, out: *mut u8) {
        let s = &self.shape;
        let cpx = s.stride_cpx;
        for c in 0..s.r {
            for n in 0..s.n {
                for m in 0..s.m {
                    let mut acc_re = T::zero();
                    let mut acc_im = T::zero();
                    for br in 0..s.br {
                        for k in 0..s.k {
                            let l = c * s.stride_c.left
                                + m * s.stride_m.left
                                + br * s.stride_br.left
                                + k * s.stride_k.left;
                            let r = c * s.stride_c.right
                                + n * s.stride_n.right
                                + br * s.stride_br.right
                                + k * s.stride_k.right;
                            let (ar, ai, br_, bi) = unsafe {
                                (
                                    *at::<T>(left, l),
                                    *at::<T>(left, l + cpx.left),
                                    *at::<T>(right, r),
                                    *at::<T>(right, r + cpx.right),
                                )
                            };
                            acc_re = acc_re + (ar * br_ - ai * bi);
                            acc_im = acc_im + (ar * bi + ai * br_);
                        }
                    }
                    let o = c * s.stride_c.out + m * s.stride_m.out + n * s.stride_n.out;
                    unsafe {
                        let re = at_mut::<T>(out, o);
                        *re = *re + acc_re;
                        let im = at_mut::<T>(out, o + cpx.out);
                        *im = *im + acc_im;
                    }
                }
            }
        }
    }
}

struct ScalarTouch<T> {
    op: TouchOp,
    shape: KernelShape,
    _marker: PhantomData<T>,
}

impl<T: Scalar> TouchKernel for ScalarTouch<T> {
    unsafe fn execute(&self, out_aux: *const u8, out: *mut u8) {
        let s = &self.shape;
        for plane in 0..s.cpx {
            for c in 0..s.r {
                for n in 0..s.n {
                    for m in 0..s.m {
                        let o = plane * s.stride_cpx.out
                            + c * s.stride_c.out
                            + n * s.stride_n.out
                            + m * s.stride_m.out;
                        let a = plane * s.stride_cpx.out_aux
                            + c * s.stride_c.out_aux
                            + n * s.stride_n_out_aux
                            + m * s.stride_m_out_aux;
                        unsafe {
                            let dst = at_mut::<T>(out, o);
                            *dst = match self.op {
                                TouchOp::Zero => T::zero(),
                                TouchOp::Relu if *dst < T::zero() => T::zero(),
                                TouchOp::Relu => *dst,
                                TouchOp::Copy => *at::<T>(out_aux, a),
                                TouchOp::Add => *dst + *at::<T>(out_aux, a),
                            };
                        }
                    }
                }
            }
        }
    }
}

fn check_complex(kernel: KernelType, shape: &KernelShape) -> Result<()> {
    if kernel.is_complex() && shape.cpx != 2 {
        return Err(ContractionError::InvalidCpxDim {
            reason: format!("kernel {:?} needs a complex dimension of size 2", kernel),
        });
    }
    Ok(())
}

/// Reference kernels written as plain strided loops.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarKernels;

impl ScalarKernels {
    fn typed_main<T: Scalar>(kernel: KernelType, shape: &KernelShape) -> Result<Box<dyn MainKernel>> {
        check_complex(kernel, shape)?;
        let shape = *shape;
        match kernel {
            KernelType::Madd | KernelType::BrMadd | KernelType::PackedMadd => {
                Ok(Box::new(ScalarMadd::<T> {
                    shape,
                    _marker: PhantomData,
                }))
            }
            KernelType::CpxMadd | KernelType::CpxPackedMadd => Ok(Box::new(ScalarCpxMadd::<T> {
                shape,
                _marker: PhantomData,
            })),
            _ => Err(ContractionError::UnsupportedMainKernel { kernel }),
        }
    }

    fn typed_touch<T: Scalar>(kernel: KernelType, shape: &KernelShape) -> Result<Box<dyn TouchKernel>> {
        check_complex(kernel, shape)?;
        Ok(Box::new(ScalarTouch::<T> {
            op: TouchOp::from_kernel(kernel)?,
            shape: *shape,
            _marker: PhantomData,
        }))
    }
}

impl KernelFactory for ScalarKernels {
    fn main_kernel(
        &self,
        kernel: KernelType,
        shape: &KernelShape,
        dtype: DataType,
    ) -> Result<Box<dyn MainKernel>> {
        match dtype {
            DataType::Fp32 => Self::typed_main::<f32>(kernel, shape),
            DataType::Fp64 => Self::typed_main::<f64>(kernel, shape),
        }
    }

    fn touch_kernel(
        &self,
        kernel: KernelType,
        shape: &KernelShape,
        dtype: DataType,
    ) -> Result<Box<dyn TouchKernel>> {
        match dtype {
            DataType::Fp32 => Self::typed_touch::<f32>(kernel, shape),
            DataType::Fp64 => Self::typed_touch::<f64>(kernel, shape),
        }
    }
}

/// GEMM through `faer` on strided matrix views, one call per (C, BR) pair.
struct FaerMadd<T> {
    shape: KernelShape,
    _marker: PhantomData<T>,
}

impl<T: Scalar> MainKernel for FaerMadd<T> {
    unsafe fn execute(&self, left: *const u8, right: *const u8, out: *mut u8) {
        let s = &self.shape;
        let (m, n, k) = (s.m as usize, s.n as usize, s.k as usize);
        for c in 0..s.r {
            let o = c * s.stride_c.out;
            // SAFETY: the output tile of lane c is addressed by the m and n strides
            let mut dst = unsafe {
                MatMut::from_raw_parts_mut(
                    at_mut::<T>(out, o),
                    m,
                    n,
                    s.stride_m.out as isize,
                    s.stride_n.out as isize,
                )
            };
            for br in 0..s.br {
                let l = c * s.stride_c.left + br * s.stride_br.left;
                let r = c * s.stride_c.right + br * s.stride_br.right;
                let (lhs, rhs) = unsafe {
                    (
                        MatRef::from_raw_parts(
                            at::<T>(left, l),
                            m,
                            k,
                            s.stride_m.left as isize,
                            s.stride_k.left as isize,
                        ),
                        MatRef::from_raw_parts(
                            at::<T>(right, r),
                            k,
                            n,
                            s.stride_k.right as isize,
                            s.stride_n.right as isize,
                        ),
                    )
                };
                matmul(dst.as_mut(), Accum::Add, lhs, rhs, T::one(), Par::Seq);
            }
        }
    }
}

/// Kernels backed by `faer` GEMM.
///
/// Complex and touch kernels fall back to [`ScalarKernels`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FaerKernels;

impl KernelFactory for FaerKernels {
    fn main_kernel(
        &self,
        kernel: KernelType,
        shape: &KernelShape,
        dtype: DataType,
    ) -> Result<Box<dyn MainKernel>> {
        if !matches!(
            kernel,
            KernelType::Madd | KernelType::BrMadd | KernelType::PackedMadd
        ) {
            return ScalarKernels.main_kernel(kernel, shape, dtype);
        }
        let shape = *shape;
        Ok(match dtype {
            DataType::Fp32 => Box::new(FaerMadd::<f32> {
                shape,
                _marker: PhantomData,
            }),
            DataType::Fp64 => Box::new(FaerMadd::<f64> {
                shape,
                _marker: PhantomData,
            }),
        })
    }

    fn touch_kernel(
        &self,
        kernel: KernelType,
        shape: &KernelShape,
        dtype: DataType,
    ) -> Result<Box<dyn TouchKernel>> {
        ScalarKernels.touch_kernel(kernel, shape, dtype)
    }
}
