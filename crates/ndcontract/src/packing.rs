//! Strided copy into contiguous packing buffers.

use std::ptr;

/// One copy loop: `size` iterations, strides in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDim {
    pub size: i64,
    pub src_stride: i64,
    pub dst_stride: i64,
}

/// Copy of a strided operand slice into a packing buffer.
///
/// Loops are ordered by destination stride, outermost first. Neighbours that
/// are contiguous in both source and destination are fused, and an innermost
/// loop with unit strides in both is copied as one block.
#[derive(Debug, Clone)]
pub struct PackingKernel {
    dims: Vec<CopyDim>,
    /// Bytes copied per innermost step.
    block_bytes: usize,
}

impl PackingKernel {
    /// Builds the copy from `(size, src_stride, dst_stride)` loops in element
    /// units.
    ///
    /// # Example
    ///
    /// ```
    /// use ndcontract::packing::PackingKernel;
    ///
    /// // transpose a 2x3 column-major f64 matrix into row-major order
    /// let kernel = PackingKernel::new(&[(2, 1, 3), (3, 2, 1)], 8);
    /// let src = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
    /// let mut dst = [0.0f64; 6];
    /// unsafe { kernel.execute(src.as_ptr().cast(), dst.as_mut_ptr().cast()) };
    /// assert_eq!(dst, [1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    /// ```
    pub fn new(dims: &[(i64, i64, i64)], elem_bytes: i64) -> Self {
        let mut dims: Vec<CopyDim> = dims
            .iter()
            .filter(|(size, _, _)| *size > 1)
            .map(|&(size, src, dst)| CopyDim {
                size,
                src_stride: src * elem_bytes,
                dst_stride: dst * elem_bytes,
            })
            .collect();
        dims.sort_by(|a, b| b.dst_stride.cmp(&a.dst_stride));

        let mut fused: Vec<CopyDim> = Vec::with_capacity(dims.len());
        for dim in dims.into_iter().rev() {
            match fused.last_mut() {
                Some(inner)
                    if dim.src_stride == inner.src_stride * inner.size
                        && dim.dst_stride == inner.dst_stride * inner.size =>
                {
                    inner.size *= dim.size;
                }
                _ => fused.push(dim),
            }
        }
        fused.reverse();

        let mut block_bytes = elem_bytes as usize;
        if let Some(inner) = fused.last() {
            if inner.src_stride == elem_bytes && inner.dst_stride == elem_bytes {
                block_bytes *= inner.size as usize;
                fused.pop();
            }
        }

        Self {
            dims: fused,
            block_bytes,
        }
    }

    /// Copy loops after fusion, outermost first.
    pub fn dims(&self) -> &[CopyDim] {
        &self.dims
    }

    /// # Safety
    ///
    /// `src` and `dst` must be valid for every offset reached by the loops,
    /// and the two regions must not overlap.
    pub unsafe fn execute(&self, src: *const u8, dst: *mut u8) {
        unsafe { self.copy_level(0, src, dst) }
    }

    unsafe fn copy_level(&self, level: usize, src: *const u8, dst: *mut u8) {
        let Some(dim) = self.dims.get(level) else {
            unsafe { ptr::copy_nonoverlapping(src, dst, self.block_bytes) };
            return;
        };
        for it in 0..dim.size {
            unsafe {
                self.copy_level(
                    level + 1,
                    src.offset((it * dim.src_stride) as isize),
                    dst.offset((it * dim.dst_stride) as isize),
                );
            }
        }
    }
}
