//! Scalar trait for contraction element types.

use faer_traits::ComplexField;
use std::fmt::Debug;
use std::ops::{Add, Mul, Sub};

use crate::types::DataType;

/// Trait for element types the backend can contract.
///
/// Wraps faer's `ComplexField` with the arithmetic the scalar kernels use
/// and the [`DataType`] tag the backend checks buffers against.
pub trait Scalar:
    ComplexField
    + Copy
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + 'static
{
    /// Tag matching this type.
    const DATA_TYPE: DataType;

    /// Returns the additive identity (zero).
    fn zero() -> Self {
        Self::default()
    }

    /// Returns the multiplicative identity (one).
    fn one() -> Self;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::Fp32;

    fn one() -> Self {
        1.0
    }
}

impl Scalar for f64 {
    const DATA_TYPE: DataType = DataType::Fp64;

    fn one() -> Self {
        1.0
    }
}
