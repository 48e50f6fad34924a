//! Error types for ndcontract.

use thiserror::Error;

use crate::types::{DataType, DimKind, KernelType};

/// Numeric error taxonomy shared by all compile stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    CompilationFailed = 1,
    InvalidCpxDim = 2,
}

/// Errors that can occur while optimizing, compiling or launching a contraction.
#[derive(Debug, Error)]
pub enum ContractionError {
    /// Main kernel tag the optimizer or backend cannot handle.
    #[error("unsupported main kernel {kernel:?}")]
    UnsupportedMainKernel { kernel: KernelType },

    /// Touch kernel tag that is not a unary output kernel.
    #[error("unsupported touch kernel {kernel:?}")]
    UnsupportedTouchKernel { kernel: KernelType },

    /// Operand data types the backend cannot combine.
    #[error(
        "unsupported data type combination: left {left:?}, right {right:?}, comp {comp:?}, out {out:?}"
    )]
    UnsupportedDataTypes {
        left: DataType,
        right: DataType,
        comp: DataType,
        out: DataType,
    },

    /// Complex dimension with the wrong size, duplicated, or paired with a real kernel.
    #[error("invalid complex dimension: {reason}")]
    InvalidCpxDim { reason: String },

    /// Trailing primitive loops do not match the requested kernel.
    #[error("kernel shape mismatch for {kernel:?}: {reason}")]
    KernelShape { kernel: KernelType, reason: String },

    /// Parallel loops violate the contiguity or ordering precondition.
    #[error("invalid parallel loop layout at loop {loop_id}: {reason}")]
    ParallelLayout { loop_id: usize, reason: String },

    /// A thread received no work while partitioning the parallel loops.
    #[error("thread {thread_id} has an empty share of the {axis} axis")]
    EmptyThreadShare { thread_id: usize, axis: &'static str },

    /// Packing loop placed where no handler can pack.
    #[error("invalid packing loop {loop_id} for {operand} operand: {reason}")]
    InvalidPacking {
        loop_id: usize,
        operand: &'static str,
        reason: String,
    },

    /// Descriptor arrays of different lengths.
    #[error("descriptor length mismatch: expected {expected}, got {actual} for {field}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Dimension of kind `kind` with a non-positive size.
    #[error("dimension {loop_id} of kind {kind:?} has invalid size {size}")]
    InvalidSize {
        loop_id: usize,
        kind: DimKind,
        size: i64,
    },

    /// Configuration field below its minimum of 1.
    #[error("invalid configuration: {field} = {value}, must be at least 1")]
    InvalidConfig { field: &'static str, value: i64 },

    /// Memory manager handed out fewer or shorter thread slices than reserved.
    #[error(
        "thread memory too small: {slices} slices for {threads} threads, shortest {shortest} of {required} bytes"
    )]
    ThreadMemory {
        threads: usize,
        slices: usize,
        required: usize,
        shortest: usize,
    },

    /// `contract` was called before a successful `compile`.
    #[error("contraction has not been compiled")]
    NotCompiled,

    /// Buffer element type does not match the compiled data type.
    #[error("data type mismatch: compiled for {expected:?}, got {actual:?}")]
    DataTypeMismatch { expected: DataType, actual: DataType },

    /// Buffer shorter than the extent reached by the compiled plan.
    #[error("{operand} buffer too small: plan reaches {required} elements, got {actual}")]
    BufferTooSmall {
        operand: &'static str,
        required: usize,
        actual: usize,
    },

    /// Touch kernel reads the auxiliary tensor but none was supplied.
    #[error("touch kernel {kernel:?} requires an auxiliary output tensor")]
    MissingAuxiliary { kernel: KernelType },

    /// Worker pool construction failed.
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ContractionError {
    /// Maps the error onto the numeric taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            ContractionError::InvalidCpxDim { .. } => ErrorCode::InvalidCpxDim,
            _ => ErrorCode::CompilationFailed,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ContractionError>;
