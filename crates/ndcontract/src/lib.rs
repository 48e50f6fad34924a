//! ndcontract - binary tensor contraction compiler and scheduler
//!
//! A contraction `left, right -> out` is described by a flat list of loops
//! ([`IterProperty`]), each tagged with the operands it indexes
//! ([`DimKind`]) and how it is executed ([`ExecKind`]).
//!
//! # Architecture
//!
//! ```text
//! Level 1: Loop optimizer (optimizer module)
//!     → fuse, block, pick kernel loops, pack, parallelize
//!
//! Level 2: Iteration space (iteration_space module)
//!     → per-thread shares, Hilbert-curve task order, movement codes
//!
//! Level 3: Execution engine (backend module)
//!     → dispatch table of loop handlers, packing caches
//!     → kernels from a KernelFactory (ScalarKernels, FaerKernels)
//! ```
//!
//! # Example
//!
//! ```
//! use ndcontract::{ContractionBackend, ContractionConfig, DataType, DimKind, IterProperty, KernelType};
//!
//! // C(m,n) = sum_k A(m,k) B(k,n), column-major
//! let (m, n, k) = (3, 4, 5);
//! let iters = vec![
//!     IterProperty::new(DimKind::M, m, 1, 0, 1),
//!     IterProperty::new(DimKind::N, n, 0, k, m),
//!     IterProperty::new(DimKind::K, k, m, 1, 0),
//! ];
//! let config = ContractionConfig::default().with_threads(1);
//! let mut backend: ContractionBackend = ContractionBackend::optimized(
//!     iters,
//!     DataType::Fp64,
//!     KernelType::Zero,
//!     KernelType::Madd,
//!     KernelType::Undefined,
//!     &config,
//! )
//! .unwrap();
//! backend.compile().unwrap();
//!
//! let a = vec![1.0; 15];
//! let b = vec![1.0; 20];
//! let mut c = vec![0.0; 12];
//! backend.contract(&a, &b, None, &mut c).unwrap();
//! assert!(c.iter().all(|&v| v == 5.0));
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod iteration_space;
pub mod kernels;
pub mod memory;
pub mod optimizer;
pub mod packing;
pub mod scalar;
pub mod sfc;
pub mod types;

pub use backend::ContractionBackend;
pub use config::ContractionConfig;
pub use error::{ContractionError, ErrorCode, Result};
pub use iteration_space::{IterationSpace, LoopRange};
pub use kernels::{FaerKernels, KernelFactory, KernelShape, MainKernel, ScalarKernels, TouchKernel};
pub use memory::{MemoryManager, ThreadMemory};
pub use optimizer::{ContractionOptimizer, OptimizedContraction};
pub use scalar::Scalar;
pub use types::{
    Cursor, DataType, DimKind, ExecKind, IterProperty, KernelType, OperandStrides,
    PackedGemmSupport, ThreadInfo,
};
