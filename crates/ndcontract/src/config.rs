//! Compile-time configuration for the optimizer and the backend.

use crate::error::{ContractionError, Result};
use crate::types::PackedGemmSupport;

/// Tuning knobs of a contraction compile.
///
/// The defaults match a CPU with a 1 MiB L2 cache and a GEMM micro-kernel
/// that prefers `16 × 64` output tiles.
///
/// # Example
///
/// ```
/// use ndcontract::{ContractionConfig, PackedGemmSupport};
///
/// let config = ContractionConfig::default()
///     .with_threads(4)
///     .with_packed_gemm_support(PackedGemmSupport::None);
/// assert_eq!(config.num_threads, 4);
/// assert_eq!(config.target_m, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractionConfig {
    /// Target kernel size of the M dimension.
    pub target_m: i64,
    /// Target kernel size of the N dimension.
    pub target_n: i64,
    /// Target kernel size of the K dimension.
    pub target_k: i64,
    /// L2 cache size in bytes.
    pub l2_cache_size: i64,
    /// Number of threads; 0 selects the size of the current rayon pool.
    pub num_threads: usize,
    /// Parallelize M and N along a space-filling curve instead of flat.
    pub generate_sfcs: bool,
    /// Kernel provider supports batch-reduce GEMM.
    pub br_gemm_support: bool,
    /// Kernel provider support for a packed C dimension.
    pub packed_gemm_support: PackedGemmSupport,
    /// Size of the extra packing dimension used for transposed operands.
    pub target_extra_packing: i64,
    /// Size of the sequential K block peeled for L3 blocking.
    pub target_k_blocking: i64,
    /// Upper bound of cached packing slots per thread and operand.
    pub max_cached_slots: i64,
    /// Operands whose kernel strides are multiples of this are packed.
    pub aliasing_stride: i64,
}

impl Default for ContractionConfig {
    fn default() -> Self {
        Self {
            target_m: 16,
            target_n: 64,
            target_k: 256,
            l2_cache_size: 1024 * 1024,
            num_threads: 0,
            generate_sfcs: true,
            br_gemm_support: false,
            packed_gemm_support: PackedGemmSupport::AllStrideOne,
            target_extra_packing: 8,
            target_k_blocking: 64,
            max_cached_slots: 8,
            aliasing_stride: 2048,
        }
    }
}

impl ContractionConfig {
    pub fn with_targets(mut self, target_m: i64, target_n: i64, target_k: i64) -> Self {
        self.target_m = target_m;
        self.target_n = target_n;
        self.target_k = target_k;
        self
    }

    pub fn with_l2_cache_size(mut self, bytes: i64) -> Self {
        self.l2_cache_size = bytes;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_sfcs(mut self, generate_sfcs: bool) -> Self {
        self.generate_sfcs = generate_sfcs;
        self
    }

    pub fn with_br_gemm_support(mut self, support: bool) -> Self {
        self.br_gemm_support = support;
        self
    }

    pub fn with_packed_gemm_support(mut self, support: PackedGemmSupport) -> Self {
        self.packed_gemm_support = support;
        self
    }

    pub fn with_extra_packing(mut self, target: i64) -> Self {
        self.target_extra_packing = target;
        self
    }

    pub fn with_k_blocking(mut self, target: i64) -> Self {
        self.target_k_blocking = target;
        self
    }

    pub fn with_max_cached_slots(mut self, slots: i64) -> Self {
        self.max_cached_slots = slots;
        self
    }

    /// Checks that every target and bound is at least 1.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("target_m", self.target_m),
            ("target_n", self.target_n),
            ("target_k", self.target_k),
            ("target_extra_packing", self.target_extra_packing),
            ("target_k_blocking", self.target_k_blocking),
            ("max_cached_slots", self.max_cached_slots),
            ("aliasing_stride", self.aliasing_stride),
        ];
        match fields.into_iter().find(|&(_, value)| value < 1) {
            Some((field, value)) => Err(ContractionError::InvalidConfig { field, value }),
            None => Ok(()),
        }
    }

    /// Thread count with 0 resolved against the current rayon pool.
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads == 0 {
            rayon::current_num_threads().max(1)
        } else {
            self.num_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContractionConfig::default();
        assert_eq!((config.target_m, config.target_n, config.target_k), (16, 64, 256));
        assert_eq!(config.target_extra_packing, 8);
        assert_eq!(config.max_cached_slots, 8);
        assert!(config.generate_sfcs);
        assert!(!config.br_gemm_support);
    }

    #[test]
    fn test_validate() {
        assert!(ContractionConfig::default().validate().is_ok());

        let err = ContractionConfig::default().with_targets(16, 0, 256).validate().unwrap_err();
        assert!(matches!(err, ContractionError::InvalidConfig { field: "target_n", value: 0 }));

        let mut config = ContractionConfig::default();
        config.aliasing_stride = -1;
        assert!(matches!(
            config.validate().unwrap_err(),
            ContractionError::InvalidConfig { field: "aliasing_stride", .. }
        ));
    }

    #[test]
    fn test_resolved_threads() {
        assert_eq!(ContractionConfig::default().with_threads(3).resolved_threads(), 3);
        assert!(ContractionConfig::default().resolved_threads() >= 1);
    }
}
