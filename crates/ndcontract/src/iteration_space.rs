//! Partitioning of the parallel loops into per-thread task sequences.
//!
//! The parallel part of a loop nest is a run of `OMP` loops followed by a run
//! of `SFC` loops (N loops, then M loops, then optional K loops). Every thread
//! owns a contiguous range of the flat OMP index and a box of the SFC task
//! grid. The box is walked along a generalized Hilbert curve so that two
//! consecutive tasks differ by one step along one axis, which turns every
//! move into a single stride addition.
//!
//! # Movement codes
//!
//! A move is encoded in one byte as `(loop_index << 1) | direction`. The
//! loop index is the outermost loop whose digit changes; the stride stored
//! for that loop after [`IterationSpace::setup`] already compensates for the
//! inner loops wrapping around.

use std::ops::Range;

use log::debug;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::error::{ContractionError, Result};
use crate::sfc::{gilbert_d2xyz, serpentine_d2xyz};
use crate::types::{DimKind, ExecKind, IterProperty, OperandStrides, ThreadInfo};

/// Largest loop index a movement byte can carry.
const MAX_LOOP_ID: usize = (u8::MAX >> 1) as usize;

/// Half-open range of loop indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopRange {
    pub begin: usize,
    pub end: usize,
}

impl LoopRange {
    fn extend(&mut self, loop_id: usize) {
        if self.begin == self.end {
            self.begin = loop_id;
        }
        self.end = loop_id + 1;
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Loop indices, innermost first.
    fn inner_to_outer(&self) -> impl Iterator<Item = usize> {
        (self.begin..self.end).rev()
    }
}

/// Per-thread share of the parallel index space.
#[derive(Debug, Clone)]
struct ThreadShare {
    m: Range<i64>,
    n: Range<i64>,
    omp: Range<i64>,
}

/// Task partitioning of the parallel loops of one loop nest.
#[derive(Debug, Clone)]
pub struct IterationSpace {
    dim_kinds: Vec<DimKind>,
    sizes: Vec<i64>,
    num_threads_m: usize,
    num_threads_n: usize,
    num_threads_omp: usize,
    omp_loops: LoopRange,
    sfc_loops_m: LoopRange,
    sfc_loops_n: LoopRange,
    sfc_loops_k: LoopRange,
    omp_tasks: i64,
    sfc_tasks_m: i64,
    sfc_tasks_n: i64,
    sfc_tasks_k: i64,
}

impl IterationSpace {
    /// Validates the parallel layout of `iters` and records the loop runs.
    pub fn new(
        iters: &[IterProperty],
        num_threads_m: usize,
        num_threads_n: usize,
        num_threads_omp: usize,
    ) -> Result<Self> {
        let mut space = Self {
            dim_kinds: iters.iter().map(|iter| iter.dim_kind).collect(),
            sizes: iters.iter().map(|iter| iter.size).collect(),
            num_threads_m: num_threads_m.max(1),
            num_threads_n: num_threads_n.max(1),
            num_threads_omp: num_threads_omp.max(1),
            omp_loops: LoopRange::default(),
            sfc_loops_m: LoopRange::default(),
            sfc_loops_n: LoopRange::default(),
            sfc_loops_k: LoopRange::default(),
            omp_tasks: 1,
            sfc_tasks_m: 1,
            sfc_tasks_n: 1,
            sfc_tasks_k: 1,
        };

        let layout_error = |loop_id: usize, reason: &str| ContractionError::ParallelLayout {
            loop_id,
            reason: reason.to_string(),
        };

        let mut num_omp_loops = 0;
        let mut num_sfc_loops = 0;
        let mut sfc_first: Option<usize> = None;
        let mut last_sfc_stage = 0;
        for (loop_id, iter) in iters.iter().enumerate() {
            match iter.exec_kind {
                ExecKind::Omp => {
                    if iter.dim_kind == DimKind::K {
                        return Err(layout_error(loop_id, "OMP loop of kind K"));
                    }
                    num_omp_loops += 1;
                    space.omp_loops.extend(loop_id);
                    space.omp_tasks *= iter.size;
                }
                ExecKind::Sfc => {
                    let (stage, range, tasks) = match iter.dim_kind {
                        DimKind::N => (1, &mut space.sfc_loops_n, &mut space.sfc_tasks_n),
                        DimKind::M => (2, &mut space.sfc_loops_m, &mut space.sfc_tasks_m),
                        DimKind::K => (3, &mut space.sfc_loops_k, &mut space.sfc_tasks_k),
                        _ => return Err(layout_error(loop_id, "SFC loop must be of kind M, N or K")),
                    };
                    if stage < last_sfc_stage {
                        return Err(layout_error(loop_id, "SFC loops must be ordered N, M, K"));
                    }
                    last_sfc_stage = stage;
                    range.extend(loop_id);
                    *tasks *= iter.size;
                    num_sfc_loops += 1;
                    sfc_first.get_or_insert(loop_id);
                }
                _ => {}
            }
            if iter.is_parallel() && loop_id > MAX_LOOP_ID {
                return Err(layout_error(loop_id, "parallel loop index exceeds movement encoding"));
            }
        }

        if space.omp_loops.len() != num_omp_loops {
            return Err(layout_error(space.omp_loops.begin, "OMP loops are not contiguous"));
        }
        let sfc_len = space.sfc_loops_n.len() + space.sfc_loops_m.len() + space.sfc_loops_k.len();
        if let Some(first) = sfc_first {
            let last = [space.sfc_loops_n, space.sfc_loops_m, space.sfc_loops_k]
                .iter()
                .map(|range| range.end)
                .max()
                .unwrap_or(first);
            if sfc_len != num_sfc_loops || last - first != num_sfc_loops {
                return Err(layout_error(first, "SFC loops are not contiguous"));
            }
            if num_omp_loops > 0 && space.omp_loops.end != first {
                return Err(layout_error(first, "SFC loops must directly follow the OMP loops"));
            }
        }

        Ok(space)
    }

    pub fn omp_loops(&self) -> LoopRange {
        self.omp_loops
    }

    pub fn sfc_loops_m(&self) -> LoopRange {
        self.sfc_loops_m
    }

    pub fn sfc_loops_n(&self) -> LoopRange {
        self.sfc_loops_n
    }

    pub fn sfc_loops_k(&self) -> LoopRange {
        self.sfc_loops_k
    }

    /// Number of SFC loops of all kinds.
    pub fn num_sfc_loops(&self) -> usize {
        self.sfc_loops_n.len() + self.sfc_loops_m.len() + self.sfc_loops_k.len()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads_m * self.num_threads_n * self.num_threads_omp
    }

    /// Task counts `(omp, sfc_m, sfc_n, sfc_k)`.
    pub fn num_tasks(&self) -> (i64, i64, i64, i64) {
        (self.omp_tasks, self.sfc_tasks_m, self.sfc_tasks_n, self.sfc_tasks_k)
    }

    /// Builds the per-thread descriptors and converts the SFC strides of
    /// `strides` to movement offsets.
    ///
    /// `strides` holds one entry per loop. Thread offsets are computed from
    /// the strides as passed in.
    pub fn setup(&self, strides: &mut [OperandStrides]) -> Result<Vec<ThreadInfo>> {
        let raw: &[OperandStrides] = strides;
        let thread_infos = (0..self.num_threads())
            .into_par_iter()
            .map(|thread_id| self.thread_info(thread_id, raw))
            .collect::<Result<Vec<_>>>()?;

        self.convert_strides_to_offsets(strides);
        Ok(thread_infos)
    }

    /// Even share `[i * total / threads, (i + 1) * total / threads)`.
    fn axis_share(
        thread_id: usize,
        id: usize,
        threads: usize,
        total: i64,
        axis: &'static str,
    ) -> Result<Range<i64>> {
        let (id, threads) = (id as i64, threads as i64);
        let range = id * total / threads..(id + 1) * total / threads;
        if range.is_empty() {
            return Err(ContractionError::EmptyThreadShare { thread_id, axis });
        }
        Ok(range)
    }

    fn thread_share(&self, thread_id: usize) -> Result<ThreadShare> {
        let id_m = thread_id % self.num_threads_m;
        let rem = thread_id / self.num_threads_m;
        let id_n = rem % self.num_threads_n;
        let id_omp = rem / self.num_threads_n;

        Ok(ThreadShare {
            m: Self::axis_share(thread_id, id_m, self.num_threads_m, self.sfc_tasks_m, "m")?,
            n: Self::axis_share(thread_id, id_n, self.num_threads_n, self.sfc_tasks_n, "n")?,
            omp: Self::axis_share(thread_id, id_omp, self.num_threads_omp, self.omp_tasks, "omp")?,
        })
    }

    /// Absolute `(m, n, k)` SFC ids visited by a thread, in order.
    pub fn traversal(&self, thread_id: usize) -> Result<Vec<(i64, i64, i64)>> {
        let share = self.thread_share(thread_id)?;
        Ok(self.box_path(&share))
    }

    /// Curve through the thread's box with unit steps only.
    fn box_path(&self, share: &ThreadShare) -> Vec<(i64, i64, i64)> {
        let w = share.m.end - share.m.start;
        let h = share.n.end - share.n.start;
        let d = self.sfc_tasks_k;
        let to_absolute = |(x, y, z): (i64, i64, i64)| (share.m.start + x, share.n.start + y, z);

        let path: Vec<_> = (0..w * h * d)
            .map(|idx| gilbert_d2xyz(idx, w, h, d))
            .collect();
        let unit_steps = path.windows(2).all(|pair| {
            let (a, b) = (pair[0], pair[1]);
            (a.0 - b.0).abs() + (a.1 - b.1).abs() + (a.2 - b.2).abs() == 1
        });
        if unit_steps {
            return path.into_iter().map(to_absolute).collect();
        }

        debug!("curve on {w}x{h}x{d} box has a diagonal step, using serpentine order");
        (0..w * h * d)
            .map(|idx| to_absolute(serpentine_d2xyz(idx, w, h, d)))
            .collect()
    }

    fn thread_info(&self, thread_id: usize, strides: &[OperandStrides]) -> Result<ThreadInfo> {
        let share = self.thread_share(thread_id)?;
        let path = self.box_path(&share);

        let mut movement_ids = vec![0u8; path.len()];
        for (id, pair) in path.windows(2).enumerate() {
            let (old, new) = (pair[0], pair[1]);
            movement_ids[id] = if new.0 != old.0 {
                self.get_max_dim_jump(self.sfc_loops_m, new.0, old.0)
            } else if new.1 != old.1 {
                self.get_max_dim_jump(self.sfc_loops_n, new.1, old.1)
            } else {
                self.get_max_dim_jump(self.sfc_loops_k, new.2, old.2)
            };
        }

        let size_m = share.m.end - share.m.start;
        let size_n = share.n.end - share.n.start;
        Ok(ThreadInfo {
            offset: self.calculate_offset(share.m.start, share.n.start, 0, strides),
            omp_begin: share.omp.start,
            omp_end: share.omp.end,
            sfc_begin_m: share.m.start,
            sfc_begin_n: share.n.start,
            sfc_size_m: size_m,
            sfc_size_n: size_n,
            sfc_size_k: self.sfc_tasks_k,
            movement_ids,
            k_count: vec![0; (size_m * size_n) as usize],
            cached_ptrs_left: Vec::new(),
            cached_ptrs_right: Vec::new(),
        })
    }

    /// Movement code from SFC id `old` to `new` (`|new - old| == 1`) along the
    /// loops of `range`.
    ///
    /// The direction bit is 0 for a forward and 1 for a backward step. The
    /// loop is the innermost one whose digit of `max(old, new)` is nonzero.
    pub fn get_max_dim_jump(&self, range: LoopRange, new: i64, old: i64) -> u8 {
        let direction = ((old - new) + 1) >> 1;
        let mut max_id = new + direction;
        for loop_id in range.inner_to_outer() {
            let size = self.sizes[loop_id];
            let rem = max_id % size;
            max_id /= size;
            if rem != 0 {
                return ((loop_id << 1) as u8) | direction as u8;
            }
        }
        0
    }

    /// Offset of SFC ids `(m, n, k)` by mixed-radix decomposition over the
    /// loops of each axis.
    pub fn calculate_offset(&self, id_m: i64, id_n: i64, id_k: i64, strides: &[OperandStrides]) -> OperandStrides {
        [
            (self.sfc_loops_m, id_m),
            (self.sfc_loops_n, id_n),
            (self.sfc_loops_k, id_k),
        ]
        .into_iter()
        .fold(OperandStrides::default(), |acc, (range, id)| {
            acc + self.decompose(range, id, strides)
        })
    }

    /// Offset of the flat OMP id `id`.
    pub fn omp_offset(&self, id: i64, strides: &[OperandStrides]) -> OperandStrides {
        self.decompose(self.omp_loops, id, strides)
    }

    fn decompose(&self, range: LoopRange, mut id: i64, strides: &[OperandStrides]) -> OperandStrides {
        let mut offset = OperandStrides::default();
        for loop_id in range.inner_to_outer() {
            let size = self.sizes[loop_id];
            offset = offset + strides[loop_id] * (id % size);
            id /= size;
        }
        offset
    }

    /// Rewrites the SFC strides so that one movement step equals one addition.
    pub fn convert_strides_to_offsets(&self, strides: &mut [OperandStrides]) {
        for range in [self.sfc_loops_m, self.sfc_loops_n, self.sfc_loops_k] {
            let mut accumulated = OperandStrides::default();
            for loop_id in range.inner_to_outer() {
                let stride = strides[loop_id];
                strides[loop_id] = stride - accumulated;
                accumulated = accumulated + stride * (self.sizes[loop_id] - 1);
            }
        }
    }

    /// Packing slots per thread and operand.
    pub fn get_caching_size(&self, max_cached_slots: i64) -> usize {
        let tasks_m = (self.sfc_tasks_m + self.num_threads_m as i64 - 1) / self.num_threads_m as i64;
        let tasks_n = (self.sfc_tasks_n + self.num_threads_n as i64 - 1) / self.num_threads_n as i64;
        tasks_m.min(tasks_n).min(max_cached_slots).max(1) as usize
    }

    /// Dimension kind of loop `loop_id`.
    pub(crate) fn dim_kind(&self, loop_id: usize) -> DimKind {
        self.dim_kinds[loop_id]
    }
}
