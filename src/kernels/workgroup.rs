// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Lock-step workgroup emulation.
//!
//! A workgroup is [`NUM_WARPS`] warps of [`WARP_SIZE`] lanes. Lanes only
//! communicate through [`SharedMemory`] separated by [`Workgroup::barrier`],
//! or inside a warp through butterfly shuffles ([`warp_all_reduce`]).
//!
//! Barrier uniformity is enforced by the borrow checker: a barrier needs
//! `&mut Workgroup`, while per-thread and per-warp bodies only get `&self`,
//! so no lane can reach a barrier the others skip.
//!
//! Shared memory records the barrier epoch and thread of the last write to
//! every slot. In debug builds, reading or overwriting a slot that another
//! thread wrote in the same epoch (a missing barrier) panics.

/// Lanes per warp.
pub const WARP_SIZE: usize = 64;

/// Warps per workgroup.
pub const NUM_WARPS: usize = 4;

/// Threads per workgroup.
pub const NUM_THREADS: usize = WARP_SIZE * NUM_WARPS;

/// Xor masks of the butterfly all-reduce, widest first.
pub const SHUFFLE_XOR_MASKS: [usize; 6] = [32, 16, 8, 4, 2, 1];

/// One thread of a workgroup, valid for a single barrier epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread {
    /// Warp index in `0..NUM_WARPS`.
    pub warp: usize,
    /// Lane index in `0..WARP_SIZE`.
    pub lane: usize,
    epoch: u32,
}

impl Thread {
    /// Flat thread index in `0..NUM_THREADS`.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.warp * WARP_SIZE + self.lane
    }
}

/// One warp acting collectively, valid for a single barrier epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Warp {
    /// Warp index in `0..NUM_WARPS`.
    pub index: usize,
    epoch: u32,
}

impl Warp {
    /// The thread at `lane` of this warp.
    #[must_use]
    pub const fn lane(&self, lane: usize) -> Thread {
        Thread {
            warp: self.index,
            lane,
            epoch: self.epoch,
        }
    }

    /// Lane 0, which issues warp-wide operand fetches.
    #[must_use]
    pub const fn leader(&self) -> Thread {
        self.lane(0)
    }
}

/// Execution context of a single workgroup.
#[derive(Debug, Default)]
pub struct Workgroup {
    epoch: u32,
}

impl Workgroup {
    /// Fresh workgroup at epoch 0.
    #[must_use]
    pub const fn new() -> Self {
        Self { epoch: 0 }
    }

    /// Current barrier epoch.
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Run `f` once per thread, warp-major.
    pub fn for_each_thread(&self, mut f: impl FnMut(Thread)) {
        for warp in 0..NUM_WARPS {
            for lane in 0..WARP_SIZE {
                f(Thread {
                    warp,
                    lane,
                    epoch: self.epoch,
                });
            }
        }
    }

    /// Run `f` once per warp.
    pub fn for_each_warp(&self, mut f: impl FnMut(Warp)) {
        for index in 0..NUM_WARPS {
            f(Warp {
                index,
                epoch: self.epoch,
            });
        }
    }

    /// Workgroup barrier: every write before it is visible to every thread
    /// after it.
    pub fn barrier(&mut self) {
        self.epoch += 1;
        tracing::trace!(epoch = self.epoch, "barrier");
    }
}

/// Workgroup-local scratch memory.
#[derive(Debug)]
pub struct SharedMemory<E> {
    data: Vec<E>,
    last_write: Vec<Option<(u32, usize)>>,
}

impl<E: Copy + Default> SharedMemory<E> {
    /// Zero-initialized scratch of `len` slots.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![E::default(); len],
            last_write: vec![None; len],
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the scratch has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write `value` to slot `idx` from `thread`.
    pub fn store(&mut self, thread: &Thread, idx: usize, value: E) {
        debug_assert!(
            !self.conflicts(thread, idx),
            "shared slot {idx} written twice in epoch {} (thread {})",
            thread.epoch,
            thread.id()
        );
        self.data[idx] = value;
        self.last_write[idx] = Some((thread.epoch, thread.id()));
    }

    /// Read slot `idx` from `thread`.
    #[must_use]
    pub fn load(&self, thread: &Thread, idx: usize) -> E {
        debug_assert!(
            !self.conflicts(thread, idx),
            "shared slot {idx} read by thread {} before a barrier (epoch {})",
            thread.id(),
            thread.epoch
        );
        self.data[idx]
    }

    fn conflicts(&self, thread: &Thread, idx: usize) -> bool {
        matches!(self.last_write[idx], Some((epoch, writer)) if epoch == thread.epoch && writer != thread.id())
    }
}

/// Butterfly all-reduce over the lanes of one warp.
///
/// After the call every lane holds `op` folded over all lanes.
pub fn warp_all_reduce(lanes: &mut [f32; WARP_SIZE], op: impl Fn(f32, f32) -> f32) {
    for mask in SHUFFLE_XOR_MASKS {
        let snapshot = *lanes;
        for (lane, value) in lanes.iter_mut().enumerate() {
            *value = op(snapshot[lane], snapshot[lane ^ mask]);
        }
    }
}

/// Warp-wide maximum.
#[must_use]
pub fn warp_max(mut lanes: [f32; WARP_SIZE]) -> f32 {
    warp_all_reduce(&mut lanes, f32::max);
    lanes[0]
}

/// Warp-wide sum.
#[must_use]
pub fn warp_sum(mut lanes: [f32; WARP_SIZE]) -> f32 {
    warp_all_reduce(&mut lanes, |a, b| a + b);
    lanes[0]
}
