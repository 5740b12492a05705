// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Mat4;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use hashbrown::HashMap;
use std::thread::ThreadId;
use sync::Mutex;

/// Upper bound on concurrently registered submission workers.
pub const MAX_FRAME_WORKERS: usize = 32;

/// Hard cap per region, in matrices. Exceeding it is a budget breach, not a
/// recoverable condition.
const HARD_REGION_CAP: u32 = 1 << 22;

const DEFAULT_BONE_CAPACITY: u32 = 4096;
const DEFAULT_TRANSFORM_CAPACITY: u32 = 8192;
const SCRATCH_INITIAL_CAPACITY: usize = 64;

/// One typed region of the main arena: storage plus a monotonic high-water
/// offset.
struct Region {
    data: Vec<Mat4>,
    offset: u32,
}

impl Region {
    fn with_capacity(capacity: u32) -> Self {
        Self {
            data: vec![Mat4::IDENTITY; capacity as usize],
            offset: 0,
        }
    }

    fn allocate(&mut self, count: u32, what: &str) -> Option<u32> {
        let offset = self.offset;
        let capacity = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        if count > capacity - offset {
            tracing::error!(
                target: "frame",
                what,
                count,
                offset,
                capacity,
                "frame arena region overflow"
            );
            return None;
        }
        self.offset = offset + count;
        Some(offset)
    }

    fn write(&mut self, offset: u32, data: &[Mat4], what: &str) {
        let end = offset as usize + data.len();
        if end > self.data.len() {
            tracing::error!(
                target: "frame",
                what,
                offset,
                count = data.len(),
                capacity = self.data.len(),
                "out of bounds frame arena write"
            );
            return;
        }
        self.data[offset as usize..end].copy_from_slice(data);
    }

    fn read(&self, offset: u32, count: u32) -> Vec<Mat4> {
        let end = (offset + count) as usize;
        assert!(end <= self.data.len(), "out of bounds frame arena read");
        self.data[offset as usize..end].to_vec()
    }

    /// Grows to hold `additional` more matrices past the current offset.
    fn grow_for(&mut self, additional: u32, what: &str) {
        let needed = self.offset + additional;
        if needed > HARD_REGION_CAP {
            tracing::error!(
                target: "frame",
                what,
                needed,
                cap = HARD_REGION_CAP,
                high_water = self.offset,
                "frame arena exceeded its hard cap"
            );
            std::process::abort();
        }
        if needed as usize > self.data.len() {
            self.data.resize(needed as usize, Mat4::IDENTITY);
        }
    }
}

/// Per-worker scratch: local offsets during parallel submission, global
/// offsets after the merge.
#[derive(Default)]
struct Scratch {
    bones: Vec<Mat4>,
    bone_count: u32,
    global_bone_offset: u32,
    transforms: Vec<Mat4>,
    transform_count: u32,
    global_transform_offset: u32,
}

impl Scratch {
    fn reset(&mut self) {
        self.bone_count = 0;
        self.global_bone_offset = 0;
        self.transform_count = 0;
        self.global_transform_offset = 0;
    }
}

/// Frame-local staging buffer for bone matrices and instance transforms.
///
/// Serial allocations bump per-region offsets under a mutex and return
/// global offsets directly. During parallel submission (between
/// [`prepare_parallel`](Self::prepare_parallel) and
/// [`merge_scratch`](Self::merge_scratch)) the main regions are untouched:
/// workers allocate out of private scratch regions and translate their local
/// offsets after the merge.
pub struct FrameArena {
    bones: Mutex<Region>,
    transforms: Mutex<Region>,
    parallel_active: AtomicBool,
    next_worker: AtomicU32,
    worker_map: Mutex<HashMap<ThreadId, u32>>,
    scratches: [Mutex<Scratch>; MAX_FRAME_WORKERS],
}

// === impl FrameArena ===

impl FrameArena {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BONE_CAPACITY, DEFAULT_TRANSFORM_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(bone_capacity: u32, transform_capacity: u32) -> Self {
        Self {
            bones: Mutex::new(Region::with_capacity(bone_capacity)),
            transforms: Mutex::new(Region::with_capacity(transform_capacity)),
            parallel_active: AtomicBool::new(false),
            next_worker: AtomicU32::new(0),
            worker_map: Mutex::new(HashMap::new()),
            scratches: [const { Mutex::new(Scratch::new()) }; MAX_FRAME_WORKERS],
        }
    }

    /// Resets all offsets for a new frame. Memory is kept.
    pub fn reset(&self) {
        self.bones.lock().offset = 0;
        self.transforms.lock().offset = 0;

        self.parallel_active.store(false, Ordering::Release);
        self.next_worker.store(0, Ordering::Relaxed);
        self.worker_map.lock().clear();
        for scratch in &self.scratches {
            scratch.lock().reset();
        }
    }

    // --- serial mode ---

    /// Reserves `count` bone matrices, returning their global offset, or
    /// `None` when the region is out of capacity.
    pub fn allocate_bones(&self, count: u32) -> Option<u32> {
        if count == 0 {
            return Some(0);
        }
        self.bones.lock().allocate(count, "bones")
    }

    /// Reserves `count` instance transforms, returning their global offset.
    pub fn allocate_transforms(&self, count: u32) -> Option<u32> {
        if count == 0 {
            return Some(0);
        }
        self.transforms.lock().allocate(count, "transforms")
    }

    pub fn write_bones(&self, offset: u32, data: &[Mat4]) {
        self.bones.lock().write(offset, data, "bones");
    }

    pub fn write_transforms(&self, offset: u32, data: &[Mat4]) {
        self.transforms.lock().write(offset, data, "transforms");
    }

    /// Copies `count` bone matrices out of the main arena.
    ///
    /// # Panics
    ///
    /// Panics when the range was never allocated.
    #[must_use]
    pub fn read_bones(&self, offset: u32, count: u32) -> Vec<Mat4> {
        self.bones.lock().read(offset, count)
    }

    /// Copies `count` transforms out of the main arena.
    ///
    /// # Panics
    ///
    /// Panics when the range was never allocated.
    #[must_use]
    pub fn read_transforms(&self, offset: u32, count: u32) -> Vec<Mat4> {
        self.transforms.lock().read(offset, count)
    }

    // --- statistics ---

    #[must_use]
    pub fn bone_count(&self) -> u32 {
        self.bones.lock().offset
    }

    #[must_use]
    pub fn transform_count(&self) -> u32 {
        self.transforms.lock().offset
    }

    #[must_use]
    pub fn bone_capacity(&self) -> usize {
        self.bones.lock().data.len()
    }

    #[must_use]
    pub fn transform_capacity(&self) -> usize {
        self.transforms.lock().data.len()
    }

    // --- parallel mode ---

    /// Enters parallel-submission mode: clears the scratch regions and the
    /// thread-to-worker map. The main arena must not be touched until
    /// [`merge_scratch`](Self::merge_scratch).
    pub fn prepare_parallel(&self) {
        for scratch in &self.scratches {
            scratch.lock().reset();
        }
        self.next_worker.store(0, Ordering::Relaxed);
        self.worker_map.lock().clear();
        self.parallel_active.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.parallel_active.load(Ordering::Acquire)
    }

    /// Registers the calling thread as a submission worker, returning its
    /// worker index. Stable across repeated calls from the same thread.
    ///
    /// Returns `None` when more than [`MAX_FRAME_WORKERS`] threads register.
    pub fn register_worker(&self) -> Option<u32> {
        let thread = std::thread::current().id();

        // The map lock covers the whole registration to keep lookup and
        // index assignment atomic.
        let mut map = self.worker_map.lock();
        if let Some(&index) = map.get(&thread) {
            return Some(index);
        }

        let index = self.next_worker.load(Ordering::Relaxed);
        if index as usize >= MAX_FRAME_WORKERS {
            tracing::error!(
                target: "frame",
                max = MAX_FRAME_WORKERS,
                "too many frame submission workers"
            );
            return None;
        }
        self.next_worker.store(index + 1, Ordering::Relaxed);
        map.insert(thread, index);
        Some(index)
    }

    /// Reserves `count` bone matrices in `worker`'s scratch, returning a
    /// scratch-relative offset. Grows the scratch by doubling.
    ///
    /// Returns `None` outside parallel mode.
    pub fn allocate_bones_parallel(&self, worker: u32, count: u32) -> Option<u32> {
        self.allocate_parallel(worker, count, |scratch| {
            (&mut scratch.bones, &mut scratch.bone_count)
        })
    }

    /// Reserves `count` transforms in `worker`'s scratch.
    ///
    /// Returns `None` outside parallel mode.
    pub fn allocate_transforms_parallel(&self, worker: u32, count: u32) -> Option<u32> {
        self.allocate_parallel(worker, count, |scratch| {
            (&mut scratch.transforms, &mut scratch.transform_count)
        })
    }

    fn allocate_parallel(
        &self,
        worker: u32,
        count: u32,
        select: impl FnOnce(&mut Scratch) -> (&mut Vec<Mat4>, &mut u32),
    ) -> Option<u32> {
        if !self.is_parallel() {
            tracing::error!(target: "frame", "parallel allocation outside a parallel scope");
            return None;
        }
        assert!((worker as usize) < MAX_FRAME_WORKERS, "invalid worker index");

        let mut scratch = self.scratches[worker as usize].lock();
        let (data, used) = select(&mut scratch);

        let offset = *used;
        let needed = offset.checked_add(count)?;
        if needed as usize > data.len() {
            let grown = (data.len() * 2)
                .max(needed as usize)
                .max(SCRATCH_INITIAL_CAPACITY);
            data.resize(grown, Mat4::IDENTITY);
        }
        *used = needed;
        Some(offset)
    }

    pub fn write_bones_parallel(&self, worker: u32, local_offset: u32, data: &[Mat4]) {
        assert!((worker as usize) < MAX_FRAME_WORKERS, "invalid worker index");
        let mut scratch = self.scratches[worker as usize].lock();
        let end = local_offset as usize + data.len();
        if end > scratch.bones.len() {
            tracing::error!(target: "frame", worker, local_offset, "out of bounds scratch write");
            return;
        }
        scratch.bones[local_offset as usize..end].copy_from_slice(data);
    }

    pub fn write_transforms_parallel(&self, worker: u32, local_offset: u32, data: &[Mat4]) {
        assert!((worker as usize) < MAX_FRAME_WORKERS, "invalid worker index");
        let mut scratch = self.scratches[worker as usize].lock();
        let end = local_offset as usize + data.len();
        if end > scratch.transforms.len() {
            tracing::error!(target: "frame", worker, local_offset, "out of bounds scratch write");
            return;
        }
        scratch.transforms[local_offset as usize..end].copy_from_slice(data);
    }

    /// Copies every worker's scratch into the main arena and leaves parallel
    /// mode. Single-threaded; all scratch writes must be finished.
    ///
    /// Each scratch is assigned a contiguous global range in worker-index
    /// order; [`global_bone_offset`](Self::global_bone_offset) and
    /// [`global_transform_offset`](Self::global_transform_offset) translate
    /// recorded local offsets afterwards.
    pub fn merge_scratch(&self) {
        if !self.is_parallel() {
            tracing::warn!(target: "frame", "merge_scratch outside a parallel scope");
            return;
        }

        let mut total_bones = 0u32;
        let mut total_transforms = 0u32;
        for scratch in &self.scratches {
            let scratch = scratch.lock();
            total_bones += scratch.bone_count;
            total_transforms += scratch.transform_count;
        }

        let mut bones = self.bones.lock();
        let mut transforms = self.transforms.lock();
        bones.grow_for(total_bones, "bones");
        transforms.grow_for(total_transforms, "transforms");

        for scratch in &self.scratches {
            let mut scratch = scratch.lock();

            if scratch.bone_count > 0 {
                let offset = bones.offset;
                scratch.global_bone_offset = offset;
                let count = scratch.bone_count as usize;
                bones.data[offset as usize..offset as usize + count]
                    .copy_from_slice(&scratch.bones[..count]);
                bones.offset += scratch.bone_count;
            }

            if scratch.transform_count > 0 {
                let offset = transforms.offset;
                scratch.global_transform_offset = offset;
                let count = scratch.transform_count as usize;
                transforms.data[offset as usize..offset as usize + count]
                    .copy_from_slice(&scratch.transforms[..count]);
                transforms.offset += scratch.transform_count;
            }
        }

        self.parallel_active.store(false, Ordering::Release);
    }

    /// Translates a bone offset recorded during parallel submission into a
    /// main-arena offset. Valid after [`merge_scratch`](Self::merge_scratch).
    #[must_use]
    pub fn global_bone_offset(&self, worker: u32, local_offset: u32) -> u32 {
        self.scratches[worker as usize].lock().global_bone_offset + local_offset
    }

    /// Translates a transform offset recorded during parallel submission
    /// into a main-arena offset.
    #[must_use]
    pub fn global_transform_offset(&self, worker: u32, local_offset: u32) -> u32 {
        self.scratches[worker as usize].lock().global_transform_offset + local_offset
    }
}

impl Scratch {
    const fn new() -> Self {
        Self {
            bones: Vec::new(),
            bone_count: 0,
            global_bone_offset: 0,
            transforms: Vec::new(),
            transform_count: 0,
            global_transform_offset: 0,
        }
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}
