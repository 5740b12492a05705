// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Frame-local staging for variable-length render data.
//!
//! Submission code stores bone matrices and instance transforms for the
//! current frame in a [`FrameArena`] and hands downstream consumers plain
//! `(offset, count)` pairs instead of owned containers, which keeps command
//! structures POD and sortable. Offsets are bump-allocated and the whole
//! arena is [`reset`](FrameArena::reset) at the frame boundary without
//! freeing memory.
//!
//! For parallel submission, each worker registers for a private scratch
//! region and allocates scratch-relative offsets with no synchronization at
//! all; a single-threaded [`merge_scratch`](FrameArena::merge_scratch) at
//! the end of the frame copies every scratch into the main arena and records
//! the mapping from `(worker, local offset)` to global offsets.

mod arena;

pub use arena::{FrameArena, MAX_FRAME_WORKERS};

/// The process-wide frame arena, created on first use and never torn down.
///
/// The renderer resets it at the start of every frame; everything else only
/// allocates, writes and reads. Tests that need isolation construct their
/// own [`FrameArena`] instead.
pub fn frame_arena() -> &'static FrameArena {
    static ARENA: std::sync::OnceLock<FrameArena> = std::sync::OnceLock::new();
    ARENA.get_or_init(FrameArena::new)
}

/// Column-major 4x4 float matrix, storage only.
///
/// The arena moves these around as opaque 64-byte blobs; math lives with the
/// consumers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4(pub [[f32; 4]; 4]);

// === impl Mat4 ===

impl Mat4 {
    pub const IDENTITY: Self = {
        let mut m = [[0.0_f32; 4]; 4];
        m[0][0] = 1.0;
        m[1][1] = 1.0;
        m[2][2] = 1.0;
        m[3][3] = 1.0;
        Self(m)
    };
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}
