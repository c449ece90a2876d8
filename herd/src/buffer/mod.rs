//! GPU resident arrays mirrored on the CPU.

use std::ops::Range;

mod data_buffer;
mod readback;

pub use data_buffer::*;
pub use readback::*;

/// A run of elements carried over when a buffer is rebuilt at a new size.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CopyRegion {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

impl CopyRegion {
    pub fn new(src: usize, dst: usize, len: usize) -> Self {
        Self { src, dst, len }
    }

    /// Ranges of `[0, len)` that no region writes to, in ascending order.
    pub fn uncovered(len: usize, regions: &[CopyRegion]) -> Vec<Range<usize>> {
        let mut covered: Vec<Range<usize>> = regions
            .iter()
            .filter(|r| r.len > 0)
            .map(|r| r.dst..(r.dst + r.len).min(len))
            .collect();
        covered.sort_by_key(|r| r.start);

        let mut gaps = Vec::new();
        let mut cursor = 0;
        for range in covered {
            if range.start > cursor {
                gaps.push(cursor..range.start.min(len));
            }
            cursor = cursor.max(range.end);
        }
        if cursor < len {
            gaps.push(cursor..len);
        }
        gaps
    }
}
