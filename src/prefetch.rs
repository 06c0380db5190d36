//! Ordering of chunks to prefetch around a just-loaded region.
//!
//! Given a rectangular prism of loaded chunks, the iterator walks outwards from each of its 8
//! half-axis faces (-/+ along T, Z, Y and X) one shell at a time: all faces at offset 1, then all
//! faces at offset 2, and so on, until every face has reached the grid border or its maximum
//! offset. Channels are never walked.

use crate::extent::{ChunkCoord, T, X, Y, Z};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A half-axis. Declaration order is the tie-break order used during iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchDirection {
    TMinus,
    TPlus,
    ZMinus,
    ZPlus,
    YMinus,
    YPlus,
    XMinus,
    XPlus,
}
impl PrefetchDirection {
    pub const ALL: [PrefetchDirection; 8] = [
        PrefetchDirection::TMinus,
        PrefetchDirection::TPlus,
        PrefetchDirection::ZMinus,
        PrefetchDirection::ZPlus,
        PrefetchDirection::YMinus,
        PrefetchDirection::YPlus,
        PrefetchDirection::XMinus,
        PrefetchDirection::XPlus,
    ];

    /// Index into TZYX arrays
    pub fn dimension(self) -> usize { self as usize >> 1 }
    pub fn is_positive(self) -> bool { self as usize & 1 == 1 }
    /// Index into a TCZYX chunk coordinate
    pub fn axis(self) -> usize { [T, Z, Y, X][self.dimension()] }
}

#[derive(Debug)]
struct DirectionState {
    direction: PrefetchDirection,
    /// coordinate of the loaded border along the axis
    start: usize,
    /// last coordinate that may be prefetched
    end: usize,
    /// loaded chunks sitting on the border
    chunks: Vec<ChunkCoord>,
}
impl DirectionState {
    fn reaches(&self, offset: usize) -> bool {
        if self.direction.is_positive() {
            self.start + offset <= self.end
        } else {
            offset <= self.start - self.end
        }
    }
    fn shifted(&self, idx: usize, offset: usize) -> ChunkCoord {
        let mut chunk = self.chunks[idx];
        let axis = self.direction.axis();
        if self.direction.is_positive() {
            chunk[axis] += offset;
        } else {
            chunk[axis] -= offset;
        }
        chunk
    }
}

/// Lazy, finite, single-pass sequence of TCZYX chunk coordinates to prefetch.
#[derive(Debug)]
pub struct ChunkPrefetchIterator {
    /// prioritized directions first, then the rest
    groups: VecDeque<Vec<DirectionState>>,
    offset: usize,
    shell_started: bool,
    direction_idx: usize,
    chunk_idx: usize,
}

impl ChunkPrefetchIterator {
    /// `chunks` are the loaded chunks (TCZYX) and are assumed to form a rectangular prism.
    /// `max_offset` and `num_chunks` are given in TZYX order. Directions listed in `priority` are
    /// exhausted before any other direction is visited.
    pub fn new(
        chunks: &[ChunkCoord],
        max_offset: [usize; 4],
        num_chunks: [usize; 4],
        priority: &[PrefetchDirection],
    ) -> Self {
        let mut prioritized = Vec::new();
        let mut others = Vec::new();

        if !chunks.is_empty() {
            for direction in PrefetchDirection::ALL {
                let dim = direction.dimension();
                let axis = direction.axis();
                let coords = chunks.iter().map(|c| c[axis]);
                let (start, end) = if direction.is_positive() {
                    let start = coords.max().unwrap_or(0);
                    let last = num_chunks[dim].saturating_sub(1);
                    (start, start.saturating_add(max_offset[dim]).min(last))
                } else {
                    let start = coords.min().unwrap_or(0);
                    (start, start.saturating_sub(max_offset[dim]))
                };
                let nothing_to_do = if direction.is_positive() { end <= start } else { end >= start };
                if nothing_to_do {
                    continue;
                }

                let state = DirectionState {
                    direction,
                    start,
                    end,
                    chunks: chunks.iter().filter(|c| c[axis] == start).copied().collect(),
                };
                if priority.contains(&direction) {
                    prioritized.push(state);
                } else {
                    others.push(state);
                }
            }
        }

        ChunkPrefetchIterator {
            groups: [prioritized, others].into_iter().filter(|g| !g.is_empty()).collect(),
            offset: 1,
            shell_started: false,
            direction_idx: 0,
            chunk_idx: 0,
        }
    }
}

impl Iterator for ChunkPrefetchIterator {
    type Item = ChunkCoord;

    fn next(&mut self) -> Option<ChunkCoord> {
        loop {
            let group = self.groups.front_mut()?;
            if !self.shell_started {
                let offset = self.offset;
                group.retain(|d| d.reaches(offset));
                if group.is_empty() {
                    self.groups.pop_front();
                    self.offset = 1;
                    continue;
                }
                self.shell_started = true;
                self.direction_idx = 0;
                self.chunk_idx = 0;
            }

            let Some(direction) = group.get(self.direction_idx) else {
                self.offset += 1;
                self.shell_started = false;
                continue;
            };
            if self.chunk_idx >= direction.chunks.len() {
                self.direction_idx += 1;
                self.chunk_idx = 0;
                continue;
            }
            let chunk = direction.shifted(self.chunk_idx, self.offset);
            self.chunk_idx += 1;
            return Some(chunk);
        }
    }
}
