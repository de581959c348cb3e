// Copyright 2025 the Shelf Atlas Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The shelf-packing allocator and its data model.

use core::hash::Hasher;

use euclid::{point2, size2};
use thiserror::Error;
use wyhash::WyHash;

use crate::{Rectangle, Size};

/// Index of a block slot in the allocator's block vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct BlockIndex(u32);

impl BlockIndex {
    const NONE: BlockIndex = BlockIndex(u32::MAX);

    fn index(self) -> usize {
        self.0 as usize
    }

    fn is_none(self) -> bool {
        self == BlockIndex::NONE
    }

    fn is_some(self) -> bool {
        self != BlockIndex::NONE
    }
}

/// ID referring to an allocated rectangle.
///
/// Ids are handed out by a monotonic counter and are never served again
/// after the allocation is freed.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocId(pub(crate) u64);

impl AllocId {
    pub fn serialize(&self) -> u64 {
        self.0
    }

    pub fn deserialize(bits: u64) -> Self {
        AllocId(bits)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BlockKind {
    InUse,
    Free,
    Unused,
}

#[derive(Clone, Debug)]
struct Block {
    id: AllocId,
    /// X coordinate of the block's left edge within its shelf.
    x: i32,
    /// For an in-use block, the satisfied request. For a free block, the
    /// width spans the gap up to the next block and the height spans the
    /// full shelf height.
    size: Size,
    kind: BlockKind,
    name: Option<Box<str>>,
    prev: BlockIndex,
    next: BlockIndex,
}

#[derive(Clone, Debug)]
struct Shelf {
    /// Sum of the heights of all shelves below this one.
    y: i32,
    height: i32,
    first_block: BlockIndex,
}

/// Options to tweak the behavior of the atlas allocator.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocatorOptions {
    /// Ratio below which a rectangle prefers opening a new shelf over
    /// reusing a taller existing one.
    ///
    /// When a rectangle of height `h` could go into an existing shelf of
    /// height `s`, the shelf is only reused if `h / s` is at least this
    /// value (or if no vertical room is left for a new shelf). Higher values
    /// waste less height per shelf at the cost of opening more shelves.
    ///
    /// The value is clamped to `[0.0, 1.0]`.
    ///
    /// Default value: 0.8.
    pub usage_threshold: f32,
}

pub const DEFAULT_OPTIONS: AllocatorOptions = AllocatorOptions {
    usage_threshold: 0.8,
};

impl Default for AllocatorOptions {
    fn default() -> Self {
        DEFAULT_OPTIONS
    }
}

/// A dynamic shelf-packing atlas allocator.
///
/// The atlas is divided into horizontal shelves stacked bottom-to-top. A
/// shelf's height is set by the first rectangle placed in it, and each shelf
/// is an ordered chain of variable-width blocks, either in use or free:
///
/// ```ascii
/// +--------------------------------------------+
/// |                  (unused)                  |
/// +-----------+-----+--------------------------+
/// | E         | F   |           free           |
/// +-----------+--+--+-----+-------+------------+
/// |##############|##############################|
/// |######C#######|########D#####################|
/// +--------------+---+---------+---------------+
/// | A            | B |  free   | (A was freed) |
/// +--------------+---+---------+---------------+
/// ```
///
/// Allocating picks the shelf that wastes the least height above the
/// rectangle, preferring to open a new shelf when the best candidate would
/// be used below [`AllocatorOptions::usage_threshold`] and vertical room
/// remains. When no new shelf fits, the topmost shelf can stretch into the
/// leftover height as a last resort. Freeing coalesces neighboring free
/// blocks and removes the topmost shelf once it is entirely free, returning
/// its height to the budget.
///
/// All coordinates are non-negative integers and the allocator is meant to
/// be driven from a single thread.
#[derive(Clone)]
pub struct AtlasAllocator {
    shelves: Vec<Shelf>,
    blocks: Vec<Block>,

    /// Head of an intrusive singly linked list of unused block slots,
    /// threaded through `Block::next`.
    unused_blocks: BlockIndex,

    /// Monotonic id counter, shared by blocks and allocations.
    next_id: u64,

    /// See `AllocatorOptions`.
    usage_threshold: f32,

    /// Total size of the atlas.
    size: Size,
}

// Blocks are stored in a contiguous vector and refer to their left and right
// siblings through indices (BlockIndex), with BlockIndex::NONE meaning no
// link. Each shelf stores the index of its leftmost block; walking the
// sibling chain yields the shelf's blocks in increasing x order. When a
// block is destroyed by coalescing (or when its shelf is reclaimed), its
// slot goes onto a singly linked list of unused slots reusing the `next`
// member, and is handed back by the next block creation, so the vector's
// length tracks the peak number of live blocks rather than the total number
// ever created.

impl AtlasAllocator {
    /// Create an atlas allocator with default options.
    pub fn new(size: Size) -> Self {
        AtlasAllocator::with_options(size, &DEFAULT_OPTIONS)
    }

    /// Create an atlas allocator with the provided options.
    pub fn with_options(size: Size, options: &AllocatorOptions) -> Self {
        assert!(size.width > 0);
        assert!(size.height > 0);

        AtlasAllocator {
            shelves: Vec::new(),
            blocks: Vec::new(),
            unused_blocks: BlockIndex::NONE,
            next_id: 0,
            usage_threshold: options.usage_threshold.clamp(0.0, 1.0),
            size,
        }
    }

    /// The total size of the atlas.
    pub fn size(&self) -> Size {
        self.size
    }

    /// Whether the atlas currently holds no allocation at all.
    pub fn is_empty(&self) -> bool {
        self.shelves.is_empty()
    }

    /// Drop all shelves and blocks, clearing the atlas to its initial state.
    ///
    /// The id counter is not reset: ids stay unique across the allocator's
    /// whole lifetime.
    pub fn clear(&mut self) {
        self.shelves.clear();
        self.blocks.clear();
        self.unused_blocks = BlockIndex::NONE;
    }

    /// Allocate a rectangle in the atlas.
    ///
    /// Fails with [`OutOfSpace`] when no shelf can host the rectangle; the
    /// atlas is left untouched in that case.
    ///
    /// Requests must have a width and height of at least 1.
    pub fn allocate(&mut self, requested_size: Size) -> Result<Allocation, OutOfSpace> {
        self.allocate_named(requested_size, None)
    }

    /// Allocate a rectangle in the atlas and label it with a short debug
    /// name.
    ///
    /// The name is copied into allocator-owned storage and released when the
    /// allocation is freed. It shows up in [`blocks`](Self::blocks) views
    /// and in the output of [`svg::dump_svg`](crate::svg::dump_svg).
    pub fn allocate_named(
        &mut self,
        requested_size: Size,
        name: Option<&str>,
    ) -> Result<Allocation, OutOfSpace> {
        assert!(
            requested_size.width > 0 && requested_size.height > 0,
            "invalid allocation request {requested_size:?}: width and height must be at least 1",
        );

        let (w, h) = (requested_size.width, requested_size.height);
        let out_of_space = OutOfSpace {
            width: w,
            height: h,
        };
        if w > self.size.width || h > self.size.height {
            return Err(out_of_space);
        }

        // Score the existing shelves, accumulating the stacked height on the
        // way. A shelf is a candidate if the rectangle fits its height and
        // one of its free blocks is wide enough; the best candidate wastes
        // the least height above the rectangle, earliest shelf winning ties.
        let mut summed_height = 0;
        let mut pick: Option<usize> = None;
        let mut pick_score = i32::MAX;
        for (index, shelf) in self.shelves.iter().enumerate() {
            summed_height += shelf.height;
            if shelf.height < h || self.find_free_block(shelf, w).is_none() {
                continue;
            }
            let score = shelf.height - h;
            if score < pick_score {
                pick_score = score;
                pick = Some(index);
            }
        }

        let leftover_height = self.size.height - summed_height;

        let allocation = if leftover_height >= h {
            match pick {
                // The candidate is full enough vertically that the wasted
                // strip above the rectangle is acceptable.
                Some(index)
                    if h as f32 / self.shelves[index].height as f32 >= self.usage_threshold =>
                {
                    self.place(index, requested_size, name)
                }
                _ => {
                    let index = self.push_shelf(summed_height, h);
                    self.place(index, requested_size, name)
                }
            }
        } else if let Some(index) = pick {
            // No room for a new shelf; the threshold is a preference, not a
            // precondition.
            self.place(index, requested_size, name)
        } else {
            // Last resort: stretch the topmost shelf into the leftover
            // height.
            let last = self.shelves.len().checked_sub(1).ok_or(out_of_space)?;
            let shelf = &self.shelves[last];
            if shelf.height + leftover_height < h || self.find_free_block(shelf, w).is_none() {
                return Err(out_of_space);
            }
            self.grow_last_shelf(h);
            self.place(last, requested_size, name)
        };

        #[cfg(feature = "checks")]
        self.check();

        Ok(allocation)
    }

    /// Deallocate a rectangle in the atlas.
    ///
    /// Ids that are not currently allocated are ignored.
    pub fn deallocate(&mut self, id: AllocId) {
        let Some((shelf_index, block_index)) = self.find_block(id) else {
            return;
        };

        // Release the block. Free blocks always span the full shelf height.
        let shelf_height = self.shelves[shelf_index].height;
        {
            let block = &mut self.blocks[block_index.index()];
            block.kind = BlockKind::Free;
            block.name = None;
            block.size.height = shelf_height;
        }

        // Walk left to the start of the free run, then merge everything to
        // its right into it.
        let mut index = block_index;
        while self.blocks[index.index()].prev.is_some()
            && self.blocks[self.blocks[index.index()].prev.index()].kind == BlockKind::Free
        {
            index = self.blocks[index.index()].prev;
        }
        loop {
            let next = self.blocks[index.index()].next;
            if next.is_none() || self.blocks[next.index()].kind != BlockKind::Free {
                break;
            }
            let merged_width = self.blocks[next.index()].size.width;
            let next_next = self.blocks[next.index()].next;
            self.blocks[index.index()].size.width += merged_width;
            self.blocks[index.index()].next = next_next;
            if next_next.is_some() {
                self.blocks[next_next.index()].prev = index;
            }
            self.mark_block_unused(next);
        }

        self.reclaim_top_shelves();

        #[cfg(feature = "checks")]
        self.check();
    }

    /// Return the currently active allocation with this id, if any.
    pub fn get(&self, id: AllocId) -> Option<Allocation> {
        let (shelf_index, block_index) = self.find_block(id)?;
        let shelf = &self.shelves[shelf_index];
        let block = &self.blocks[block_index.index()];

        Some(Allocation {
            id,
            rectangle: Rectangle {
                min: point2(block.x, shelf.y),
                max: point2(block.x + block.size.width, shelf.y + block.size.height),
            },
        })
    }

    /// Total area wasted above in-use blocks that are shorter than their
    /// shelf.
    pub fn waste(&self) -> i64 {
        self.blocks()
            .filter(|block| block.in_use)
            .map(|block| block.size.width as i64 * (block.shelf_height - block.size.height) as i64)
            .sum()
    }

    /// Total area held by in-use blocks.
    pub fn coverage(&self) -> i64 {
        self.blocks()
            .filter(|block| block.in_use)
            .map(|block| block.size.width as i64 * block.size.height as i64)
            .sum()
    }

    /// Ratio of wasted area to covered area.
    ///
    /// Returns `0.0` when nothing is allocated.
    pub fn waste_percentage(&self) -> f32 {
        let coverage = self.coverage();
        if coverage == 0 {
            return 0.0;
        }
        self.waste() as f32 / coverage as f32
    }

    /// Ratio of covered area to the total atlas area.
    pub fn coverage_percentage(&self) -> f32 {
        let total = self.size.width as i64 * self.size.height as i64;
        self.coverage() as f32 / total as f32
    }

    /// A 64-bit fingerprint of the current occupancy, for regression tests.
    ///
    /// The hash visits shelves bottom-to-top and blocks left-to-right,
    /// feeding each block's occupancy flag and geometry as little-endian
    /// fixed-width bytes. Ids, names, and shelf heights are not hashed: two
    /// allocators driven through identical request/free sequences produce
    /// the same hash.
    pub fn content_hash(&self, seed: u64) -> u64 {
        let mut hasher = WyHash::with_seed(seed);
        for block in self.blocks() {
            hasher.write(&[block.in_use as u8]);
            hasher.write(&(block.offset as u64).to_le_bytes());
            hasher.write(&(block.shelf_y as u64).to_le_bytes());
            hasher.write(&(block.size.width as u64).to_le_bytes());
            hasher.write(&(block.size.height as u64).to_le_bytes());
        }
        hasher.finish()
    }

    /// Iterate over all blocks in layout order: shelves bottom-to-top,
    /// blocks left-to-right.
    ///
    /// The iteration order is deterministic and matches the internal layout.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            atlas: self,
            shelf_index: 0,
            block: self
                .shelves
                .first()
                .map_or(BlockIndex::NONE, |shelf| shelf.first_block),
        }
    }

    /// Invoke a callback for each allocated rectangle in the atlas.
    pub fn for_each_allocated_rectangle<F>(&self, mut callback: F)
    where
        F: FnMut(AllocId, &Rectangle),
    {
        for block in self.blocks() {
            if !block.in_use {
                continue;
            }

            let rectangle = Rectangle {
                min: point2(block.offset, block.shelf_y),
                max: point2(
                    block.offset + block.size.width,
                    block.shelf_y + block.size.height,
                ),
            };

            callback(block.id, &rectangle);
        }
    }

    /// First free block of `shelf` that is at least `min_width` wide.
    fn find_free_block(&self, shelf: &Shelf, min_width: i32) -> BlockIndex {
        let mut index = shelf.first_block;
        while index.is_some() {
            let block = &self.blocks[index.index()];
            if block.kind == BlockKind::Free && block.size.width >= min_width {
                return index;
            }
            index = block.next;
        }
        BlockIndex::NONE
    }

    /// Shelf and slot of the in-use block carrying `id`.
    fn find_block(&self, id: AllocId) -> Option<(usize, BlockIndex)> {
        for (shelf_index, shelf) in self.shelves.iter().enumerate() {
            let mut index = shelf.first_block;
            while index.is_some() {
                let block = &self.blocks[index.index()];
                if block.kind == BlockKind::InUse && block.id == id {
                    return Some((shelf_index, index));
                }
                index = block.next;
            }
        }
        None
    }

    /// Place a rectangle in the given shelf, splitting the host free block
    /// if it is wider than the request.
    ///
    /// The shelf must contain a free block at least `size.width` wide.
    fn place(&mut self, shelf_index: usize, size: Size, name: Option<&str>) -> Allocation {
        let shelf_y = self.shelves[shelf_index].y;
        let shelf_height = self.shelves[shelf_index].height;
        let block_index = self.find_free_block(&self.shelves[shelf_index], size.width);
        debug_assert!(block_index.is_some());
        debug_assert_eq!(self.blocks[block_index.index()].kind, BlockKind::Free);

        let host_width = self.blocks[block_index.index()].size.width;
        if host_width > size.width {
            // Split the remainder off as a new free block to the right.
            let rest_id = self.bump_id();
            let x = self.blocks[block_index.index()].x;
            let next = self.blocks[block_index.index()].next;
            let rest = self.new_block(Block {
                id: rest_id,
                x: x + size.width,
                size: size2(host_width - size.width, shelf_height),
                kind: BlockKind::Free,
                name: None,
                prev: block_index,
                next,
            });
            self.blocks[block_index.index()].next = rest;
            if next.is_some() {
                self.blocks[next.index()].prev = rest;
            }
        }

        let id = self.bump_id();
        let block = &mut self.blocks[block_index.index()];
        block.id = id;
        block.size = size;
        block.kind = BlockKind::InUse;
        block.name = name.map(Box::from);

        Allocation {
            id,
            rectangle: Rectangle {
                min: point2(block.x, shelf_y),
                max: point2(block.x + size.width, shelf_y + size.height),
            },
        }
    }

    /// Append a shelf at `y`, initialized with a single free block spanning
    /// the atlas width.
    fn push_shelf(&mut self, y: i32, height: i32) -> usize {
        let id = self.bump_id();
        let first_block = self.new_block(Block {
            id,
            x: 0,
            size: size2(self.size.width, height),
            kind: BlockKind::Free,
            name: None,
            prev: BlockIndex::NONE,
            next: BlockIndex::NONE,
        });
        self.shelves.push(Shelf {
            y,
            height,
            first_block,
        });
        log::trace!(
            "opened shelf {} at y={y} with height {height}",
            self.shelves.len() - 1
        );

        self.shelves.len() - 1
    }

    /// Stretch the topmost shelf to `height` and refresh its free blocks,
    /// which always span the full shelf height.
    fn grow_last_shelf(&mut self, height: i32) {
        let shelf = self.shelves.last_mut().unwrap();
        log::debug!(
            "growing last shelf from height {} to {height}",
            shelf.height
        );
        shelf.height = height;

        let mut index = shelf.first_block;
        while index.is_some() {
            let block = &mut self.blocks[index.index()];
            if block.kind == BlockKind::Free {
                block.size.height = height;
            }
            index = block.next;
        }
    }

    /// Remove topmost shelves that have become entirely free.
    ///
    /// Only the top shelf can be reclaimed (removing an interior shelf would
    /// shift every shelf above it), but removing it can expose another fully
    /// free shelf underneath, so this repeats until the top shelf holds an
    /// allocation or no shelf is left.
    fn reclaim_top_shelves(&mut self) {
        while let Some(shelf) = self.shelves.last() {
            let first_block = shelf.first_block;
            let block = &self.blocks[first_block.index()];
            if block.kind != BlockKind::Free || block.next.is_some() {
                break;
            }
            log::trace!("reclaiming empty top shelf at y={}", shelf.y);
            self.mark_block_unused(first_block);
            self.shelves.pop();
        }
    }

    fn bump_id(&mut self) -> AllocId {
        let id = AllocId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Take a slot off the unused list, or grow the block vector.
    fn new_block(&mut self, block: Block) -> BlockIndex {
        let index = self.unused_blocks;
        if index.is_some() {
            debug_assert_eq!(self.blocks[index.index()].kind, BlockKind::Unused);
            self.unused_blocks = self.blocks[index.index()].next;
            self.blocks[index.index()] = block;
            return index;
        }

        self.blocks.push(block);

        BlockIndex(self.blocks.len() as u32 - 1)
    }

    /// Retire a block slot onto the unused list for reuse.
    fn mark_block_unused(&mut self, index: BlockIndex) {
        debug_assert!(self.blocks[index.index()].kind != BlockKind::Unused);
        let unused_head = self.unused_blocks;
        let block = &mut self.blocks[index.index()];
        block.kind = BlockKind::Unused;
        block.name = None;
        block.next = unused_head;
        self.unused_blocks = index;
    }

    /// Validate the allocator's internal invariants, panicking on the first
    /// violation.
    #[cfg(any(test, feature = "checks"))]
    fn check(&self) {
        let mut stacked_height = 0;
        let mut active_ids = Vec::new();

        for shelf in &self.shelves {
            assert_eq!(shelf.y, stacked_height, "shelf does not sit on the one below");
            assert!(shelf.height > 0);
            stacked_height += shelf.height;

            let mut offset = 0;
            let mut prev = BlockIndex::NONE;
            let mut prev_free = false;
            let mut index = shelf.first_block;
            while index.is_some() {
                let block = &self.blocks[index.index()];
                assert_eq!(block.prev, prev, "broken sibling link");
                assert_eq!(block.x, offset, "blocks must tile the shelf left to right");
                match block.kind {
                    BlockKind::InUse => {
                        assert!(block.size.width > 0 && block.size.height > 0);
                        assert!(block.size.height <= shelf.height);
                        active_ids.push(block.id);
                        prev_free = false;
                    }
                    BlockKind::Free => {
                        assert!(!prev_free, "adjacent free blocks must be coalesced");
                        assert_eq!(block.size.height, shelf.height);
                        assert!(block.name.is_none());
                        prev_free = true;
                    }
                    BlockKind::Unused => panic!("unused slot linked into a shelf"),
                }
                offset += block.size.width;
                prev = index;
                index = block.next;
            }
            assert_eq!(offset, self.size.width, "shelf does not span the atlas width");
        }

        assert!(stacked_height <= self.size.height, "shelves overflow the atlas");

        if let Some(shelf) = self.shelves.last() {
            let block = &self.blocks[shelf.first_block.index()];
            assert!(
                block.kind != BlockKind::Free || block.next.is_some(),
                "empty top shelf was not reclaimed"
            );
        }

        active_ids.sort_unstable();
        let count = active_ids.len();
        active_ids.dedup();
        assert_eq!(active_ids.len(), count, "duplicate active ids");
    }
}

/// The result of a successful allocation.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Allocation {
    pub id: AllocId,
    /// The allocated rectangle, in absolute atlas coordinates.
    pub rectangle: Rectangle,
}

/// Error returned when no shelf can host a requested rectangle.
///
/// The allocator is left unchanged and remains usable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("no room left in the atlas for a {width}x{height} rectangle")]
pub struct OutOfSpace {
    /// Width of the rejected request.
    pub width: i32,
    /// Height of the rejected request.
    pub height: i32,
}

/// A read-only view of one block, yielded by [`AtlasAllocator::blocks`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BlockView<'a> {
    /// Index of the block's shelf, counted from the bottom.
    pub shelf_index: usize,
    /// Y coordinate of the shelf's bottom edge.
    pub shelf_y: i32,
    /// Current height of the shelf.
    pub shelf_height: i32,
    pub id: AllocId,
    /// X coordinate of the block's left edge.
    pub offset: i32,
    pub size: Size,
    pub in_use: bool,
    pub name: Option<&'a str>,
}

/// Iterator over an atlas's blocks in layout order.
pub struct Blocks<'a> {
    atlas: &'a AtlasAllocator,
    shelf_index: usize,
    block: BlockIndex,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = BlockView<'a>;

    fn next(&mut self) -> Option<BlockView<'a>> {
        loop {
            if self.block.is_some() {
                let shelf = &self.atlas.shelves[self.shelf_index];
                let block = &self.atlas.blocks[self.block.index()];
                self.block = block.next;
                return Some(BlockView {
                    shelf_index: self.shelf_index,
                    shelf_y: shelf.y,
                    shelf_height: shelf.height,
                    id: block.id,
                    offset: block.x,
                    size: block.size,
                    in_use: block.kind == BlockKind::InUse,
                    name: block.name.as_deref(),
                });
            }

            self.shelf_index += 1;
            if self.shelf_index >= self.atlas.shelves.len() {
                return None;
            }
            self.block = self.atlas.shelves[self.shelf_index].first_block;
        }
    }
}

#[cfg(test)]
fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle {
    Rectangle {
        min: point2(x, y),
        max: point2(x + w, y + h),
    }
}

#[test]
fn atlas_basic() {
    let mut atlas = AtlasAllocator::new(size2(1024, 1024));
    assert!(atlas.is_empty());
    assert_eq!(atlas.size(), size2(1024, 1024));

    let full = atlas.allocate(size2(1024, 1024)).unwrap();
    assert_eq!(full.rectangle, rect(0, 0, 1024, 1024));
    assert!(atlas.allocate(size2(1, 1)).is_err());
    atlas.deallocate(full.id);
    assert!(atlas.is_empty());

    let a = atlas.allocate(size2(256, 64)).unwrap();
    let b = atlas.allocate(size2(256, 64)).unwrap();
    let c = atlas.allocate(size2(512, 64)).unwrap();
    assert_eq!(a.rectangle, rect(0, 0, 256, 64));
    assert_eq!(b.rectangle, rect(256, 0, 256, 64));
    assert_eq!(c.rectangle, rect(512, 0, 512, 64));
    atlas.check();

    atlas.deallocate(b.id);
    let d = atlas.allocate(size2(200, 64)).unwrap();
    assert_eq!(d.rectangle, rect(256, 0, 200, 64));
    atlas.check();

    atlas.deallocate(a.id);
    atlas.deallocate(d.id);
    atlas.deallocate(c.id);
    assert!(atlas.is_empty());

    let full = atlas.allocate(size2(1024, 1024)).unwrap();
    assert_eq!(full.rectangle, rect(0, 0, 1024, 1024));
    atlas.deallocate(full.id);
    assert!(atlas.is_empty());
}

#[test]
fn shelf_selection() {
    let mut atlas = AtlasAllocator::with_options(
        size2(1024, 1024),
        &AllocatorOptions {
            usage_threshold: 0.9,
        },
    );

    // The first rectangle fixes the bottom shelf's height; a taller one
    // opens a second shelf instead.
    let a = atlas.allocate(size2(100, 100)).unwrap();
    let b = atlas.allocate(size2(128, 128)).unwrap();
    assert_eq!(a.rectangle, rect(0, 0, 100, 100));
    assert_eq!(b.rectangle, rect(0, 100, 128, 128));
    atlas.check();

    atlas.deallocate(a.id);

    // 64/100 is below the usage threshold, so rather than waste the bottom
    // shelf's height a third shelf opens for the small rectangles.
    let c = atlas.allocate(size2(64, 64)).unwrap();
    assert_eq!(c.rectangle, rect(0, 228, 64, 64));
    let d = atlas.allocate(size2(64, 64)).unwrap();
    assert_eq!(d.rectangle, rect(64, 228, 64, 64));

    // A perfect height match reuses the bottom shelf.
    let e = atlas.allocate(size2(256, 100)).unwrap();
    assert_eq!(e.rectangle, rect(0, 0, 256, 100));

    // No shelf can host a full-width rectangle, so a new one opens.
    let f = atlas.allocate(size2(1024, 256)).unwrap();
    assert_eq!(f.rectangle, rect(0, 292, 1024, 256));

    // The 64-high shelf is the best height fit with enough free width.
    let g = atlas.allocate(size2(873, 64)).unwrap();
    assert_eq!(g.rectangle, rect(128, 228, 873, 64));

    // 90/100 meets the threshold: joins the bottom shelf rather than
    // opening yet another one.
    let h = atlas.allocate(size2(500, 90)).unwrap();
    assert_eq!(h.rectangle, rect(256, 0, 500, 90));

    // Only h is shorter than its shelf.
    assert_eq!(atlas.waste(), 500 * 10);
    atlas.check();
}

#[test]
fn last_shelf_growth() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));

    let a = atlas.allocate(size2(60, 40)).unwrap();
    assert_eq!(a.rectangle, rect(0, 0, 60, 40));

    // Too tall for the shelf and for the remaining height, but the shelf
    // can stretch into the leftover budget.
    let b = atlas.allocate(size2(30, 70)).unwrap();
    assert_eq!(b.rectangle, rect(60, 0, 30, 70));
    atlas.check();

    // The stretched shelf now wastes the height above the first rectangle.
    assert_eq!(atlas.waste(), 60 * 30);

    // The free remainder of the stretched shelf is still usable.
    let c = atlas.allocate(size2(10, 70)).unwrap();
    assert_eq!(c.rectangle, rect(90, 0, 10, 70));
    atlas.check();

    assert!(atlas.allocate(size2(20, 40)).is_err());
}

#[test]
fn low_usage_pick_when_out_of_height() {
    let mut atlas = AtlasAllocator::with_options(
        size2(100, 100),
        &AllocatorOptions {
            usage_threshold: 0.9,
        },
    );
    let _a = atlas.allocate(size2(50, 80)).unwrap();
    let _b = atlas.allocate(size2(100, 20)).unwrap();

    // No vertical budget is left, so the tall shelf is reused even though
    // 20/80 is far below the usage threshold.
    let c = atlas.allocate(size2(40, 20)).unwrap();
    assert_eq!(c.rectangle, rect(50, 0, 40, 20));
    atlas.check();
}

#[test]
fn out_of_space() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));
    assert!(atlas.allocate(size2(100, 60)).is_ok());

    // 40 rows remain but the only shelf is full, too short to hold 50, and
    // cannot stretch around its allocated block.
    let err = atlas.allocate(size2(100, 50)).unwrap_err();
    assert_eq!(
        err,
        OutOfSpace {
            width: 100,
            height: 50
        }
    );

    // Failed allocations leave the atlas untouched.
    let before = atlas.content_hash(17);
    assert!(atlas.allocate(size2(100, 50)).is_err());
    assert!(atlas.allocate(size2(2000, 1)).is_err());
    assert!(atlas.allocate(size2(1, 2000)).is_err());
    assert_eq!(atlas.content_hash(17), before);

    assert!(atlas.allocate(size2(100, 40)).is_ok());
    assert!(atlas.allocate(size2(1, 1)).is_err());
    atlas.check();
}

#[test]
fn top_shelf_reclamation() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));
    let x = atlas.allocate(size2(100, 30)).unwrap();
    let y = atlas.allocate(size2(100, 30)).unwrap();
    assert_eq!(y.rectangle, rect(0, 30, 100, 30));

    // Freeing the top shelf's only rectangle reclaims the shelf, making its
    // height available for a taller one.
    atlas.deallocate(y.id);
    let tall = atlas.allocate(size2(100, 70)).unwrap();
    assert_eq!(tall.rectangle, rect(0, 30, 100, 70));
    atlas.deallocate(tall.id);

    atlas.deallocate(x.id);
    assert!(atlas.is_empty());
}

#[test]
fn interior_shelf_retained() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));
    let x = atlas.allocate(size2(100, 30)).unwrap();
    let y = atlas.allocate(size2(100, 30)).unwrap();
    let z = atlas.allocate(size2(100, 30)).unwrap();

    // The empty middle shelf keeps its place: removing it would shift the
    // shelf above it.
    atlas.deallocate(y.id);
    atlas.check();
    assert_eq!(atlas.coverage(), 6000);
    assert_eq!(atlas.waste(), 0);

    // Freeing then re-allocating the same size lands in the same spot.
    let y2 = atlas.allocate(size2(100, 30)).unwrap();
    assert_eq!(y2.rectangle, y.rectangle);

    // Reclaiming the top shelf also reclaims the now-free shelf underneath.
    atlas.deallocate(y2.id);
    atlas.deallocate(z.id);
    atlas.check();
    assert_eq!(atlas.blocks().count(), 1);

    let tall = atlas.allocate(size2(100, 60)).unwrap();
    assert_eq!(tall.rectangle, rect(0, 30, 100, 60));
    let _ = x;
}

#[test]
fn accounting() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));
    assert_eq!(atlas.coverage(), 0);
    assert_eq!(atlas.waste(), 0);
    assert_eq!(atlas.waste_percentage(), 0.0);
    assert_eq!(atlas.coverage_percentage(), 0.0);

    let _x = atlas.allocate(size2(100, 30)).unwrap();
    let y = atlas.allocate(size2(100, 30)).unwrap();
    let _z = atlas.allocate(size2(100, 30)).unwrap();
    atlas.deallocate(y.id);

    assert_eq!(atlas.coverage(), 6000);
    assert_eq!(atlas.waste(), 0);
    assert_eq!(atlas.coverage_percentage(), 0.6);

    // Free blocks plus the strip above the top shelf account for the rest
    // of the atlas area.
    let free_area: i64 = atlas
        .blocks()
        .filter(|block| !block.in_use)
        .map(|block| block.size.width as i64 * block.size.height as i64)
        .sum();
    assert_eq!(
        atlas.coverage() + atlas.waste() + free_area + 10 * 100,
        100 * 100
    );

    // A short rectangle on a 30-high shelf wastes the strip above itself.
    let w = atlas.allocate(size2(40, 20)).unwrap();
    assert_eq!(w.rectangle, rect(0, 30, 40, 20));
    assert_eq!(atlas.waste(), 400);
    let expected = 400.0 / 6800.0;
    assert!((atlas.waste_percentage() - expected).abs() < 1e-6);
    atlas.check();
}

#[test]
fn names() {
    let mut atlas = AtlasAllocator::new(size2(256, 256));
    let a = atlas.allocate_named(size2(32, 32), Some("glyph_a")).unwrap();
    let b = atlas.allocate(size2(32, 32)).unwrap();

    let named: Vec<_> = atlas
        .blocks()
        .filter_map(|block| block.name.map(|name| (block.id, name.to_string())))
        .collect();
    assert_eq!(named, vec![(a.id, "glyph_a".to_string())]);

    // Freeing releases the label.
    atlas.deallocate(a.id);
    assert!(atlas.blocks().all(|block| block.name.is_none()));

    // The recycled spot gets the new label, and a fresh id.
    let c = atlas.allocate_named(size2(32, 32), Some("glyph_c")).unwrap();
    assert_eq!(c.rectangle, a.rectangle);
    assert_ne!(c.id, a.id);
    let names: Vec<_> = atlas.blocks().filter_map(|block| block.name).collect();
    assert_eq!(names, vec!["glyph_c"]);
    let _ = b;
}

#[test]
fn get_allocations() {
    let mut atlas = AtlasAllocator::new(size2(512, 512));
    let a = atlas.allocate_named(size2(100, 40), Some("a")).unwrap();
    let b = atlas.allocate(size2(60, 35)).unwrap();

    assert_eq!(atlas.get(a.id), Some(a));
    assert_eq!(atlas.get(b.id), Some(b));
    assert_eq!(atlas.get(AllocId::deserialize(u64::MAX)), None);

    atlas.deallocate(a.id);
    assert_eq!(atlas.get(a.id), None);
    assert_eq!(atlas.get(b.id), Some(b));

    // Unknown ids are ignored.
    atlas.deallocate(a.id);
    assert_eq!(atlas.get(b.id), Some(b));
    atlas.check();
}

#[test]
fn enumeration_order() {
    let mut atlas = AtlasAllocator::with_options(
        size2(256, 256),
        &AllocatorOptions {
            usage_threshold: 1.0,
        },
    );
    atlas.allocate(size2(64, 32)).unwrap();
    atlas.allocate(size2(64, 64)).unwrap();
    atlas.allocate(size2(64, 128)).unwrap();

    // One in-use and one free block per shelf, bottom-to-top and
    // left-to-right, tiling each shelf exactly.
    let views: Vec<_> = atlas.blocks().collect();
    assert_eq!(views.len(), 6);

    let mut width = 0;
    let mut shelf_index = 0;
    for view in &views {
        assert!(view.shelf_index >= shelf_index);
        if view.shelf_index != shelf_index {
            assert_eq!(width, 256);
            width = 0;
            shelf_index = view.shelf_index;
        }
        assert_eq!(view.offset, width);
        width += view.size.width;
    }
    assert_eq!(width, 256);

    assert_eq!(views[0].shelf_y, 0);
    assert_eq!(views[2].shelf_y, 32);
    assert_eq!(views[4].shelf_y, 96);
    assert_eq!(views[4].shelf_height, 128);
}

#[test]
fn hash_determinism() {
    let build = || {
        let mut atlas = AtlasAllocator::new(size2(512, 512));
        let a = atlas.allocate(size2(120, 35)).unwrap();
        let b = atlas.allocate_named(size2(60, 40), Some("b")).unwrap();
        let _c = atlas.allocate(size2(300, 200)).unwrap();
        atlas.deallocate(b.id);
        atlas.deallocate(a.id);
        let _ = atlas.allocate(size2(100, 30)).unwrap();
        atlas
    };

    let first = build();
    let second = build();
    assert_eq!(first.content_hash(0), second.content_hash(0));
    assert_eq!(first.content_hash(42), second.content_hash(42));
    assert_ne!(first.content_hash(0), first.content_hash(1));

    let mut third = build();
    let id = third.blocks().find(|block| block.in_use).unwrap().id;
    third.deallocate(id);
    assert_ne!(first.content_hash(0), third.content_hash(0));

    // Ids and names are not part of the fingerprint, the geometry is: the
    // same layout reached through different histories hashes identically.
    let mut churned = AtlasAllocator::new(size2(512, 512));
    let t = churned.allocate(size2(64, 64)).unwrap();
    churned.deallocate(t.id);
    churned.allocate_named(size2(64, 64), Some("t")).unwrap();
    let mut plain = AtlasAllocator::new(size2(512, 512));
    plain.allocate(size2(64, 64)).unwrap();
    assert_eq!(churned.content_hash(7), plain.content_hash(7));
}

#[test]
fn allocated_rectangles() {
    let mut atlas = AtlasAllocator::new(size2(256, 256));
    let a = atlas.allocate(size2(50, 50)).unwrap();
    let b = atlas.allocate(size2(20, 45)).unwrap();

    let mut seen = Vec::new();
    atlas.for_each_allocated_rectangle(|id, rectangle| seen.push((id, *rectangle)));
    assert_eq!(seen, vec![(a.id, a.rectangle), (b.id, b.rectangle)]);
}

#[test]
fn clear_empty() {
    let mut atlas = AtlasAllocator::new(size2(256, 256));
    assert!(atlas.is_empty());

    let a = atlas.allocate(size2(10, 10)).unwrap();
    assert!(!atlas.is_empty());

    atlas.clear();
    assert!(atlas.is_empty());

    // Ids are not reused across a clear.
    let b = atlas.allocate(size2(10, 10)).unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(a.rectangle, b.rectangle);

    atlas.clear();
    assert!(atlas.is_empty());

    atlas.clear();
    assert!(atlas.is_empty());
}

#[test]
fn options() {
    assert_eq!(AllocatorOptions::default().usage_threshold, 0.8);

    // Out-of-range thresholds are clamped; a perfect height match always
    // satisfies the threshold.
    let mut atlas = AtlasAllocator::with_options(
        size2(100, 100),
        &AllocatorOptions {
            usage_threshold: 7.5,
        },
    );
    atlas.allocate(size2(10, 50)).unwrap();
    let b = atlas.allocate(size2(10, 50)).unwrap();
    assert_eq!(b.rectangle, rect(10, 0, 10, 50));
}

#[test]
#[should_panic]
fn zero_width() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));
    let _ = atlas.allocate(size2(0, 10));
}

#[test]
#[should_panic]
fn zero_height() {
    let mut atlas = AtlasAllocator::new(size2(100, 100));
    let _ = atlas.allocate(size2(10, 0));
}

#[test]
fn coverage_monotonic() {
    let mut atlas = AtlasAllocator::new(size2(512, 512));

    // Within a batch of allocations with no frees, coverage grows by exactly
    // the area of each placed rectangle, wherever it lands.
    let requests = [
        size2(120, 30),
        size2(40, 25),
        size2(500, 90),
        size2(512, 200),
        size2(33, 15),
        size2(200, 28),
    ];
    let mut previous = atlas.coverage();
    assert_eq!(previous, 0);
    for size in requests {
        atlas.allocate(size).unwrap();
        let coverage = atlas.coverage();
        assert_eq!(coverage, previous + size.width as i64 * size.height as i64);
        previous = coverage;
    }

    // A rejected request does not decrease it either.
    assert!(atlas.allocate(size2(512, 512)).is_err());
    assert_eq!(atlas.coverage(), previous);
}

#[test]
fn random_walk_stress() {
    // A long deterministic random walk mixing single frees, batch frees and
    // allocations whose heights are drawn from a few buckets, so rectangles
    // cluster into shelves the way glyph runs do. The tall outlier bucket
    // forces new shelves and, near the top of the atlas, last-shelf growth.
    let mut atlas = AtlasAllocator::with_options(
        size2(1024, 1024),
        &AllocatorOptions {
            usage_threshold: 0.85,
        },
    );

    // xorshift64
    let mut state: u64 = 0x9E3779B97F4A7C15;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    const HEIGHTS: [i32; 8] = [8, 12, 16, 16, 24, 32, 90, 300];

    let mut live: Vec<AllocId> = Vec::new();
    let mut placed = 0u32;
    let mut rejected = 0u32;

    for round in 0..60_000u32 {
        match next() % 10 {
            0..=4 => {
                let width = (next() % 320) as i32 + 1;
                let height = HEIGHTS[(next() % HEIGHTS.len() as u64) as usize];
                match atlas.allocate(size2(width, height)) {
                    Ok(allocation) => {
                        live.push(allocation.id);
                        placed += 1;
                    }
                    Err(OutOfSpace { .. }) => rejected += 1,
                }
            }
            5..=8 => {
                if !live.is_empty() {
                    let victim = (next() as usize) % live.len();
                    atlas.deallocate(live.swap_remove(victim));
                }
            }
            _ => {
                // Popping the most recent allocations tends to empty the
                // topmost shelf, exercising reclamation under load.
                for _ in 0..next() % 8 {
                    if let Some(id) = live.pop() {
                        atlas.deallocate(id);
                    }
                }
            }
        }

        if round % 1000 == 0 {
            atlas.check();

            // Coverage, waste, free blocks and the headroom above the top
            // shelf always account for the whole surface.
            let free_area: i64 = atlas
                .blocks()
                .filter(|block| !block.in_use)
                .map(|block| block.size.width as i64 * block.size.height as i64)
                .sum();
            let stacked = atlas
                .blocks()
                .map(|block| (block.shelf_y + block.shelf_height) as i64)
                .max()
                .unwrap_or(0);
            assert_eq!(
                atlas.coverage() + atlas.waste() + free_area + (1024 - stacked) * 1024,
                1024 * 1024
            );
        }
    }

    assert!(placed > 1000);
    assert!(rejected > 0);

    // A request wider than the atlas can never succeed, at any fill level.
    assert!(atlas.allocate(size2(1025, 1)).is_err());

    while let Some(id) = live.pop() {
        atlas.deallocate(id);
    }
    atlas.check();
    assert!(atlas.is_empty());

    // Draining everything hands the full surface back.
    let full = atlas.allocate(size2(1024, 1024)).unwrap();
    assert_eq!(full.rectangle, rect(0, 0, 1024, 1024));
}
