// Copyright 2025 the Shelf Atlas Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A dynamic shelf-packing atlas allocator.
//!
//! This crate packs small axis-aligned rectangles (glyph bitmaps, sprite
//! tiles, texture regions) into one larger rectangle of fixed width and
//! height. The surface is divided into horizontal shelves whose heights are
//! set by the first rectangle placed in them; each shelf is subdivided
//! left-to-right into variable-width blocks. Allocations can be freed at any
//! time: adjacent free blocks on a shelf are coalesced, and an empty topmost
//! shelf is removed so its height budget can be reused by a shelf of a
//! different height.
//!
//! Shelf packing trades some wasted vertical space inside each shelf for
//! very cheap allocation and deallocation, which makes it a good fit for
//! dynamic glyph and sprite atlases where many short-lived rectangles share
//! a few common heights.
//!
//! # Example
//!
//! ```
//! use shelf_atlas::{size2, AtlasAllocator};
//!
//! let mut atlas = AtlasAllocator::new(size2(1024, 1024));
//!
//! let a = atlas.allocate(size2(100, 100)).unwrap();
//! let b = atlas.allocate(size2(128, 128)).unwrap();
//!
//! // Allocated rectangles never overlap.
//! assert!(!a.rectangle.intersects(&b.rectangle));
//!
//! atlas.deallocate(a.id);
//! atlas.deallocate(b.id);
//! assert!(atlas.is_empty());
//! ```
//!
//! # Features
//!
//! - `serde`: derive `Serialize`/`Deserialize` for the public value types.
//! - `checks`: validate the allocator's internal invariants after every
//!   mutating call. Intended for debugging and fuzzing, not for production
//!   builds.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(clippy::print_stdout, clippy::print_stderr)]
#![forbid(unsafe_code)]

mod allocator;
pub mod svg;

pub use allocator::*;

pub use euclid::{point2, size2};

/// A point in the atlas, in integer texel units.
pub type Point = euclid::default::Point2D<i32>;

/// A size in integer texel units.
pub type Size = euclid::default::Size2D<i32>;

/// An axis-aligned rectangle in integer texel units.
pub type Rectangle = euclid::default::Box2D<i32>;
