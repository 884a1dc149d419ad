//! Bitmaps and bit allocators.
//!
//! - [`BitSetTree`] - in-memory hierarchical bitmap
//! - [`BlockBitSetTree`] - same structure with its leaves in blocks
//! - [`ConcurrentBitSet`] - segmented allocator built on [`BitSetTree`]

mod block_tree;
mod concurrent;
mod tree;

pub use block_tree::BlockBitSetTree;
pub use concurrent::ConcurrentBitSet;
pub use tree::BitSetTree;
