//! Block-resident indexes.

mod block_hash_table;

pub use block_hash_table::{BlockClosedLongIntHashTable, EMPTY};
