//! Query engine for sharded KBITv1 k-mer bitmap databases.
//!
//! A database is a static set of DNA k-mers (k in {16, 17, 18}) stored as
//! compressed bitmaps over the 2k-bit key space, partitioned into shard
//! files described by an `index.json`. Two query classes are supported:
//!
//! * [membership]: which of these k-mers are in the database;
//! * [stream]: paginated enumeration of k-mers *absent* from the
//!   database that pass a GC band and an optional substring filter,
//!   interleaved across shards for prefix diversity and resumable through
//!   an opaque [cursor::WindowCursor] token. For `construct_k > 18` each
//!   absent 18-mer anchor is expanded with prepended/appended bases.

pub mod cursor;
pub mod error;
pub mod expand;
pub mod filter;
pub mod kbit;
pub mod kmer;
pub mod membership;
pub mod perm;
pub mod shard_index;
pub mod stream;

pub use cursor::{LaneCursor, LaneSnapshot, WindowCursor, NOT_STARTED};
pub use error::{KbitError, Result, ShardIoKind};
pub use expand::ExpandState;
pub use filter::LeafFilter;
pub use kbit::{
    load_shard, universe_bits, write_dense, write_portable, KbitHeader, ShardBitmap, FLAG_DENSE,
    FLAG_PORTABLE, KBIT_MAGIC,
};
pub use kmer::{decode_kmer, encode_kmer, gc_count, reverse_complement};
pub use perm::{build_perm, identity_perm, splitmix64};
pub use shard_index::{GcHistogram, ShardIndex, ShardMeta};
pub use stream::{StreamEngine, StreamPage, StreamParams};
