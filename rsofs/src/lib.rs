//! Core of the SOFS14 block filesystem: on-disk layout, inode and cluster
//! allocators, the per-file cluster index, directories and path resolution,
//! all over a fixed-size backing container.

mod blockio;
mod codec;
pub mod data;
pub mod mkfs;
mod sofs;

pub use crate::{
	blockio::{Backend, BlockIo},
	data::{ClusterNum, InodeKind, InodeNum, InodeState},
	sofs::{Info, LinkOp, MapOp, Sofs, UnlinkOp},
};

/// Blocks kept by the LRU block cache.
#[cfg(feature = "bcache")]
pub(crate) const BCACHE_SIZE: usize = 64;

#[cfg(feature = "bcache")]
pub(crate) fn new_lru<K: std::hash::Hash + Eq, V>(size: usize) -> lru::LruCache<K, V> {
	lru::LruCache::new(std::num::NonZeroUsize::new(size).unwrap())
}
