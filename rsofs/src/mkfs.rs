//! One-shot SOFS14 formatter.
//!
//! Lays the superblock, the inode table, the root directory and the free
//! cluster chain onto a backing container. The superblock first goes to disk
//! with a sentinel magic number; the real magic is written last, so an
//! interrupted format can never be mounted.

use std::{
	fs::OpenOptions,
	io::{Result as IoResult, Write},
	path::Path,
};

use crate::{
	blockio::{Backend, BlockIo},
	codec::Codec,
	data::*,
	err, iobail,
};

/// Formatting options, mirroring the mkfs command line.
#[derive(Debug, Clone)]
pub struct Options {
	/// Volume name, truncated to [`VOLUME_NAME_LEN`]` - 1` bytes.
	pub name: String,

	/// Desired inode count; the block fit may round it. Defaults to one
	/// inode per eight blocks.
	pub inodes: Option<u32>,

	/// Zero-fill every free data cluster instead of only writing headers.
	pub zero: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			name:   "SOFS14".to_owned(),
			inodes: None,
			zero:   false,
		}
	}
}

/// The block layout a format run settles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
	pub n_total:     u32,
	pub itable_size: u32,
	pub i_total:     u32,
	pub dzone_total: u32,
}

/// Fit an inode table and a data zone onto `n_total` blocks so that
/// `n_total = 1 + itable_size + dzone_total * BLOCKS_PER_CLUSTER`.
pub fn plan(n_total: u32, inodes: Option<u32>) -> IoResult<Geometry> {
	let ipb = IPB as u32;
	let bpc = BLOCKS_PER_CLUSTER as u32;

	let mut i_total = match inodes {
		Some(0) | None => n_total / 8,
		Some(n) => n,
	}
	.max(ipb);

	let mut itable_size = i_total.div_ceil(ipb);
	if n_total < 1 + itable_size + bpc {
		return Err(err!(EINVAL));
	}

	let dzone_total = (n_total - 1 - itable_size) / bpc;
	// absorb the remainder blocks into the inode table
	itable_size = n_total - 1 - dzone_total * bpc;
	i_total = itable_size * ipb;

	Ok(Geometry {
		n_total,
		itable_size,
		i_total,
		dzone_total,
	})
}

/// Format the regular file or block device at `path`. Its size must be a
/// whole number of blocks.
pub fn mkfs(path: &Path, opts: &Options) -> IoResult<Geometry> {
	log::trace!("mkfs({path:?}, {opts:?});");

	let file = OpenOptions::new().read(true).write(true).open(path)?;
	let size = file.metadata()?.len();
	if size == 0 || size % BLOCK_SIZE as u64 != 0 || size / BLOCK_SIZE as u64 > u32::MAX as u64 {
		iobail!(
			InvalidInput,
			"bad size of support device: {size} is not a whole number of blocks"
		);
	}

	format(file, (size / BLOCK_SIZE as u64) as u32, opts)
}

/// Format an open backing container of `n_total` blocks.
pub fn format<T: Backend>(dev: T, n_total: u32, opts: &Options) -> IoResult<Geometry> {
	let geo = plan(n_total, opts.inodes)?;
	log::info!(
		"formatting: {} blocks, {} inodes, {} clusters",
		geo.n_total,
		geo.i_total,
		geo.dzone_total
	);

	let mut dev = Codec::new(BlockIo::new(dev, true));

	let mut name = [0u8; VOLUME_NAME_LEN];
	let n = opts.name.len().min(VOLUME_NAME_LEN - 1);
	name[..n].copy_from_slice(&opts.name.as_bytes()[..n]);

	// while the format runs the volume carries the sentinel magic; anything
	// that dies half-way leaves an unmountable device behind
	let mut sb = Superblock {
		magic: MAGIC_UNFORMATTED,
		version: VERSION,
		name,
		n_total: geo.n_total,
		mstat: PRU,

		itable_start: 1,
		itable_size: geo.itable_size,
		i_total: geo.i_total,
		i_free: geo.i_total - 1,
		i_head: 1,
		i_tail: geo.i_total - 1,

		dzone_start: 1 + geo.itable_size,
		dzone_total: geo.dzone_total,
		dzone_free: geo.dzone_total - 1,
		d_head: 1,
		d_tail: geo.dzone_total - 1,

		retrieval: ClusterCache::empty_retrieval(),
		insertion: ClusterCache::empty_insertion(),

		reserved: [SB_RESERVED_FILL; SB_RESERVED_SIZE],
	};
	if geo.dzone_total == 1 {
		sb.d_head = NULL_CLUSTER;
		sb.d_tail = NULL_CLUSTER;
	}
	dev.encode_at(0, &sb)?;

	fill_inode_table(&mut dev, &sb)?;
	fill_root_dir(&mut dev, &sb)?;
	fill_free_chain(&mut dev, &sb, opts.zero)?;

	// the volume only becomes mountable now
	sb.magic = MAGIC;
	dev.encode_at(0, &sb)?;
	dev.inner_mut().flush()?;

	Ok(geo)
}

/// Inode 0 is the root directory; every other inode joins the free-clean
/// chain in ascending order.
fn fill_inode_table<T: Backend>(dev: &mut Codec<BlockIo<T>>, sb: &Superblock) -> IoResult<()> {
	log::debug!("filling in the inode table");

	let uid = unsafe { libc::getuid() };
	let gid = unsafe { libc::getgid() };

	let mut root = Inode::new(InodeKind::Directory, 0o755, uid, gid, unix_now());
	root.ref_count = 2; // . and the parent link from itself
	root.size = (DPC * DIRENT_SIZE) as u64;
	root.clu_count = 1;
	root.direct[0] = ROOT_CLUSTER;
	dev.encode_at(sb.inode_offset(ROOT_INODE), &root)?;

	for i in 1..sb.i_total {
		let next = if i == sb.i_total - 1 { NULL_INODE } else { i + 1 };
		let prev = if i == 1 { NULL_INODE } else { i - 1 };
		dev.encode_at(sb.inode_offset(i), &Inode::free_clean(next, prev))?;
	}
	Ok(())
}

/// Cluster 0 holds the root directory: `.` and `..` in the first two slots,
/// clean entries in the rest.
fn fill_root_dir<T: Backend>(dev: &mut Codec<BlockIo<T>>, sb: &Superblock) -> IoResult<()> {
	log::debug!("filling in the root directory");

	dev.encode_at(
		sb.cluster_offset(ROOT_CLUSTER),
		&ClusterHeader::detached(ROOT_INODE),
	)?;

	for k in 0..DPC {
		let e = match k {
			0 => DirEntry::new(b".", ROOT_INODE),
			1 => DirEntry::new(b"..", ROOT_INODE),
			_ => DirEntry::free_clean(),
		};
		dev.encode(&e)?;
	}
	// tail padding behind the last entry
	dev.fill(0u8, BSLPC - DPC * DIRENT_SIZE)
}

/// Chain clusters `1 .. dzone_total` into the double-linked free list.
fn fill_free_chain<T: Backend>(
	dev: &mut Codec<BlockIo<T>>,
	sb: &Superblock,
	zero: bool,
) -> IoResult<()> {
	log::debug!("creating the free cluster chain (zero={zero})");

	for l in 1..sb.dzone_total {
		let hdr = ClusterHeader {
			prev: if l == 1 { NULL_CLUSTER } else { l - 1 },
			next: if l == sb.dzone_total - 1 {
				NULL_CLUSTER
			} else {
				l + 1
			},
			stat: NULL_INODE,
		};
		dev.encode_at(sb.cluster_offset(l), &hdr)?;
		if zero {
			dev.fill(0u8, BSLPC)?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn plan_keeps_the_block_identity() {
		for (n_total, inodes) in [
			(4096, Some(512)),
			(4096, None),
			(517, None),
			(1000, Some(64)),
			(1 << 20, None),
		] {
			let g = plan(n_total, inodes).unwrap();
			assert_eq!(
				g.n_total,
				1 + g.itable_size + g.dzone_total * BLOCKS_PER_CLUSTER as u32,
				"identity broken for n_total={n_total}"
			);
			assert_eq!(g.i_total, g.itable_size * IPB as u32);
			assert!(g.dzone_total >= 1);
		}
	}

	#[test]
	fn plan_honours_requested_inodes() {
		// 512 inodes ask for 64 table blocks; the three blocks left over
		// after the cluster fit land in the table as well
		let g = plan(4096, Some(512)).unwrap();
		assert_eq!(g.itable_size, 67);
		assert_eq!(g.i_total, 536);
		assert_eq!(g.dzone_total, 1007);

		// a fit with no remainder keeps the request exact
		let g = plan(1 + 64 + 1007 * 4, Some(512)).unwrap();
		assert_eq!(g.i_total, 512);
		assert_eq!(g.dzone_total, 1007);
	}

	#[test]
	fn plan_rejects_tiny_devices() {
		assert!(plan(4, None).is_err());
	}
}
