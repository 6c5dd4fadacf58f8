use std::{
	fs::File,
	io::{Cursor, Result as IoResult, Write},
	path::Path,
};

mod access;
mod cluster;
mod dalloc;
mod dir;
mod file;
mod filemap;
mod ialloc;
mod itable;
mod ops;
mod path;

pub use dir::{LinkOp, UnlinkOp};
pub use filemap::MapOp;

use crate::{
	blockio::{Backend, BlockIo},
	codec::Codec,
	data::*,
};

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		std::io::Error::from_raw_os_error(::libc::$name)
	};
}

/// (INTERNAL) Bail out with an [`std::io::Error`] of the given kind.
#[macro_export]
macro_rules! iobail {
	($kind:ident, $($tk:tt)+) => {
		return Err(std::io::Error::new(
			std::io::ErrorKind::$kind,
			format!($($tk)+),
		))
	};
}

/// Summary of filesystem statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Total blocks on the device.
	pub blocks: u64,

	/// Clusters in the data zone.
	pub clusters: u64,

	/// Free clusters.
	pub cfree: u64,

	/// Number of inodes.
	pub files: u64,

	/// Number of free inodes.
	pub ffree: u64,

	/// Block size.
	pub bsize: u32,

	/// Cluster size.
	pub csize: u32,

	/// Volume name.
	pub name: String,
}

/// A mounted SOFS14 volume.
///
/// One handle owns the device, the block buffer and the in-memory superblock;
/// the core has no global state. All operations run to completion before the
/// next begins.
pub struct Sofs<R: Backend> {
	file:       Codec<BlockIo<R>>,
	superblock: Superblock,

	// credentials used for permission checks
	uid: u32,
	gid: u32,
}

impl Sofs<File> {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let file = BlockIo::open(path, rw)?;
		Self::new(file)
	}
}

impl<R: Backend> Sofs<R> {
	pub fn new(file: BlockIo<R>) -> IoResult<Self> {
		let mut file = Codec::new(file);

		let superblock: Superblock = file.decode_at(0)?;
		match superblock.magic {
			MAGIC => (),
			MAGIC_UNFORMATTED => {
				iobail!(InvalidInput, "volume formatting never completed")
			}
			magic => {
				iobail!(InvalidInput, "invalid superblock magic number: {magic:#06x}")
			}
		}

		let uid = unsafe { libc::getuid() };
		let gid = unsafe { libc::getgid() };
		let mut s = Self {
			file,
			superblock,
			uid,
			gid,
		};
		s.check()?;

		if s.superblock.mstat == UDU {
			log::warn!(
				"volume {:?} was not properly unmounted; stale free-dirty objects may exist",
				s.superblock.volume_name()
			);
		}

		// mark the volume as mounted; unmount() undoes this as its last write
		if s.write_enabled() {
			s.update_sb(|sb| sb.mstat = UDU)?;
		}

		Ok(s)
	}

	pub fn write_enabled(&self) -> bool {
		self.file.inner().write_enabled()
	}

	pub(super) fn assert_rw(&self) -> IoResult<()> {
		if self.write_enabled() {
			Ok(())
		} else {
			Err(err!(EROFS))
		}
	}

	/// Caller identity used for permission checks. Defaults to the process
	/// uid/gid.
	pub fn set_credentials(&mut self, uid: u32, gid: u32) {
		self.uid = uid;
		self.gid = gid;
	}

	pub fn superblock(&self) -> &Superblock {
		&self.superblock
	}

	/// Get filesystem metadata.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Info {
		let sb = &self.superblock;
		Info {
			blocks:   sb.n_total as u64,
			clusters: sb.dzone_total as u64,
			cfree:    sb.dzone_free as u64,
			files:    sb.i_total as u64,
			ffree:    sb.i_free as u64,
			bsize:    BLOCK_SIZE as u32,
			csize:    CLUSTER_SIZE as u32,
			name:     sb.volume_name().to_owned(),
		}
	}

	/// Cheap superblock consistency check: ranges, counts and the arithmetic
	/// identity of the layout. No list walks.
	fn check(&mut self) -> IoResult<()> {
		let sb = &self.superblock;
		log::debug!("Superblock: {sb:#?}");

		log::info!("Volume: {:?}", sb.volume_name());
		log::info!("# Blocks: {}", sb.n_total);
		log::info!("# Inodes: {} ({} free)", sb.i_total, sb.i_free);
		log::info!("# Clusters: {} ({} free)", sb.dzone_total, sb.dzone_free);

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					log::error!("superblock corrupted: {}", stringify!($e));
					return Err(err!(EIO));
				}
			};
		}

		sbassert!(sb.version == VERSION);
		sbassert!(sb.mstat == PRU || sb.mstat == UDU);

		sbassert!(sb.itable_start == 1);
		sbassert!(sb.itable_size > 0);
		sbassert!(sb.i_total == sb.itable_size * IPB as u32);
		sbassert!(sb.dzone_start == 1 + sb.itable_size);
		sbassert!(sb.dzone_total > 0);
		sbassert!(
			sb.n_total ==
				1 + sb.itable_size + sb.dzone_total * BLOCKS_PER_CLUSTER as u32
		);

		sbassert!(sb.i_free < sb.i_total);
		sbassert!((sb.i_head == NULL_INODE) == (sb.i_tail == NULL_INODE));
		sbassert!((sb.i_head == NULL_INODE) == (sb.i_free == 0));
		sbassert!(sb.i_head == NULL_INODE || sb.i_head < sb.i_total);
		sbassert!(sb.i_tail == NULL_INODE || sb.i_tail < sb.i_total);

		sbassert!(sb.dzone_free < sb.dzone_total);
		sbassert!((sb.d_head == NULL_CLUSTER) == (sb.d_tail == NULL_CLUSTER));
		sbassert!(sb.d_head == NULL_CLUSTER || sb.d_head < sb.dzone_total);
		sbassert!(sb.d_tail == NULL_CLUSTER || sb.d_tail < sb.dzone_total);

		sbassert!(sb.retrieval.idx <= DZONE_CACHE_SIZE as u32);
		sbassert!(sb.insertion.idx <= DZONE_CACHE_SIZE as u32);

		log::info!("OK");
		Ok(())
	}

	pub(super) fn update_sb(&mut self, f: impl FnOnce(&mut Superblock)) -> IoResult<()> {
		f(&mut self.superblock);
		self.file.encode_at(0, &self.superblock)?;
		Ok(())
	}

	/// Flush the in-memory superblock after direct field manipulation.
	pub(super) fn store_sb(&mut self) -> IoResult<()> {
		self.update_sb(|_| ())
	}

	/// Flush everything and stamp the volume as properly unmounted. The
	/// mount-state flip is the final write.
	pub fn unmount(mut self) -> IoResult<()> {
		if !self.write_enabled() {
			return Ok(());
		}
		self.file.inner_mut().flush()?;
		self.update_sb(|sb| sb.mstat = PRU)?;
		self.file.inner_mut().flush()
	}
}

/// A directory entry name: non-empty, at most [`MAX_NAME`] bytes, no `/` or
/// NUL, and not one of the special entries unless explicitly allowed.
fn check_name_is_legal(name: &[u8], allow_special: bool) -> IoResult<()> {
	if name.is_empty() {
		return Err(err!(EINVAL));
	}
	if name.len() > MAX_NAME {
		return Err(err!(ENAMETOOLONG));
	}

	let x = name.contains(&b'/') ||
		(name == b"." && !allow_special) ||
		(name == b".." && !allow_special) ||
		name.contains(&0);

	if x {
		Err(err!(EINVAL))
	} else {
		Ok(())
	}
}
