use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{
	de::Decoder,
	enc::Encoder,
	error::{DecodeError, EncodeError},
	Decode, Encode,
};

/// Device I/O unit, in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Number of consecutive blocks forming one data cluster.
pub const BLOCKS_PER_CLUSTER: usize = 4;

/// Allocation unit of the data zone, in bytes.
pub const CLUSTER_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_CLUSTER;

/// Size of an on-disk inode.
pub const INODE_SIZE: usize = 64;

/// Inodes per block.
pub const IPB: usize = BLOCK_SIZE / INODE_SIZE;

/// Direct cluster references in an inode.
pub const N_DIRECT: usize = 5;

/// Cluster header: `prev`, `next` and `stat`, 4 bytes each.
pub const CLUSTER_HEADER_SIZE: usize = 12;

/// Byte-stream length per cluster: payload bytes left after the header.
pub const BSLPC: usize = CLUSTER_SIZE - CLUSTER_HEADER_SIZE;

/// Cluster references per indirection cluster.
pub const RPC: usize = BSLPC / 4;

/// Largest number of clusters a single file can reference.
pub const MAX_FILE_CLUSTERS: usize = N_DIRECT + RPC + RPC * RPC;

/// Largest byte size a file can reach through the three-level index.
pub const MAX_FILE_SIZE: u64 = MAX_FILE_CLUSTERS as u64 * BSLPC as u64;

/// Maximum length of a directory entry name, excluding the NUL terminator.
pub const MAX_NAME: usize = 59;

/// Size of an on-disk directory entry.
pub const DIRENT_SIZE: usize = MAX_NAME + 1 + 4;

/// Directory entries per cluster. Entries live in the cluster payload, so a
/// directory cluster carries `BSLPC - DPC * DIRENT_SIZE` bytes of tail padding.
pub const DPC: usize = BSLPC / DIRENT_SIZE;

/// Maximum length of an absolute path.
pub const MAX_PATH: usize = 255;

/// Capacity of the retrieval and insertion caches in the superblock.
pub const DZONE_CACHE_SIZE: usize = 10;

/// Magic number of a completely formatted volume.
pub const MAGIC: u32 = 0x501A;

/// Magic number a volume carries while mkfs is still running.
pub const MAGIC_UNFORMATTED: u32 = 0xFFFF;

/// On-disk format version.
pub const VERSION: u32 = 0x2014;

/// Sentinel inode number meaning "no inode".
pub const NULL_INODE: InodeNum = u32::MAX;

/// Sentinel logical cluster number meaning "no cluster".
pub const NULL_CLUSTER: ClusterNum = u32::MAX;

/// Inode of the root directory.
pub const ROOT_INODE: InodeNum = 0;

/// First cluster of the data zone, holding the root directory. Never freed.
pub const ROOT_CLUSTER: ClusterNum = 0;

/// How many symbolic links one path resolution may follow.
pub const SYMLINK_FOLLOW_MAX: u32 = 1;

/// Hard-link ceiling per inode.
pub const LINK_MAX: u32 = 0xFFFF;

/// Length of the NUL-padded volume name field in the superblock.
pub const VOLUME_NAME_LEN: usize = 32;

/// Bytes left in block 0 after all superblock fields; mkfs fills them with
/// [`SB_RESERVED_FILL`].
pub const SB_RESERVED_SIZE: usize =
	BLOCK_SIZE - 92 - 2 * (4 * DZONE_CACHE_SIZE + 4);

pub const SB_RESERVED_FILL: u8 = 0xEE;

/// Volume was properly unmounted.
pub const PRU: u32 = 1;

/// Volume was not properly unmounted.
pub const UDU: u32 = 2;

/// Inode mode bit: the inode is free (clean if no type bit remains).
pub const IF_FREE: u32 = 0x1000;

/// Inode mode bit: directory.
pub const IF_DIR: u32 = 0x2000;

/// Inode mode bit: regular file.
pub const IF_REG: u32 = 0x4000;

/// Inode mode bit: symbolic link.
pub const IF_LNK: u32 = 0x8000;

pub const IF_TYPE_MASK: u32 = IF_DIR | IF_REG | IF_LNK;

/// Permission bits: `rwxrwxrwx` for owner, group and other.
pub const PERM_MASK: u32 = 0o777;

pub const PERM_READ: u32 = 0o4;
pub const PERM_WRITE: u32 = 0o2;
pub const PERM_EXEC: u32 = 0o1;

/// SOFS-native inode number type.
pub type InodeNum = u32;

/// Logical data cluster number type.
pub type ClusterNum = u32;

/// Seconds since the Unix epoch, as stored in inode timestamps.
pub fn unix_now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

/// Type of an in-use inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
	Directory,
	RegularFile,
	Symlink,
}

impl InodeKind {
	pub fn mode_bit(self) -> u32 {
		match self {
			Self::Directory => IF_DIR,
			Self::RegularFile => IF_REG,
			Self::Symlink => IF_LNK,
		}
	}
}

/// Allocation state of an inode, derived from its mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeState {
	InUse,
	FreeClean,
	/// Freed, but the reference fields may still hold the dead file's
	/// clusters. Must be cleaned before reuse.
	FreeDirty,
}

/// Bounded stash of logical cluster numbers kept inside the superblock.
///
/// The retrieval cache hands clusters out (`idx` is the next slot to pop,
/// `DZONE_CACHE_SIZE` when empty); the insertion cache collects freed
/// clusters (`idx` is the next slot to fill, 0 when empty).
#[derive(Debug, Clone, Copy, Decode, Encode, PartialEq, Eq)]
pub struct ClusterCache {
	pub cache: [ClusterNum; DZONE_CACHE_SIZE],
	pub idx:   u32,
}

impl ClusterCache {
	pub fn empty_retrieval() -> Self {
		Self {
			cache: [NULL_CLUSTER; DZONE_CACHE_SIZE],
			idx:   DZONE_CACHE_SIZE as u32,
		}
	}

	pub fn empty_insertion() -> Self {
		Self {
			cache: [NULL_CLUSTER; DZONE_CACHE_SIZE],
			idx:   0,
		}
	}
}

/// Block 0 of the volume.
#[derive(Debug, Clone, Decode, Encode)]
pub struct Superblock {
	pub magic:   u32,
	pub version: u32,
	pub name:    [u8; VOLUME_NAME_LEN], // NUL-padded volume name
	pub n_total: u32,                   // total blocks on the device
	pub mstat:   u32,                   // PRU or UDU

	pub itable_start: u32, // always 1
	pub itable_size:  u32, // blocks taken by the inode table
	pub i_total:      u32, // itable_size * IPB
	pub i_free:       u32,
	pub i_head:       InodeNum,
	pub i_tail:       InodeNum,

	pub dzone_start: u32, // 1 + itable_size
	pub dzone_total: u32, // clusters in the data zone
	pub dzone_free:  u32,
	pub d_head:      ClusterNum,
	pub d_tail:      ClusterNum,

	pub retrieval: ClusterCache,
	pub insertion: ClusterCache,

	pub reserved: [u8; SB_RESERVED_SIZE],
}

impl Superblock {
	/// Byte offset of inode `n` inside the inode table.
	pub fn inode_offset(&self, n: InodeNum) -> u64 {
		let block = self.itable_start as u64 + n as u64 / IPB as u64;
		block * BLOCK_SIZE as u64 + (n as u64 % IPB as u64) * INODE_SIZE as u64
	}

	/// Byte offset of the first block of logical cluster `l`.
	pub fn cluster_offset(&self, l: ClusterNum) -> u64 {
		let block = self.dzone_start as u64 + l as u64 * BLOCKS_PER_CLUSTER as u64;
		block * BLOCK_SIZE as u64
	}

	/// Byte offset of the payload of logical cluster `l`.
	pub fn payload_offset(&self, l: ClusterNum) -> u64 {
		self.cluster_offset(l) + CLUSTER_HEADER_SIZE as u64
	}

	pub fn volume_name(&self) -> &str {
		let len = self
			.name
			.iter()
			.position(|b| *b == 0)
			.unwrap_or(VOLUME_NAME_LEN);
		std::str::from_utf8(&self.name[..len]).unwrap_or("")
	}
}

/// The shared `vD1`/`vD2` slots of an inode: timestamps while the inode is in
/// use, free-list links while it is free. The discriminant is the `IF_FREE`
/// bit of `mode`, applied at decode time; neither interpretation is readable
/// from the other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeOverlay {
	Times { atime: u32, mtime: u32 },
	Links { next: InodeNum, prev: InodeNum },
}

impl InodeOverlay {
	pub fn times(self) -> Option<(u32, u32)> {
		match self {
			Self::Times { atime, mtime } => Some((atime, mtime)),
			Self::Links { .. } => None,
		}
	}

	pub fn links(self) -> Option<(InodeNum, InodeNum)> {
		match self {
			Self::Links { next, prev } => Some((next, prev)),
			Self::Times { .. } => None,
		}
	}

	fn raw(self) -> (u32, u32) {
		match self {
			Self::Times { atime, mtime } => (atime, mtime),
			Self::Links { next, prev } => (next, prev),
		}
	}
}

/// One entry of the inode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
	pub mode:      u32,
	pub ref_count: u32,
	pub owner:     u32,
	pub group:     u32,
	pub size:      u64,
	pub clu_count: u32,
	pub overlay:   InodeOverlay,
	pub direct:    [ClusterNum; N_DIRECT],
	pub i1:        ClusterNum,
	pub i2:        ClusterNum,
}

impl Inode {
	/// A fresh member of the free-clean chain.
	pub fn free_clean(next: InodeNum, prev: InodeNum) -> Self {
		Self {
			mode:      IF_FREE,
			ref_count: 0,
			owner:     0,
			group:     0,
			size:      0,
			clu_count: 0,
			overlay:   InodeOverlay::Links { next, prev },
			direct:    [NULL_CLUSTER; N_DIRECT],
			i1:        NULL_CLUSTER,
			i2:        NULL_CLUSTER,
		}
	}

	/// A just-allocated inode of the given kind.
	pub fn new(kind: InodeKind, perm: u32, owner: u32, group: u32, now: u32) -> Self {
		Self {
			mode:      kind.mode_bit() | (perm & PERM_MASK),
			ref_count: 0,
			owner,
			group,
			size:      0,
			clu_count: 0,
			overlay:   InodeOverlay::Times { atime: now, mtime: now },
			direct:    [NULL_CLUSTER; N_DIRECT],
			i1:        NULL_CLUSTER,
			i2:        NULL_CLUSTER,
		}
	}

	pub fn kind(&self) -> Option<InodeKind> {
		match self.mode & IF_TYPE_MASK {
			IF_DIR => Some(InodeKind::Directory),
			IF_REG => Some(InodeKind::RegularFile),
			IF_LNK => Some(InodeKind::Symlink),
			_ => None,
		}
	}

	/// Allocation state, or `None` when the mode bits are contradictory.
	pub fn state(&self) -> Option<InodeState> {
		let free = self.mode & IF_FREE != 0;
		match (free, self.kind()) {
			(false, Some(_)) => Some(InodeState::InUse),
			(true, Some(_)) => Some(InodeState::FreeDirty),
			(true, None) if self.mode == IF_FREE => Some(InodeState::FreeClean),
			_ => None,
		}
	}

	pub fn perm(&self) -> u32 {
		self.mode & PERM_MASK
	}

	pub fn is_dir(&self) -> bool {
		self.kind() == Some(InodeKind::Directory)
	}

	/// Refresh the access time; in-use inodes only.
	pub fn touch_atime(&mut self, now: u32) {
		if let InodeOverlay::Times { atime, .. } = &mut self.overlay {
			*atime = now;
		}
	}

	/// Refresh both timestamps; in-use inodes only.
	pub fn touch_mtime(&mut self, now: u32) {
		if let InodeOverlay::Times { atime, mtime } = &mut self.overlay {
			*atime = now;
			*mtime = now;
		}
	}
}

impl Decode for Inode {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		let mode = u32::decode(d)?;
		let ref_count = u32::decode(d)?;
		let owner = u32::decode(d)?;
		let group = u32::decode(d)?;
		let size = u64::decode(d)?;
		let clu_count = u32::decode(d)?;
		let v_d1 = u32::decode(d)?;
		let v_d2 = u32::decode(d)?;

		// vD1/vD2 are timestamps while the inode is in use and free-list
		// links while it is free; the IF_FREE bit decides.
		let overlay = if mode & IF_FREE != 0 {
			InodeOverlay::Links {
				next: v_d1,
				prev: v_d2,
			}
		} else {
			InodeOverlay::Times {
				atime: v_d1,
				mtime: v_d2,
			}
		};

		Ok(Self {
			mode,
			ref_count,
			owner,
			group,
			size,
			clu_count,
			overlay,
			direct: <[ClusterNum; N_DIRECT]>::decode(d)?,
			i1: ClusterNum::decode(d)?,
			i2: ClusterNum::decode(d)?,
		})
	}
}

impl Encode for Inode {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.mode.encode(e)?;
		self.ref_count.encode(e)?;
		self.owner.encode(e)?;
		self.group.encode(e)?;
		self.size.encode(e)?;
		self.clu_count.encode(e)?;
		let (v_d1, v_d2) = self.overlay.raw();
		v_d1.encode(e)?;
		v_d2.encode(e)?;
		self.direct.encode(e)?;
		self.i1.encode(e)?;
		self.i2.encode(e)
	}
}

/// Header carried by every data cluster. While the cluster sits on the free
/// list, `prev`/`next` link it to its neighbours; once allocated, `stat`
/// holds the owning inode and `prev`/`next` chain the file's clusters in
/// logical order.
#[derive(Debug, Clone, Copy, Decode, Encode, PartialEq, Eq)]
pub struct ClusterHeader {
	pub prev: ClusterNum,
	pub next: ClusterNum,
	pub stat: InodeNum,
}

impl ClusterHeader {
	pub fn detached(stat: InodeNum) -> Self {
		Self {
			prev: NULL_CLUSTER,
			next: NULL_CLUSTER,
			stat,
		}
	}
}

/// State of one directory entry slot, recovered from the byte pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryState {
	InUse,
	FreeClean,
	/// Removed entry: `name[0]` was moved to `name[MAX_NAME]`, leaving the
	/// pair-of-zero-bytes check false at the tail. Never reused.
	Tombstone,
}

/// Fixed-size directory entry record.
#[derive(Debug, Clone, Copy, Decode, Encode, PartialEq, Eq)]
pub struct DirEntry {
	pub name:  [u8; MAX_NAME + 1],
	pub inode: InodeNum,
}

impl DirEntry {
	pub fn free_clean() -> Self {
		Self {
			name:  [0u8; MAX_NAME + 1],
			inode: NULL_INODE,
		}
	}

	pub fn new(name: &[u8], inode: InodeNum) -> Self {
		debug_assert!(!name.is_empty() && name.len() <= MAX_NAME);
		let mut e = Self::free_clean();
		e.name[..name.len()].copy_from_slice(name);
		e.inode = inode;
		e
	}

	pub fn state(&self) -> DirEntryState {
		if self.name[0] != 0 {
			DirEntryState::InUse
		} else if self.name[MAX_NAME] != 0 {
			DirEntryState::Tombstone
		} else {
			DirEntryState::FreeClean
		}
	}

	/// Entry name, up to the first NUL.
	pub fn name(&self) -> &[u8] {
		let len = self
			.name
			.iter()
			.position(|b| *b == 0)
			.unwrap_or(MAX_NAME + 1);
		&self.name[..len]
	}

	/// Overwrite just the name bytes, keeping the target inode.
	pub fn set_name(&mut self, name: &[u8]) {
		debug_assert!(!name.is_empty() && name.len() <= MAX_NAME);
		self.name = [0u8; MAX_NAME + 1];
		self.name[..name.len()].copy_from_slice(name);
	}

	/// Turn an in-use entry into a tombstone.
	pub fn entomb(&mut self) {
		self.name[MAX_NAME] = self.name[0];
		self.name[0] = 0;
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn encoded_len<T: Encode>(v: &T) -> usize {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();
		bincode::encode_to_vec(v, cfg).unwrap().len()
	}

	#[test]
	fn record_sizes() {
		assert_eq!(encoded_len(&Inode::free_clean(1, NULL_INODE)), INODE_SIZE);
		assert_eq!(encoded_len(&DirEntry::free_clean()), DIRENT_SIZE);
		assert_eq!(
			encoded_len(&ClusterHeader::detached(NULL_INODE)),
			CLUSTER_HEADER_SIZE
		);
	}

	#[test]
	fn superblock_fills_block_0() {
		let sb = Superblock {
			magic:        MAGIC,
			version:      VERSION,
			name:         [0u8; VOLUME_NAME_LEN],
			n_total:      0,
			mstat:        PRU,
			itable_start: 1,
			itable_size:  0,
			i_total:      0,
			i_free:       0,
			i_head:       NULL_INODE,
			i_tail:       NULL_INODE,
			dzone_start:  1,
			dzone_total:  0,
			dzone_free:   0,
			d_head:       NULL_CLUSTER,
			d_tail:       NULL_CLUSTER,
			retrieval:    ClusterCache::empty_retrieval(),
			insertion:    ClusterCache::empty_insertion(),
			reserved:     [SB_RESERVED_FILL; SB_RESERVED_SIZE],
		};
		assert_eq!(encoded_len(&sb), BLOCK_SIZE);
	}

	#[test]
	fn geometry() {
		assert_eq!(CLUSTER_SIZE % INODE_SIZE, 0);
		assert_eq!(BLOCK_SIZE % INODE_SIZE, 0);
		assert_eq!(BSLPC % 4, 0);
		assert!(DPC * DIRENT_SIZE <= BSLPC);
	}

	#[test]
	fn inode_overlay_follows_free_bit() {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();

		let free = Inode::free_clean(7, 3);
		let bytes = bincode::encode_to_vec(&free, cfg).unwrap();
		let (back, _): (Inode, usize) =
			bincode::decode_from_slice(&bytes, cfg).unwrap();
		assert_eq!(back.overlay.links(), Some((7, 3)));
		assert_eq!(back.overlay.times(), None);

		let live = Inode::new(InodeKind::RegularFile, 0o644, 10, 20, 99);
		let bytes = bincode::encode_to_vec(&live, cfg).unwrap();
		let (back, _): (Inode, usize) =
			bincode::decode_from_slice(&bytes, cfg).unwrap();
		assert_eq!(back.overlay.times(), Some((99, 99)));
		assert_eq!(back.state(), Some(InodeState::InUse));
	}

	#[test]
	fn dir_entry_states() {
		let mut e = DirEntry::new(b"report.txt", 12);
		assert_eq!(e.state(), DirEntryState::InUse);
		assert_eq!(e.name(), b"report.txt");

		e.entomb();
		assert_eq!(e.state(), DirEntryState::Tombstone);
		assert_eq!(e.name[MAX_NAME], b'r');

		assert_eq!(DirEntry::free_clean().state(), DirEntryState::FreeClean);
	}

	#[test]
	fn inode_states() {
		let mut ino = Inode::new(InodeKind::Directory, 0o755, 0, 0, 1);
		assert_eq!(ino.state(), Some(InodeState::InUse));

		ino.mode |= IF_FREE;
		assert_eq!(ino.state(), Some(InodeState::FreeDirty));

		assert_eq!(
			Inode::free_clean(NULL_INODE, NULL_INODE).state(),
			Some(InodeState::FreeClean)
		);
	}
}
