use super::*;

use crate::{err, iobail};

/// How a new name is wired into a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOp {
	/// Link a fresh inode; a directory gets its first cluster with `.` and
	/// `..` installed.
	Add,
	/// Link an already-formed directory, repointing its `..` at the new
	/// parent.
	Attach,
}

/// How a name leaves a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOp {
	/// Tombstone the slot and reclaim the inode once its last link is gone.
	Rem,
	/// Clear the slot without reclaiming anything; the entry is about to be
	/// linked elsewhere.
	Detach,
}

/// Outcome of a name search in a directory.
#[derive(Debug, Clone, Copy)]
pub(super) enum DirSearch {
	Hit { inr: InodeNum, idx: u32 },
	/// Not found; `free_idx` is the first reusable slot, or the high-water
	/// mark when the directory is full.
	Miss { free_idx: u32 },
}

fn decode_entries(payload: &[u8]) -> IoResult<Vec<DirEntry>> {
	let mut c = Codec::new(Cursor::new(payload));
	(0..DPC).map(|_| c.decode()).collect()
}

fn encode_entries(entries: &[DirEntry]) -> IoResult<Vec<u8>> {
	let mut c = Codec::new(Cursor::new(Vec::with_capacity(BSLPC)));
	for e in entries {
		c.encode(e)?;
	}
	let mut buf = c.into_inner().into_inner();
	buf.resize(BSLPC, 0u8);
	Ok(buf)
}

impl<R: Backend> Sofs<R> {
	fn dir_slot_addr(&mut self, dino: &Inode, idx: u32) -> IoResult<u64> {
		let leaf = self.map_get_at(dino, idx / DPC as u32)?;
		if leaf == NULL_CLUSTER {
			iobail!(InvalidData, "directory slot {idx} lies in a hole");
		}
		let off = self.superblock.payload_offset(leaf);
		Ok(off + (idx as u64 % DPC as u64) * DIRENT_SIZE as u64)
	}

	fn read_dir_slot(&mut self, dino: &Inode, idx: u32) -> IoResult<DirEntry> {
		let addr = self.dir_slot_addr(dino, idx)?;
		self.file.decode_at(addr)
	}

	fn write_dir_slot(&mut self, dino: &Inode, idx: u32, e: &DirEntry) -> IoResult<()> {
		let addr = self.dir_slot_addr(dino, idx)?;
		self.file.encode_at(addr, e)
	}

	/// Search a directory for `name`, remembering the first reusable slot
	/// on the way. The caller must hold execute permission on the directory.
	pub(super) fn dir_search(&mut self, dinr: InodeNum, name: &[u8]) -> IoResult<DirSearch> {
		check_name_is_legal(name, true)?;

		let dino = self.read_inode(dinr, InodeState::InUse)?;
		if !dino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		self.access_granted(dinr, PERM_EXEC)?;

		let entries = (dino.size / DIRENT_SIZE as u64) as u32;
		let clusters = entries / DPC as u32;
		let mut free_idx = None;

		for ci in 0..clusters {
			let leaf = self.map_get_at(&dino, ci)?;
			if leaf == NULL_CLUSTER {
				iobail!(InvalidData, "directory {dinr} has a hole at cluster {ci}");
			}
			let mut payload = vec![0u8; BSLPC];
			self.read_payload(leaf, 0, &mut payload)?;

			for (k, e) in decode_entries(&payload)?.iter().enumerate() {
				let idx = ci * DPC as u32 + k as u32;
				match e.state() {
					DirEntryState::InUse if e.name() == name => {
						return Ok(DirSearch::Hit {
							inr: e.inode,
							idx,
						});
					}
					DirEntryState::FreeClean if free_idx.is_none() => {
						free_idx = Some(idx);
					}
					_ => (),
				}
			}
		}

		Ok(DirSearch::Miss {
			free_idx: free_idx.unwrap_or(entries),
		})
	}

	/// Find the inode a name resolves to inside directory `dinr`.
	pub fn dir_lookup(&mut self, dinr: InodeNum, name: &[u8]) -> IoResult<InodeNum> {
		log::trace!("dir_lookup({dinr}, {:?});", String::from_utf8_lossy(name));
		match self.dir_search(dinr, name)? {
			DirSearch::Hit { inr, .. } => Ok(inr),
			DirSearch::Miss { .. } => Err(err!(ENOENT)),
		}
	}

	/// Iterate the in-use entries of a directory, calling `f` with each
	/// entry and its slot index until `f` yields a value.
	pub fn dir_iter<T>(
		&mut self,
		dinr: InodeNum,
		mut f: impl FnMut(&DirEntry, u32) -> Option<T>,
	) -> IoResult<Option<T>> {
		let dino = self.read_inode(dinr, InodeState::InUse)?;
		if !dino.is_dir() {
			return Err(err!(ENOTDIR));
		}

		let entries = (dino.size / DIRENT_SIZE as u64) as u32;
		for ci in 0..entries / DPC as u32 {
			let leaf = self.map_get_at(&dino, ci)?;
			if leaf == NULL_CLUSTER {
				iobail!(InvalidData, "directory {dinr} has a hole at cluster {ci}");
			}
			let mut payload = vec![0u8; BSLPC];
			self.read_payload(leaf, 0, &mut payload)?;

			for (k, e) in decode_entries(&payload)?.iter().enumerate() {
				if e.state() != DirEntryState::InUse {
					continue;
				}
				let res = f(e, ci * DPC as u32 + k as u32);
				if res.is_some() {
					return Ok(res);
				}
			}
		}
		Ok(None)
	}

	/// True when the directory holds nothing besides `.` and `..`.
	pub fn dir_is_empty(&mut self, dinr: InodeNum) -> IoResult<bool> {
		let used = self.dir_iter(dinr, |_, idx| (idx >= 2).then_some(()))?;
		Ok(used.is_none())
	}

	/// Wire `name -> einr` into directory `dinr`.
	pub fn add_entry(
		&mut self,
		dinr: InodeNum,
		name: &[u8],
		einr: InodeNum,
		op: LinkOp,
	) -> IoResult<()> {
		log::trace!(
			"add_entry({dinr}, {:?}, {einr}, {op:?});",
			String::from_utf8_lossy(name)
		);
		self.assert_rw()?;
		check_name_is_legal(name, false)?;

		let mut dino = self.read_inode(dinr, InodeState::InUse)?;
		if !dino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		self.access_granted(dinr, PERM_WRITE | PERM_EXEC)?;

		let mut eino = self.read_inode(einr, InodeState::InUse)?;
		let entry_is_dir = eino.is_dir();
		if op == LinkOp::Attach && !entry_is_dir {
			return Err(err!(ENOTDIR));
		}

		let rc_gain: u32 = if entry_is_dir { 2 } else { 1 };
		if eino.ref_count + rc_gain > LINK_MAX ||
			(entry_is_dir && dino.ref_count + 1 > LINK_MAX)
		{
			return Err(err!(EMLINK));
		}

		let free_idx = match self.dir_search(dinr, name)? {
			DirSearch::Hit { .. } => return Err(err!(EEXIST)),
			DirSearch::Miss { free_idx } => free_idx,
		};

		// grow the directory by one cluster of clean slots when needed
		let entries = (dino.size / DIRENT_SIZE as u64) as u32;
		if free_idx == entries {
			let ci = free_idx / DPC as u32;
			let leaf = self.file_cluster(dinr, ci, MapOp::Alloc)?;
			let payload = encode_entries(&[DirEntry::free_clean(); DPC])?;
			self.write_payload(leaf, 0, &payload)?;

			dino = self.read_inode(dinr, InodeState::InUse)?;
			dino.size += (DPC * DIRENT_SIZE) as u64;
		}

		self.write_dir_slot(&dino, free_idx, &DirEntry::new(name, einr))?;

		match op {
			LinkOp::Add if entry_is_dir => {
				// a fresh directory: install its first cluster with . and ..
				let leaf = self.file_cluster(einr, 0, MapOp::Alloc)?;
				let mut slots = [DirEntry::free_clean(); DPC];
				slots[0] = DirEntry::new(b".", einr);
				slots[1] = DirEntry::new(b"..", dinr);
				let payload = encode_entries(&slots)?;
				self.write_payload(leaf, 0, &payload)?;

				eino = self.read_inode(einr, InodeState::InUse)?;
				eino.size = (DPC * DIRENT_SIZE) as u64;
				eino.ref_count += 2;
				dino.ref_count += 1;
			}
			LinkOp::Add => {
				eino.ref_count += 1;
			}
			LinkOp::Attach => {
				// repoint .. at the new parent
				let mut dotdot = self.read_dir_slot(&eino, 1)?;
				if dotdot.name() != b".." {
					iobail!(InvalidData, "directory {einr} slot 1 is not ..");
				}
				dotdot.inode = dinr;
				self.write_dir_slot(&eino, 1, &dotdot)?;

				eino.ref_count += 2;
				dino.ref_count += 1;
			}
		}

		self.write_inode(einr, &eino, InodeState::InUse)?;
		self.write_inode(dinr, &dino, InodeState::InUse)
	}

	/// Take `name` out of directory `dinr`.
	pub fn remove_entry(&mut self, dinr: InodeNum, name: &[u8], op: UnlinkOp) -> IoResult<()> {
		log::trace!(
			"remove_entry({dinr}, {:?}, {op:?});",
			String::from_utf8_lossy(name)
		);
		self.assert_rw()?;
		check_name_is_legal(name, false)?;

		let mut dino = self.read_inode(dinr, InodeState::InUse)?;
		if !dino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		self.access_granted(dinr, PERM_WRITE | PERM_EXEC)?;

		let (einr, idx) = match self.dir_search(dinr, name)? {
			DirSearch::Hit { inr, idx } => (inr, idx),
			DirSearch::Miss { .. } => return Err(err!(ENOENT)),
		};

		let mut eino = self.read_inode(einr, InodeState::InUse)?;
		let entry_is_dir = eino.is_dir();
		if entry_is_dir && op == UnlinkOp::Rem && !self.dir_is_empty(einr)? {
			return Err(err!(ENOTEMPTY));
		}

		let mut entry = self.read_dir_slot(&dino, idx)?;
		match op {
			UnlinkOp::Rem => entry.entomb(),
			UnlinkOp::Detach => entry = DirEntry::free_clean(),
		}
		self.write_dir_slot(&dino, idx, &entry)?;

		eino.ref_count -= 1;
		if entry_is_dir {
			// the entry's .. and the parent's link to it both vanish
			eino.ref_count -= 1;
			dino.ref_count -= 1;
		}

		if op == UnlinkOp::Rem && eino.ref_count == 0 {
			self.write_inode(einr, &eino, InodeState::InUse)?;
			self.file_clusters(einr, 0, MapOp::Free)?;
			self.free_inode(einr)?;
		} else {
			self.write_inode(einr, &eino, InodeState::InUse)?;
		}

		self.write_inode(dinr, &dino, InodeState::InUse)
	}

	/// Rename an entry in place; the slot keeps its position and target.
	pub fn rename_entry(&mut self, dinr: InodeNum, old: &[u8], new: &[u8]) -> IoResult<()> {
		log::trace!(
			"rename_entry({dinr}, {:?}, {:?});",
			String::from_utf8_lossy(old),
			String::from_utf8_lossy(new)
		);
		self.assert_rw()?;
		check_name_is_legal(old, false)?;
		check_name_is_legal(new, false)?;

		let dino = self.read_inode(dinr, InodeState::InUse)?;
		if !dino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		self.access_granted(dinr, PERM_WRITE | PERM_EXEC)?;

		let idx = match self.dir_search(dinr, old)? {
			DirSearch::Hit { idx, .. } => idx,
			DirSearch::Miss { .. } => return Err(err!(ENOENT)),
		};
		if let DirSearch::Hit { .. } = self.dir_search(dinr, new)? {
			return Err(err!(EEXIST));
		}

		let mut entry = self.read_dir_slot(&dino, idx)?;
		entry.set_name(new);
		self.write_dir_slot(&dino, idx, &entry)?;

		self.write_inode(dinr, &dino, InodeState::InUse)
	}
}
