use super::*;

use crate::{err, iobail};

impl<R: Backend> Sofs<R> {
	/// Decode inode `n` straight from the table, with only a range check.
	pub(super) fn load_inode(&mut self, inr: InodeNum) -> IoResult<Inode> {
		if inr >= self.superblock.i_total {
			return Err(err!(EINVAL));
		}
		let off = self.superblock.inode_offset(inr);
		self.file.decode_at(off)
	}

	fn store_inode(&mut self, inr: InodeNum, ino: &Inode) -> IoResult<()> {
		let off = self.superblock.inode_offset(inr);
		self.file.encode_at(off, ino)
	}

	/// Read inode `inr` and verify it is in the expected state.
	///
	/// In-use reads refresh the access time on writable mounts.
	pub fn read_inode(&mut self, inr: InodeNum, expected: InodeState) -> IoResult<Inode> {
		log::trace!("read_inode({inr}, {expected:?});");
		let mut ino = self.load_inode(inr)?;

		if ino.state() != Some(expected) {
			iobail!(
				InvalidData,
				"inconsistent inode {inr}: expected {expected:?}, found {:?} (mode {:#x})",
				ino.state(),
				ino.mode
			);
		}

		if expected == InodeState::InUse && self.write_enabled() {
			ino.touch_atime(unix_now());
			self.store_inode(inr, &ino)?;
		}

		Ok(ino)
	}

	/// Validate and write back inode `inr`.
	///
	/// In-use writes refresh both the modification and access times.
	pub(super) fn write_inode(
		&mut self,
		inr: InodeNum,
		ino: &Inode,
		expected: InodeState,
	) -> IoResult<()> {
		log::trace!("write_inode({inr}, {expected:?});");
		self.assert_rw()?;

		if ino.state() != Some(expected) {
			iobail!(
				InvalidData,
				"refusing to write inode {inr} in state {:?} as {expected:?}",
				ino.state()
			);
		}

		if expected == InodeState::InUse {
			let mut ino = ino.clone();
			ino.touch_mtime(unix_now());
			self.store_inode(inr, &ino)
		} else {
			self.store_inode(inr, ino)
		}
	}
}
