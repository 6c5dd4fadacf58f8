use super::*;

use crate::err;

/// Path-level operations: thin adapters from absolute paths onto the core
/// directory, allocator and file-map calls.
impl<R: Backend> Sofs<R> {
	/// Inode of the entry a path resolves to.
	pub fn lookup(&mut self, path: &str) -> IoResult<InodeNum> {
		Ok(self.resolve(path)?.1)
	}

	/// Create a regular file.
	#[doc(alias = "creat")]
	pub fn mknod(&mut self, path: &str, perm: u32) -> IoResult<InodeNum> {
		log::trace!("mknod({path:?}, {perm:#o});");
		self.create(path, InodeKind::RegularFile, perm, LinkOp::Add)
	}

	/// Create a directory, with `.` and `..` installed.
	pub fn mkdir(&mut self, path: &str, perm: u32) -> IoResult<InodeNum> {
		log::trace!("mkdir({path:?}, {perm:#o});");
		self.create(path, InodeKind::Directory, perm, LinkOp::Add)
	}

	/// Create a symbolic link at `link` pointing to `target`.
	pub fn symlink(&mut self, target: &str, link: &str) -> IoResult<InodeNum> {
		log::trace!("symlink({target:?}, {link:?});");
		self.assert_rw()?;

		if target.is_empty() || target.contains('\0') {
			return Err(err!(EINVAL));
		}
		if target.len() > MAX_PATH {
			return Err(err!(ENAMETOOLONG));
		}

		let inr = self.create(link, InodeKind::Symlink, 0o777, LinkOp::Add)?;

		let leaf = self.file_cluster(inr, 0, MapOp::Alloc)?;
		self.zero_payload(leaf)?;
		self.write_payload(leaf, 0, target.as_bytes())?;

		let mut ino = self.read_inode(inr, InodeState::InUse)?;
		ino.size = target.len() as u64;
		self.write_inode(inr, &ino, InodeState::InUse)?;

		Ok(inr)
	}

	fn create(&mut self, path: &str, kind: InodeKind, perm: u32, op: LinkOp) -> IoResult<InodeNum> {
		self.assert_rw()?;
		let (parent, name) = self.resolve_parent(path)?;

		// probe first so a name clash does not leak a fresh inode
		match self.dir_lookup(parent, &name) {
			Ok(_) => return Err(err!(EEXIST)),
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => (),
			Err(e) => return Err(e),
		}

		let inr = self.alloc_inode(kind, perm)?;
		self.add_entry(parent, &name, inr, op)?;
		Ok(inr)
	}

	/// Remove a non-directory entry, reclaiming the inode once its last
	/// link is gone.
	pub fn unlink(&mut self, path: &str) -> IoResult<()> {
		log::trace!("unlink({path:?});");
		self.assert_rw()?;

		let (parent, name) = self.resolve_parent(path)?;
		let einr = self.dir_lookup(parent, &name)?;
		if self.read_inode(einr, InodeState::InUse)?.is_dir() {
			return Err(err!(EISDIR));
		}
		self.remove_entry(parent, &name, UnlinkOp::Rem)
	}

	/// Remove an empty directory.
	pub fn rmdir(&mut self, path: &str) -> IoResult<()> {
		log::trace!("rmdir({path:?});");
		self.assert_rw()?;

		let (parent, name) = self.resolve_parent(path)?;
		let einr = self.dir_lookup(parent, &name)?;
		if !self.read_inode(einr, InodeState::InUse)?.is_dir() {
			return Err(err!(ENOTDIR));
		}
		self.remove_entry(parent, &name, UnlinkOp::Rem)
	}

	/// Move `from` to `to`. Within one directory this is an in-place rename;
	/// across directories the entry is detached and re-linked, keeping the
	/// inode's link count unchanged. An existing target is removed first.
	pub fn rename(&mut self, from: &str, to: &str) -> IoResult<()> {
		log::trace!("rename({from:?}, {to:?});");
		self.assert_rw()?;

		let (dp1, n1) = self.resolve_parent(from)?;
		let (dp2, n2) = self.resolve_parent(to)?;

		let einr = self.dir_lookup(dp1, &n1)?;
		if dp1 == dp2 && n1 == n2 {
			return Ok(());
		}

		let entry_is_dir = self.read_inode(einr, InodeState::InUse)?.is_dir();

		if entry_is_dir {
			// a directory must not move under its own subtree
			let mut cur = dp2;
			loop {
				if cur == einr {
					return Err(err!(EINVAL));
				}
				if cur == ROOT_INODE {
					break;
				}
				cur = self.dir_lookup(cur, b"..")?;
			}
		}

		// an existing target is replaced
		match self.dir_lookup(dp2, &n2) {
			Ok(tinr) if tinr == einr => return Ok(()),
			Ok(tinr) => {
				let target_is_dir = self.read_inode(tinr, InodeState::InUse)?.is_dir();
				match (entry_is_dir, target_is_dir) {
					(false, true) => return Err(err!(EISDIR)),
					(true, false) => return Err(err!(ENOTDIR)),
					_ => (),
				}
				self.remove_entry(dp2, &n2, UnlinkOp::Rem)?;
			}
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => (),
			Err(e) => return Err(e),
		}

		if dp1 == dp2 {
			return self.rename_entry(dp1, &n1, &n2);
		}

		self.remove_entry(dp1, &n1, UnlinkOp::Detach)?;
		let op = if entry_is_dir {
			LinkOp::Attach
		} else {
			LinkOp::Add
		};
		self.add_entry(dp2, &n2, einr, op)
	}

	/// Read bytes from the file a path resolves to.
	pub fn read(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
		let inr = self.lookup(path)?;
		self.file_read(inr, offset, buf)
	}

	/// Write bytes to the file a path resolves to.
	pub fn write(&mut self, path: &str, offset: u64, buf: &[u8]) -> IoResult<usize> {
		let inr = self.lookup(path)?;
		self.file_write(inr, offset, buf)
	}

	/// Target of the symbolic link at `path`, without following it.
	pub fn readlink(&mut self, path: &str) -> IoResult<Vec<u8>> {
		let (parent, name) = self.resolve_parent(path)?;
		let inr = self.dir_lookup(parent, &name)?;
		self.symlink_read(inr)
	}
}
