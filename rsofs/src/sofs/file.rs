use super::*;

use crate::err;

impl<R: Backend> Sofs<R> {
	/// Read the payload of file cluster `clust_ind`, zeros if the index has
	/// no cluster there.
	pub fn read_file_cluster(&mut self, inr: InodeNum, clust_ind: u32) -> IoResult<Vec<u8>> {
		log::trace!("read_file_cluster({inr}, {clust_ind});");
		let ino = self.read_inode(inr, InodeState::InUse)?;

		let mut buf = vec![0u8; BSLPC];
		match self.map_get_at(&ino, clust_ind)? {
			NULL_CLUSTER => (),
			leaf => self.read_payload(leaf, 0, &mut buf)?,
		}
		Ok(buf)
	}

	/// Overwrite the payload of file cluster `clust_ind`, allocating it on
	/// first touch.
	pub fn write_file_cluster(&mut self, inr: InodeNum, clust_ind: u32, buf: &[u8]) -> IoResult<()> {
		log::trace!("write_file_cluster({inr}, {clust_ind});");
		self.assert_rw()?;
		assert!(buf.len() <= BSLPC);

		let ino = self.read_inode(inr, InodeState::InUse)?;
		let leaf = match self.map_get_at(&ino, clust_ind)? {
			NULL_CLUSTER => {
				let leaf = self.file_cluster(inr, clust_ind, MapOp::Alloc)?;
				self.zero_payload(leaf)?;
				leaf
			}
			leaf => leaf,
		};
		self.write_payload(leaf, 0, buf)
	}

	/// Read file bytes at `offset`. Returns the number of bytes read, short
	/// only at end of file; holes read as zeros.
	pub fn file_read(&mut self, inr: InodeNum, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
		log::trace!("file_read({inr}, {offset}, {});", buf.len());

		let ino = self.read_inode(inr, InodeState::InUse)?;
		match ino.kind() {
			Some(InodeKind::RegularFile) => (),
			Some(InodeKind::Directory) => return Err(err!(EISDIR)),
			_ => return Err(err!(EINVAL)),
		}
		self.access_granted(inr, PERM_READ)?;

		if offset >= ino.size {
			return Ok(0);
		}
		let len = (buf.len() as u64).min(ino.size - offset);

		let mut done = 0usize;
		let mut pos = offset;
		while done < len as usize {
			let ci = (pos / BSLPC as u64) as u32;
			let within = (pos % BSLPC as u64) as usize;
			let n = (BSLPC - within).min(len as usize - done);

			match self.map_get_at(&ino, ci)? {
				NULL_CLUSTER => buf[done..done + n].fill(0u8),
				leaf => self.read_payload(leaf, within, &mut buf[done..done + n])?,
			}

			done += n;
			pos += n as u64;
		}

		Ok(done)
	}

	/// Write file bytes at `offset`, allocating clusters as needed and
	/// growing the file size past the end of the write.
	pub fn file_write(&mut self, inr: InodeNum, offset: u64, buf: &[u8]) -> IoResult<usize> {
		log::trace!("file_write({inr}, {offset}, {});", buf.len());
		self.assert_rw()?;

		let ino = self.read_inode(inr, InodeState::InUse)?;
		match ino.kind() {
			Some(InodeKind::RegularFile) => (),
			Some(InodeKind::Directory) => return Err(err!(EISDIR)),
			_ => return Err(err!(EINVAL)),
		}
		self.access_granted(inr, PERM_WRITE)?;

		let end = offset
			.checked_add(buf.len() as u64)
			.filter(|e| *e <= MAX_FILE_SIZE)
			.ok_or(err!(EFBIG))?;
		if buf.is_empty() {
			return Ok(0);
		}

		let mut done = 0usize;
		let mut pos = offset;
		let mut ino = ino;
		while done < buf.len() {
			let ci = (pos / BSLPC as u64) as u32;
			let within = (pos % BSLPC as u64) as usize;
			let n = (BSLPC - within).min(buf.len() - done);

			let leaf = match self.map_get_at(&ino, ci)? {
				NULL_CLUSTER => {
					let leaf = self.file_cluster(inr, ci, MapOp::Alloc)?;
					self.zero_payload(leaf)?;
					// the allocation rewrote the inode
					ino = self.read_inode(inr, InodeState::InUse)?;
					leaf
				}
				leaf => leaf,
			};
			self.write_payload(leaf, within, &buf[done..done + n])?;

			done += n;
			pos += n as u64;
		}

		if end > ino.size {
			ino.size = end;
		}
		self.write_inode(inr, &ino, InodeState::InUse)?;

		Ok(done)
	}
}
