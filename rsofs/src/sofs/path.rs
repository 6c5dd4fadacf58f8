use std::collections::VecDeque;

use super::*;

use crate::{err, iobail};

impl<R: Backend> Sofs<R> {
	/// Resolve an absolute path to `(directory inode, entry inode)`.
	///
	/// Symbolic links are followed wherever they appear, intermediate or
	/// final, against a per-resolution budget of [`SYMLINK_FOLLOW_MAX`];
	/// exceeding it fails with `ELOOP`. `"/"` resolves to the root inode in
	/// both positions.
	pub fn resolve(&mut self, path: &str) -> IoResult<(InodeNum, InodeNum)> {
		log::trace!("resolve({path:?});");
		check_path_is_legal(path)?;

		let mut comps: VecDeque<Vec<u8>> = split_path(path.as_bytes());
		let mut dir = ROOT_INODE;
		let mut ent = ROOT_INODE;
		let mut followed = 0u32;

		while let Some(comp) = comps.pop_front() {
			if comp.len() > MAX_NAME {
				return Err(err!(ENAMETOOLONG));
			}

			// last round's entry is this round's directory
			dir = ent;
			ent = self.dir_lookup(dir, &comp)?;

			let ino = self.read_inode(ent, InodeState::InUse)?;
			if ino.kind() != Some(InodeKind::Symlink) {
				continue;
			}

			if followed >= SYMLINK_FOLLOW_MAX {
				return Err(err!(ELOOP));
			}
			followed += 1;

			let target = self.symlink_target(ent, &ino)?;
			let mut spliced = split_path(&target);
			if target[0] == b'/' {
				// absolute target: restart from the root
				dir = ROOT_INODE;
				ent = ROOT_INODE;
			} else {
				// relative target: continue under the containing directory
				ent = dir;
			}
			while let Some(c) = spliced.pop_back() {
				comps.push_front(c);
			}
		}

		Ok((dir, ent))
	}

	/// Resolve the parent directory of `path` and return it together with
	/// the final component. The leaf itself need not exist.
	pub(super) fn resolve_parent(&mut self, path: &str) -> IoResult<(InodeNum, Vec<u8>)> {
		check_path_is_legal(path)?;

		let trimmed = path.trim_end_matches('/');
		if trimmed.is_empty() {
			// the root has no parent entry to speak of
			return Err(err!(EINVAL));
		}

		let cut = trimmed.rfind('/').unwrap();
		let (dir, base) = (&trimmed[..cut], &trimmed[cut + 1..]);
		if base.len() > MAX_NAME {
			return Err(err!(ENAMETOOLONG));
		}

		let dir = if dir.is_empty() { "/" } else { dir };
		let (_, parent) = self.resolve(dir)?;
		Ok((parent, base.as_bytes().to_vec()))
	}

	/// Read the contents of a symbolic link.
	#[doc(alias = "readlink")]
	pub fn symlink_read(&mut self, inr: InodeNum) -> IoResult<Vec<u8>> {
		let ino = self.read_inode(inr, InodeState::InUse)?;
		if ino.kind() != Some(InodeKind::Symlink) {
			return Err(err!(EINVAL));
		}
		self.symlink_target(inr, &ino)
	}

	fn symlink_target(&mut self, inr: InodeNum, ino: &Inode) -> IoResult<Vec<u8>> {
		// the target lives at the start of the first cluster
		if ino.size == 0 || ino.size > MAX_PATH as u64 {
			iobail!(InvalidData, "symlink {inr} has target length {}", ino.size);
		}
		let leaf = self.map_get_at(ino, 0)?;
		if leaf == NULL_CLUSTER {
			iobail!(InvalidData, "symlink {inr} has no target cluster");
		}

		let mut buf = vec![0u8; ino.size as usize];
		self.read_payload(leaf, 0, &mut buf)?;
		if buf.contains(&0) {
			iobail!(InvalidData, "symlink {inr} target contains NUL");
		}
		Ok(buf)
	}
}

fn check_path_is_legal(path: &str) -> IoResult<()> {
	if path.len() > MAX_PATH {
		return Err(err!(ENAMETOOLONG));
	}
	if !path.starts_with('/') {
		// relative paths only enter through symlink targets
		return Err(err!(EINVAL));
	}
	Ok(())
}

fn split_path(path: &[u8]) -> VecDeque<Vec<u8>> {
	path.split(|b| *b == b'/')
		.filter(|c| !c.is_empty())
		.map(|c| c.to_vec())
		.collect()
}
