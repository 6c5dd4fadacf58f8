use super::*;

use crate::{err, iobail};

impl<R: Backend> Sofs<R> {
	/// Allocate an inode of the given kind from the head of the free list.
	///
	/// A head inode still in the dirty state is cleaned before reuse, so the
	/// caller always receives a fully reset inode owned by the current
	/// credentials.
	pub fn alloc_inode(&mut self, kind: InodeKind, perm: u32) -> IoResult<InodeNum> {
		log::trace!("alloc_inode({kind:?}, {perm:#o});");
		self.assert_rw()?;

		if self.superblock.i_free == 0 {
			return Err(err!(ENOSPC));
		}

		let inr = self.superblock.i_head;
		if inr == NULL_INODE {
			iobail!(
				InvalidData,
				"free inode accounting out of sync: iFree={} but list is empty",
				self.superblock.i_free
			);
		}

		let mut ino = self.load_inode(inr)?;
		match ino.state() {
			Some(InodeState::FreeClean) => (),
			Some(InodeState::FreeDirty) => {
				self.clean_inode(inr)?;
				ino = self.load_inode(inr)?;
			}
			other => {
				iobail!(
					InvalidData,
					"inconsistent free inode {inr} at list head: state {other:?}"
				)
			}
		}

		let Some((next, prev)) = ino.overlay.links() else {
			iobail!(InvalidData, "free inode {inr} carries timestamps, not links");
		};
		if prev != NULL_INODE {
			iobail!(InvalidData, "free list head {inr} has prev={prev}");
		}

		// unlink from the head
		if next == NULL_INODE {
			debug_assert_eq!(self.superblock.i_tail, inr);
		} else {
			let mut hd = self.load_inode(next)?;
			match hd.overlay.links() {
				Some((hd_next, _)) => {
					hd.overlay = InodeOverlay::Links {
						next: hd_next,
						prev: NULL_INODE,
					};
				}
				None => iobail!(InvalidData, "inconsistent free inode {next}"),
			}
			let state = hd.state().ok_or(err!(EIO))?;
			self.write_inode(next, &hd, state)?;
		}

		let now = unix_now();
		let ino = Inode::new(kind, perm, self.uid, self.gid, now);
		self.write_inode(inr, &ino, InodeState::InUse)?;

		self.update_sb(|sb| {
			if next == NULL_INODE {
				sb.i_head = NULL_INODE;
				sb.i_tail = NULL_INODE;
			} else {
				sb.i_head = next;
			}
			sb.i_free -= 1;
		})?;

		log::debug!("alloc_inode() = {inr}");
		Ok(inr)
	}

	/// Release an unreferenced inode to the tail of the free list.
	///
	/// The inode transitions to the dirty state: its cluster references stay
	/// in place and are reclaimed by [`Sofs::clean_inode`] when the inode
	/// comes back around for reuse.
	pub fn free_inode(&mut self, inr: InodeNum) -> IoResult<()> {
		log::trace!("free_inode({inr});");
		self.assert_rw()?;

		if inr == ROOT_INODE {
			return Err(err!(EINVAL));
		}

		let mut ino = self.read_inode(inr, InodeState::InUse)?;
		if ino.ref_count != 0 {
			iobail!(
				InvalidData,
				"freeing inode {inr} with refCount {}",
				ino.ref_count
			);
		}

		let tail = self.superblock.i_tail;

		ino.mode |= IF_FREE;
		ino.overlay = InodeOverlay::Links {
			next: NULL_INODE,
			prev: tail,
		};
		self.write_inode(inr, &ino, InodeState::FreeDirty)?;

		if tail != NULL_INODE {
			let mut tl = self.load_inode(tail)?;
			let Some((_, tl_prev)) = tl.overlay.links() else {
				iobail!(InvalidData, "inconsistent free inode {tail} at list tail");
			};
			tl.overlay = InodeOverlay::Links {
				next: inr,
				prev: tl_prev,
			};
			let state = tl.state().ok_or(err!(EIO))?;
			self.write_inode(tail, &tl, state)?;
		}

		self.update_sb(|sb| {
			if sb.i_head == NULL_INODE {
				sb.i_head = inr;
			}
			sb.i_tail = inr;
			sb.i_free += 1;
		})
	}

	/// Scrub a dirty free inode: dissociate every cluster it still
	/// references, then reset all fields to the clean state.
	pub(super) fn clean_inode(&mut self, inr: InodeNum) -> IoResult<()> {
		log::trace!("clean_inode({inr});");
		self.assert_rw()?;

		self.file_clusters(inr, 0, MapOp::Clean)?;

		let mut ino = self.load_inode(inr)?;
		if ino.clu_count != 0 ||
			ino.i1 != NULL_CLUSTER ||
			ino.i2 != NULL_CLUSTER ||
			ino.direct.iter().any(|d| *d != NULL_CLUSTER)
		{
			iobail!(
				InvalidData,
				"inode {inr} still holds cluster references after cleaning"
			);
		}

		ino.mode = IF_FREE;
		ino.ref_count = 0;
		ino.owner = 0;
		ino.group = 0;
		ino.size = 0;

		self.write_inode(inr, &ino, InodeState::FreeClean)
	}
}
