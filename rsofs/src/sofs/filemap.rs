use super::*;

use crate::{err, iobail};

/// Operation applied to one slot of a file's cluster index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
	/// Resolve the slot; [`NULL_CLUSTER`] when unallocated. Never mutates
	/// the index.
	Get,
	/// Allocate the leaf (and any missing indirection cluster) at the slot.
	Alloc,
	/// Free the leaf but keep the slot populated; a later `Clean` reclaims
	/// the reference.
	Free,
	/// Free the leaf and dissociate it in one step.
	FreeClean,
	/// Dissociate only: the leaf was freed earlier and the inode itself is
	/// already on the free list.
	Clean,
}

/// Where a flat cluster index lands in the three-level map.
#[derive(Debug, Clone, Copy)]
enum MapSlot {
	Direct(usize),
	Single(usize),
	Double(usize, usize),
}

fn decode_clust_ind(clust_ind: u32) -> IoResult<MapSlot> {
	let ci = clust_ind as usize;
	if ci < N_DIRECT {
		Ok(MapSlot::Direct(ci))
	} else if ci < N_DIRECT + RPC {
		Ok(MapSlot::Single(ci - N_DIRECT))
	} else if ci < MAX_FILE_CLUSTERS {
		let x = ci - N_DIRECT - RPC;
		Ok(MapSlot::Double(x / RPC, x % RPC))
	} else {
		Err(err!(EINVAL))
	}
}

impl<R: Backend> Sofs<R> {
	/// Apply `op` to the cluster index slot `clust_ind` of inode `inr`.
	///
	/// Returns the logical number of the leaf the slot resolves to: the hit
	/// (or [`NULL_CLUSTER`]) for `Get`, the new leaf for `Alloc`, the
	/// affected leaf for the freeing and cleaning ops.
	pub fn file_cluster(&mut self, inr: InodeNum, clust_ind: u32, op: MapOp) -> IoResult<ClusterNum> {
		log::trace!("file_cluster({inr}, {clust_ind}, {op:?});");

		let expected = match op {
			MapOp::Clean => InodeState::FreeDirty,
			_ => InodeState::InUse,
		};
		let mut ino = self.read_inode(inr, expected)?;
		let slot = decode_clust_ind(clust_ind)?;

		match op {
			MapOp::Get => self.map_get(&ino, slot),
			MapOp::Alloc => self.map_alloc(inr, clust_ind, slot),
			MapOp::Free => {
				let leaf = self.map_get(&ino, slot)?;
				if leaf == NULL_CLUSTER {
					return Err(err!(ENOENT));
				}
				self.free_cluster(leaf)?;
				Ok(leaf)
			}
			MapOp::FreeClean => {
				let leaf = self.map_get(&ino, slot)?;
				if leaf == NULL_CLUSTER {
					return Err(err!(ENOENT));
				}
				self.free_cluster(leaf)?;
				self.scrub_cluster_stat(leaf)?;
				self.dissociate_leaf(&ino, clust_ind)?;
				self.map_unlink_slot(&mut ino, slot)?;
				self.write_inode(inr, &ino, expected)?;
				Ok(leaf)
			}
			MapOp::Clean => {
				let leaf = self.map_get(&ino, slot)?;
				if leaf == NULL_CLUSTER {
					return Err(err!(ENOENT));
				}
				let hdr = self.read_cluster_header(leaf)?;
				if hdr.stat != inr {
					iobail!(
						InvalidData,
						"cluster {leaf} owned by inode {}, expected {inr}",
						hdr.stat
					);
				}
				self.scrub_cluster_stat(leaf)?;
				self.map_unlink_slot(&mut ino, slot)?;
				self.write_inode(inr, &ino, expected)?;
				Ok(leaf)
			}
		}
	}

	/// `Get` against an already-loaded inode.
	pub(super) fn map_get_at(&mut self, ino: &Inode, clust_ind: u32) -> IoResult<ClusterNum> {
		let slot = decode_clust_ind(clust_ind)?;
		self.map_get(ino, slot)
	}

	fn map_get(&mut self, ino: &Inode, slot: MapSlot) -> IoResult<ClusterNum> {
		match slot {
			MapSlot::Direct(i) => Ok(ino.direct[i]),
			MapSlot::Single(s) => {
				if ino.i1 == NULL_CLUSTER {
					return Ok(NULL_CLUSTER);
				}
				self.read_ref_slot(ino.i1, s)
			}
			MapSlot::Double(s, t) => {
				if ino.i2 == NULL_CLUSTER {
					return Ok(NULL_CLUSTER);
				}
				let c = self.read_ref_slot(ino.i2, s)?;
				if c == NULL_CLUSTER {
					return Ok(NULL_CLUSTER);
				}
				self.read_ref_slot(c, t)
			}
		}
	}

	fn map_alloc(&mut self, inr: InodeNum, clust_ind: u32, slot: MapSlot) -> IoResult<ClusterNum> {
		let ino = self.read_inode(inr, InodeState::InUse)?;
		if self.map_get(&ino, slot)? != NULL_CLUSTER {
			return Err(err!(EEXIST));
		}

		let leaf = self.alloc_cluster(inr)?;
		if let Err(e) = self.map_alloc_commit(inr, slot, leaf) {
			// a failed parent allocation must not leak the leaf
			let _ = self
				.free_cluster(leaf)
				.and_then(|_| self.scrub_cluster_stat(leaf));
			return Err(e);
		}

		let ino = self.read_inode(inr, InodeState::InUse)?;
		self.attach_leaf(&ino, clust_ind, leaf)?;
		Ok(leaf)
	}

	/// Write `leaf` into its slot, growing the indirection tree as needed.
	fn map_alloc_commit(&mut self, inr: InodeNum, slot: MapSlot, leaf: ClusterNum) -> IoResult<()> {
		// Reusing a dirty cluster makes the allocator rewrite the inode it
		// still belonged to, which may be this very inode, possibly taking
		// an emptied indirection cluster with it. Work from a fresh copy
		// after every allocator call and retry when a parent vanished.
		'commit: loop {
			let mut ino = self.read_inode(inr, InodeState::InUse)?;
			match slot {
				MapSlot::Direct(i) => {
					ino.direct[i] = leaf;
					ino.clu_count += 1;
					self.write_inode(inr, &ino, InodeState::InUse)?;
				}
				MapSlot::Single(s) => {
					if ino.i1 == NULL_CLUSTER {
						let i1 = self.alloc_cluster(inr)?;
						self.init_ref_cluster(i1)?;
						let mut ino = self.read_inode(inr, InodeState::InUse)?;
						ino.i1 = i1;
						ino.clu_count += 1;
						self.write_inode(inr, &ino, InodeState::InUse)?;
						continue 'commit;
					}
					self.write_ref_slot(ino.i1, s, leaf)?;
					ino.clu_count += 1;
					self.write_inode(inr, &ino, InodeState::InUse)?;
				}
				MapSlot::Double(s, t) => {
					if ino.i2 == NULL_CLUSTER {
						let i2 = self.alloc_cluster(inr)?;
						self.init_ref_cluster(i2)?;
						let mut ino = self.read_inode(inr, InodeState::InUse)?;
						ino.i2 = i2;
						ino.clu_count += 1;
						self.write_inode(inr, &ino, InodeState::InUse)?;
						continue 'commit;
					}
					let c = self.read_ref_slot(ino.i2, s)?;
					if c == NULL_CLUSTER {
						let c = self.alloc_cluster(inr)?;
						self.init_ref_cluster(c)?;
						let mut ino = self.read_inode(inr, InodeState::InUse)?;
						if ino.i2 == NULL_CLUSTER {
							// the table went away while its child was being
							// allocated; put the child back and start over
							self.free_cluster(c)?;
							self.scrub_cluster_stat(c)?;
							continue 'commit;
						}
						self.write_ref_slot(ino.i2, s, c)?;
						ino.clu_count += 1;
						self.write_inode(inr, &ino, InodeState::InUse)?;
						continue 'commit;
					}
					self.write_ref_slot(c, t, leaf)?;
					ino.clu_count += 1;
					self.write_inode(inr, &ino, InodeState::InUse)?;
				}
			}
			break;
		}
		Ok(())
	}

	/// Wire a newly attached leaf to its logical neighbours, keeping the
	/// file's allocated clusters doubly linked in index order.
	fn attach_leaf(&mut self, ino: &Inode, clust_ind: u32, leaf: ClusterNum) -> IoResult<()> {
		let prev = if clust_ind > 0 {
			self.map_get_at(ino, clust_ind - 1)?
		} else {
			NULL_CLUSTER
		};
		let next = if (clust_ind as usize + 1) < MAX_FILE_CLUSTERS {
			self.map_get_at(ino, clust_ind + 1)?
		} else {
			NULL_CLUSTER
		};

		let mut hdr = self.read_cluster_header(leaf)?;
		hdr.prev = prev;
		hdr.next = next;
		self.write_cluster_header(leaf, &hdr)?;

		if prev != NULL_CLUSTER {
			let mut hp = self.read_cluster_header(prev)?;
			hp.next = leaf;
			self.write_cluster_header(prev, &hp)?;
		}
		if next != NULL_CLUSTER {
			let mut hn = self.read_cluster_header(next)?;
			hn.prev = leaf;
			self.write_cluster_header(next, &hn)?;
		}
		Ok(())
	}

	/// Close the neighbour chain over a leaf about to leave the index.
	fn dissociate_leaf(&mut self, ino: &Inode, clust_ind: u32) -> IoResult<()> {
		let prev = if clust_ind > 0 {
			self.map_get_at(ino, clust_ind - 1)?
		} else {
			NULL_CLUSTER
		};
		let next = if (clust_ind as usize + 1) < MAX_FILE_CLUSTERS {
			self.map_get_at(ino, clust_ind + 1)?
		} else {
			NULL_CLUSTER
		};

		if prev != NULL_CLUSTER {
			let mut hp = self.read_cluster_header(prev)?;
			hp.next = next;
			self.write_cluster_header(prev, &hp)?;
		}
		if next != NULL_CLUSTER {
			let mut hn = self.read_cluster_header(next)?;
			hn.prev = prev;
			self.write_cluster_header(next, &hn)?;
		}
		Ok(())
	}

	/// Null the slot and release indirection clusters whose reference arrays
	/// become empty. Adjusts `cluCount` for every removed attachment.
	fn map_unlink_slot(&mut self, ino: &mut Inode, slot: MapSlot) -> IoResult<()> {
		match slot {
			MapSlot::Direct(i) => {
				ino.direct[i] = NULL_CLUSTER;
				ino.clu_count -= 1;
			}
			MapSlot::Single(s) => {
				self.write_ref_slot(ino.i1, s, NULL_CLUSTER)?;
				ino.clu_count -= 1;

				if self.ref_cluster_is_empty(ino.i1)? {
					self.free_cluster(ino.i1)?;
					self.scrub_cluster_stat(ino.i1)?;
					ino.i1 = NULL_CLUSTER;
					ino.clu_count -= 1;
				}
			}
			MapSlot::Double(s, t) => {
				let c = self.read_ref_slot(ino.i2, s)?;
				if c == NULL_CLUSTER {
					iobail!(InvalidData, "single-indirect slot {s} empty during unlink");
				}
				self.write_ref_slot(c, t, NULL_CLUSTER)?;
				ino.clu_count -= 1;

				if self.ref_cluster_is_empty(c)? {
					self.free_cluster(c)?;
					self.scrub_cluster_stat(c)?;
					self.write_ref_slot(ino.i2, s, NULL_CLUSTER)?;
					ino.clu_count -= 1;

					if self.ref_cluster_is_empty(ino.i2)? {
						self.free_cluster(ino.i2)?;
						self.scrub_cluster_stat(ino.i2)?;
						ino.i2 = NULL_CLUSTER;
						ino.clu_count -= 1;
					}
				}
			}
		}
		Ok(())
	}

	fn ref_cluster_is_empty(&mut self, l: ClusterNum) -> IoResult<bool> {
		let mut refs = vec![NULL_CLUSTER; RPC];
		self.read_ref_cluster(l, &mut refs)?;
		Ok(refs.iter().all(|r| *r == NULL_CLUSTER))
	}

	/// Apply `op` to every attached index at or above `from_ind`, walking
	/// the double-indirect tree first, then the single-indirect table, then
	/// the direct references, so indirection clusters are released last.
	pub fn file_clusters(&mut self, inr: InodeNum, from_ind: u32, op: MapOp) -> IoResult<()> {
		log::trace!("file_clusters({inr}, {from_ind}, {op:?});");
		self.assert_rw()?;

		if !matches!(op, MapOp::Free | MapOp::FreeClean | MapOp::Clean) {
			return Err(err!(EINVAL));
		}
		if from_ind as usize >= MAX_FILE_CLUSTERS {
			return Err(err!(EINVAL));
		}

		let expected = match op {
			MapOp::Clean => InodeState::FreeDirty,
			_ => InodeState::InUse,
		};
		let mut ino = self.read_inode(inr, expected)?;

		if ino.i2 != NULL_CLUSTER {
			let mut refs2 = vec![NULL_CLUSTER; RPC];
			self.read_ref_cluster(ino.i2, &mut refs2)?;

			for s in (0..RPC).rev() {
				let base = (N_DIRECT + RPC + s * RPC) as u32;
				if base + RPC as u32 <= from_ind {
					break;
				}
				let c = refs2[s];
				if c == NULL_CLUSTER {
					continue;
				}

				let mut refs1 = vec![NULL_CLUSTER; RPC];
				self.read_ref_cluster(c, &mut refs1)?;
				let mut touched = false;

				for t in (0..RPC).rev() {
					let idx = base + t as u32;
					if idx < from_ind {
						break;
					}
					let leaf = refs1[t];
					if leaf == NULL_CLUSTER {
						continue;
					}
					self.reap_leaf(inr, &mut ino, leaf, op)?;
					if op != MapOp::Free {
						refs1[t] = NULL_CLUSTER;
						touched = true;
					}
				}

				if op != MapOp::Free {
					if refs1.iter().all(|r| *r == NULL_CLUSTER) {
						self.free_cluster(c)?;
						self.scrub_cluster_stat(c)?;
						refs2[s] = NULL_CLUSTER;
						ino.clu_count -= 1;
					} else if touched {
						self.write_ref_cluster(c, &refs1)?;
					}
				}
			}

			if op != MapOp::Free {
				if refs2.iter().all(|r| *r == NULL_CLUSTER) {
					self.free_cluster(ino.i2)?;
					self.scrub_cluster_stat(ino.i2)?;
					ino.i2 = NULL_CLUSTER;
					ino.clu_count -= 1;
				} else {
					self.write_ref_cluster(ino.i2, &refs2)?;
				}
			}
		}

		if ino.i1 != NULL_CLUSTER {
			let mut refs = vec![NULL_CLUSTER; RPC];
			self.read_ref_cluster(ino.i1, &mut refs)?;
			let mut touched = false;

			for s in (0..RPC).rev() {
				let idx = (N_DIRECT + s) as u32;
				if idx < from_ind {
					break;
				}
				let leaf = refs[s];
				if leaf == NULL_CLUSTER {
					continue;
				}
				self.reap_leaf(inr, &mut ino, leaf, op)?;
				if op != MapOp::Free {
					refs[s] = NULL_CLUSTER;
					touched = true;
				}
			}

			if op != MapOp::Free {
				if refs.iter().all(|r| *r == NULL_CLUSTER) {
					self.free_cluster(ino.i1)?;
					self.scrub_cluster_stat(ino.i1)?;
					ino.i1 = NULL_CLUSTER;
					ino.clu_count -= 1;
				} else if touched {
					self.write_ref_cluster(ino.i1, &refs)?;
				}
			}
		}

		for i in (0..N_DIRECT).rev() {
			if (i as u32) < from_ind {
				break;
			}
			let leaf = ino.direct[i];
			if leaf == NULL_CLUSTER {
				continue;
			}
			self.reap_leaf(inr, &mut ino, leaf, op)?;
			if op != MapOp::Free {
				ino.direct[i] = NULL_CLUSTER;
			}
		}

		// truncation boundary: the last surviving leaf ends the chain
		if op == MapOp::FreeClean && from_ind > 0 {
			let last = self.map_get_at(&ino, from_ind - 1)?;
			if last != NULL_CLUSTER {
				let mut hdr = self.read_cluster_header(last)?;
				hdr.next = NULL_CLUSTER;
				self.write_cluster_header(last, &hdr)?;
			}
		}

		if op != MapOp::Free {
			self.write_inode(inr, &ino, expected)?;
		}
		Ok(())
	}

	fn reap_leaf(
		&mut self,
		inr: InodeNum,
		ino: &mut Inode,
		leaf: ClusterNum,
		op: MapOp,
	) -> IoResult<()> {
		match op {
			MapOp::Free => self.free_cluster(leaf),
			MapOp::FreeClean => {
				self.free_cluster(leaf)?;
				self.scrub_cluster_stat(leaf)?;
				ino.clu_count -= 1;
				Ok(())
			}
			MapOp::Clean => {
				let hdr = self.read_cluster_header(leaf)?;
				if hdr.stat != inr {
					iobail!(
						InvalidData,
						"cluster {leaf} owned by inode {}, expected {inr}",
						hdr.stat
					);
				}
				self.scrub_cluster_stat(leaf)?;
				ino.clu_count -= 1;
				Ok(())
			}
			MapOp::Get | MapOp::Alloc => unreachable!("file_clusters rejects {op:?} before reaching reap_leaf"),
		}
	}

	/// Dissociate a dirty free cluster from the inode whose residue it still
	/// carries. Invoked by the cluster allocator before reuse.
	pub(super) fn clean_data_cluster(&mut self, owner: InodeNum, l: ClusterNum) -> IoResult<()> {
		log::trace!("clean_data_cluster({owner}, {l});");

		let mut ino = self.load_inode(owner)?;
		let state = match ino.state() {
			Some(s @ (InodeState::InUse | InodeState::FreeDirty)) => s,
			other => {
				iobail!(
					InvalidData,
					"cluster {l} names owner {owner} in state {other:?}"
				)
			}
		};

		if ino.i1 == l || ino.i2 == l {
			iobail!(InvalidData, "indirection cluster {l} found in the free pool");
		}

		let slot = self.map_find(&ino, l)?;
		self.scrub_cluster_stat(l)?;
		self.map_unlink_slot(&mut ino, slot)?;
		self.write_inode(owner, &ino, state)
	}

	/// Locate the slot of `l` in the owner's index.
	fn map_find(&mut self, ino: &Inode, l: ClusterNum) -> IoResult<MapSlot> {
		if let Some(i) = ino.direct.iter().position(|d| *d == l) {
			return Ok(MapSlot::Direct(i));
		}

		if ino.i1 != NULL_CLUSTER {
			let mut refs = vec![NULL_CLUSTER; RPC];
			self.read_ref_cluster(ino.i1, &mut refs)?;
			if let Some(s) = refs.iter().position(|r| *r == l) {
				return Ok(MapSlot::Single(s));
			}
		}

		if ino.i2 != NULL_CLUSTER {
			let mut refs2 = vec![NULL_CLUSTER; RPC];
			self.read_ref_cluster(ino.i2, &mut refs2)?;
			for (s, &c) in refs2.iter().enumerate() {
				if c == l {
					iobail!(InvalidData, "indirection cluster {l} found in the free pool");
				}
				if c == NULL_CLUSTER {
					continue;
				}
				let mut refs1 = vec![NULL_CLUSTER; RPC];
				self.read_ref_cluster(c, &mut refs1)?;
				if let Some(t) = refs1.iter().position(|r| *r == l) {
					return Ok(MapSlot::Double(s, t));
				}
			}
		}

		iobail!(InvalidData, "cluster {l} is not referenced by its owner")
	}
}
