use super::*;

use crate::{err, iobail};

impl<R: Backend> Sofs<R> {
	/// Allocate a free data cluster and associate it to inode `inr`.
	///
	/// Clusters are handed out from the retrieval cache, which is replenished
	/// from the head of the free list on demand. A cluster still carrying the
	/// owner residue of a dead file is cleaned here, before reuse.
	pub fn alloc_cluster(&mut self, inr: InodeNum) -> IoResult<ClusterNum> {
		log::trace!("alloc_cluster({inr});");
		self.assert_rw()?;

		if inr >= self.superblock.i_total {
			return Err(err!(EINVAL));
		}
		// the owner must exist; any in-use inode will do
		self.read_inode(inr, InodeState::InUse)?;

		if self.superblock.dzone_free == 0 {
			return Err(err!(ENOSPC));
		}

		if self.superblock.retrieval.idx == DZONE_CACHE_SIZE as u32 {
			self.replenish()?;
		}

		let slot = self.superblock.retrieval.idx as usize;
		let l = self.superblock.retrieval.cache[slot];
		if l == NULL_CLUSTER || l >= self.superblock.dzone_total {
			iobail!(InvalidData, "retrieval cache slot {slot} holds {l:#x}");
		}
		self.superblock.retrieval.cache[slot] = NULL_CLUSTER;
		self.superblock.retrieval.idx += 1;
		self.superblock.dzone_free -= 1;

		// dirty cluster: dissociate it from its previous owner first
		let hdr = self.read_cluster_header(l)?;
		if hdr.stat != NULL_INODE {
			log::debug!("alloc_cluster(): cluster {l} is dirty, owner {}", hdr.stat);
			self.clean_data_cluster(hdr.stat, l)?;
		}

		self.write_cluster_header(l, &ClusterHeader::detached(inr))?;
		self.store_sb()?;

		log::debug!("alloc_cluster({inr}) = {l}");
		Ok(l)
	}

	/// Return an allocated cluster to the free pool through the insertion
	/// cache. The owner residue is kept in `stat`, marking the cluster dirty
	/// until it is cleaned on reallocation.
	pub fn free_cluster(&mut self, l: ClusterNum) -> IoResult<()> {
		log::trace!("free_cluster({l});");
		self.assert_rw()?;

		if l == ROOT_CLUSTER {
			return Err(err!(EINVAL));
		}
		self.check_cluster_range(l)?;

		let hdr = self.read_cluster_header(l)?;
		if hdr.stat == NULL_INODE {
			iobail!(InvalidData, "freeing cluster {l} which is already free");
		}
		if hdr.stat >= self.superblock.i_total {
			iobail!(InvalidData, "cluster {l} has inconsistent owner {}", hdr.stat);
		}

		self.write_cluster_header(l, &ClusterHeader::detached(hdr.stat))?;

		if self.superblock.insertion.idx == DZONE_CACHE_SIZE as u32 {
			self.deplete()?;
		}

		let slot = self.superblock.insertion.idx as usize;
		self.superblock.insertion.cache[slot] = l;
		self.superblock.insertion.idx += 1;
		self.superblock.dzone_free += 1;
		self.store_sb()
	}

	/// Refill the retrieval cache by detaching clusters from the head of the
	/// free list. Falls back to depleting the insertion cache when the list
	/// runs short of the target.
	fn replenish(&mut self) -> IoResult<()> {
		let target = (self.superblock.dzone_free as usize).min(DZONE_CACHE_SIZE);
		log::debug!("replenish(): target={target}");
		if target == 0 {
			iobail!(InvalidData, "replenishing with no free clusters");
		}

		for slot in (DZONE_CACHE_SIZE - target)..DZONE_CACHE_SIZE {
			let mut n = self.superblock.d_head;
			if n == NULL_CLUSTER {
				// pending frees hold the remainder
				if self.superblock.insertion.idx == 0 {
					iobail!(
						InvalidData,
						"free cluster accounting out of sync: dZoneFree={} but no clusters left",
						self.superblock.dzone_free
					);
				}
				self.deplete()?;
				n = self.superblock.d_head;
			}

			let hdr = self.read_cluster_header(n)?;
			self.write_cluster_header(n, &ClusterHeader::detached(hdr.stat))?;
			self.superblock.retrieval.cache[slot] = n;
			self.superblock.d_head = hdr.next;
			if hdr.next == NULL_CLUSTER {
				self.superblock.d_tail = NULL_CLUSTER;
			}
		}

		let head = self.superblock.d_head;
		if head != NULL_CLUSTER {
			let mut hdr = self.read_cluster_header(head)?;
			hdr.prev = NULL_CLUSTER;
			self.write_cluster_header(head, &hdr)?;
		}

		self.superblock.retrieval.idx = (DZONE_CACHE_SIZE - target) as u32;
		self.store_sb()
	}

	/// Append the whole insertion cache to the tail of the free list, wiring
	/// the clusters into one chain, and flush the superblock.
	fn deplete(&mut self) -> IoResult<()> {
		let cnt = self.superblock.insertion.idx as usize;
		log::debug!("deplete(): {cnt} pending");
		if cnt == 0 {
			return Ok(());
		}

		let pend: Vec<ClusterNum> = self.superblock.insertion.cache[..cnt].to_vec();
		let tail = self.superblock.d_tail;

		if tail != NULL_CLUSTER {
			let mut hdr = self.read_cluster_header(tail)?;
			hdr.next = pend[0];
			self.write_cluster_header(tail, &hdr)?;
		}

		for (k, &l) in pend.iter().enumerate() {
			let mut hdr = self.read_cluster_header(l)?;
			hdr.prev = if k == 0 { tail } else { pend[k - 1] };
			hdr.next = if k == cnt - 1 {
				NULL_CLUSTER
			} else {
				pend[k + 1]
			};
			self.write_cluster_header(l, &hdr)?;
		}

		if self.superblock.d_head == NULL_CLUSTER {
			self.superblock.d_head = pend[0];
		}
		self.superblock.d_tail = pend[cnt - 1];
		self.superblock.insertion.cache = [NULL_CLUSTER; DZONE_CACHE_SIZE];
		self.superblock.insertion.idx = 0;
		self.store_sb()
	}
}
