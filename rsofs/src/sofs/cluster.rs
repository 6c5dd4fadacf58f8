use super::*;

use crate::err;

impl<R: Backend> Sofs<R> {
	pub(super) fn check_cluster_range(&self, l: ClusterNum) -> IoResult<()> {
		if l >= self.superblock.dzone_total {
			log::error!("cluster {l} out of range (dzone_total {})", self.superblock.dzone_total);
			return Err(err!(EINVAL));
		}
		Ok(())
	}

	pub(super) fn read_cluster_header(&mut self, l: ClusterNum) -> IoResult<ClusterHeader> {
		self.check_cluster_range(l)?;
		let off = self.superblock.cluster_offset(l);
		self.file.decode_at(off)
	}

	pub(super) fn write_cluster_header(
		&mut self,
		l: ClusterNum,
		hdr: &ClusterHeader,
	) -> IoResult<()> {
		self.check_cluster_range(l)?;
		let off = self.superblock.cluster_offset(l);
		self.file.encode_at(off, hdr)
	}

	/// Clear the owner residue of a freed cluster, leaving any free-list
	/// links in place.
	pub(super) fn scrub_cluster_stat(&mut self, l: ClusterNum) -> IoResult<()> {
		let mut hdr = self.read_cluster_header(l)?;
		hdr.stat = NULL_INODE;
		self.write_cluster_header(l, &hdr)
	}

	/// Read the reference array of an indirection cluster.
	pub(super) fn read_ref_cluster(
		&mut self,
		l: ClusterNum,
		refs: &mut [ClusterNum],
	) -> IoResult<()> {
		log::trace!("read_ref_cluster({l});");
		assert_eq!(refs.len(), RPC);
		self.check_cluster_range(l)?;

		self.file.seek(self.superblock.payload_offset(l))?;
		for r in refs.iter_mut() {
			*r = self.file.decode()?;
		}
		Ok(())
	}

	pub(super) fn write_ref_cluster(
		&mut self,
		l: ClusterNum,
		refs: &[ClusterNum],
	) -> IoResult<()> {
		log::trace!("write_ref_cluster({l});");
		assert_eq!(refs.len(), RPC);
		self.check_cluster_range(l)?;

		self.file.seek(self.superblock.payload_offset(l))?;
		for r in refs.iter() {
			self.file.encode(r)?;
		}
		Ok(())
	}

	/// Reset every reference of a freshly allocated indirection cluster.
	pub(super) fn init_ref_cluster(&mut self, l: ClusterNum) -> IoResult<()> {
		self.write_ref_cluster(l, &[NULL_CLUSTER; RPC])
	}

	pub(super) fn read_ref_slot(&mut self, l: ClusterNum, idx: usize) -> IoResult<ClusterNum> {
		assert!(idx < RPC);
		self.check_cluster_range(l)?;
		let off = self.superblock.payload_offset(l) + idx as u64 * 4;
		self.file.decode_at(off)
	}

	pub(super) fn write_ref_slot(
		&mut self,
		l: ClusterNum,
		idx: usize,
		val: ClusterNum,
	) -> IoResult<()> {
		assert!(idx < RPC);
		self.check_cluster_range(l)?;
		let off = self.superblock.payload_offset(l) + idx as u64 * 4;
		self.file.encode_at(off, &val)
	}

	/// Read `buf.len()` payload bytes of cluster `l` starting at `off`.
	pub(super) fn read_payload(
		&mut self,
		l: ClusterNum,
		off: usize,
		buf: &mut [u8],
	) -> IoResult<()> {
		assert!(off + buf.len() <= BSLPC);
		self.check_cluster_range(l)?;
		self.file
			.read_at(self.superblock.payload_offset(l) + off as u64, buf)
	}

	pub(super) fn write_payload(
		&mut self,
		l: ClusterNum,
		off: usize,
		buf: &[u8],
	) -> IoResult<()> {
		assert!(off + buf.len() <= BSLPC);
		self.check_cluster_range(l)?;
		self.file
			.write_at(self.superblock.payload_offset(l) + off as u64, buf)
	}

	pub(super) fn zero_payload(&mut self, l: ClusterNum) -> IoResult<()> {
		self.check_cluster_range(l)?;
		self.file
			.fill_at(self.superblock.payload_offset(l), 0u8, BSLPC)
	}
}
