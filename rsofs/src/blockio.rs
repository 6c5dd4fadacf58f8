use std::{
	fs::File,
	io::{self, BufRead, Read, Result as IoResult, Seek, SeekFrom, Write},
	path::Path,
};

use crate::data::BLOCK_SIZE;

/// Anything that can back a SOFS volume: a regular file, a block device, or
/// an in-memory cursor in tests.
pub trait Backend: Read + Write + Seek {}

impl<T: Read + Write + Seek> Backend for T {}

/// Block-level abstraction over the backing container.
///
/// `BlockIo` maps random-access byte reads and writes onto whole-block
/// transfers of [`BLOCK_SIZE`] bytes. A single write-back buffer holds the
/// block under the cursor; a completed flush is durable before any later
/// refill of the same block can observe stale bytes. With the `bcache`
/// feature a bounded LRU of recently touched blocks sits below the buffer.
pub struct BlockIo<T: Backend> {
	inner: T,
	block: Box<[u8; BLOCK_SIZE]>,
	idx:   usize,
	dirty: bool,
	rw:    bool,
	#[cfg(feature = "bcache")]
	cache: lru::LruCache<u64, [u8; BLOCK_SIZE]>,
}

impl BlockIo<File> {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let file = File::options().read(true).write(rw).open(path)?;
		Ok(Self::new(file, rw))
	}
}

impl<T: Backend> BlockIo<T> {
	pub fn new(inner: T, rw: bool) -> Self {
		Self {
			inner,
			block: Box::new([0u8; BLOCK_SIZE]),
			// an exhausted buffer forces a refill on first use
			idx: BLOCK_SIZE,
			dirty: false,
			rw,
			#[cfg(feature = "bcache")]
			cache: crate::new_lru(crate::BCACHE_SIZE),
		}
	}

	pub fn write_enabled(&self) -> bool {
		self.rw
	}

	fn buffered(&self) -> usize {
		BLOCK_SIZE - self.idx
	}

	/// Load the block at the current device position into the buffer.
	fn refill(&mut self) -> IoResult<()> {
		assert!(!self.dirty, "refill would drop a dirty block");

		#[cfg(feature = "bcache")]
		{
			let pos = self.inner.stream_position()?;
			if let Some(hit) = self.cache.get(&pos) {
				self.block.copy_from_slice(hit);
				self.inner.seek(SeekFrom::Current(BLOCK_SIZE as i64))?;
				self.idx = 0;
				return Ok(());
			}
		}

		self.block.fill(0u8);
		let mut num = 0;
		while num < BLOCK_SIZE {
			match self.inner.read(&mut self.block[num..])? {
				0 => break,
				n => num += n,
			}
		}
		if num < BLOCK_SIZE {
			log::error!("BlockIo::refill(): short read of {num} bytes, eof?");
		}

		#[cfg(feature = "bcache")]
		{
			let pos = self.inner.stream_position()? - BLOCK_SIZE as u64;
			self.cache.push(pos, *self.block);
		}

		self.idx = 0;
		Ok(())
	}

	fn refill_if_empty(&mut self) -> IoResult<()> {
		if self.buffered() == 0 {
			self.refill()?;
		}
		Ok(())
	}
}

impl<T: Backend> Read for BlockIo<T> {
	fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
		self.refill_if_empty()?;
		let num = buf.len().min(self.buffered());
		buf[..num].copy_from_slice(&self.block[self.idx..(self.idx + num)]);
		self.idx += num;
		Ok(num)
	}
}

impl<T: Backend> Write for BlockIo<T> {
	fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
		if !self.rw {
			panic!("BUG: BlockIo::write() on a read-only medium");
		}
		self.refill_if_empty()?;
		let num = buf.len().min(self.buffered());
		self.block[self.idx..(self.idx + num)].copy_from_slice(&buf[..num]);
		self.idx += num;
		self.dirty = true;
		self.flush()?;
		Ok(num)
	}

	fn flush(&mut self) -> IoResult<()> {
		if !self.dirty {
			return Ok(());
		}

		let pos = self.inner.seek(SeekFrom::Current(-(BLOCK_SIZE as i64)))?;

		#[cfg(feature = "bcache")]
		self.cache.push(pos, *self.block);
		#[cfg(not(feature = "bcache"))]
		let _ = pos;

		let mut num = 0;
		while num < BLOCK_SIZE {
			match self.inner.write(&self.block[num..])? {
				0 => break,
				n => num += n,
			}
		}
		if num < BLOCK_SIZE {
			log::error!("BlockIo::flush(): short write of {num} bytes");
		}
		self.dirty = false;
		Ok(())
	}
}

impl<T: Backend> BufRead for BlockIo<T> {
	fn fill_buf(&mut self) -> IoResult<&[u8]> {
		self.refill_if_empty()?;
		Ok(&self.block[self.idx..])
	}

	fn consume(&mut self, amt: usize) {
		assert!(amt <= self.buffered());
		self.idx += amt;
	}
}

impl<T: Backend> Seek for BlockIo<T> {
	fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
		let bs = BLOCK_SIZE as u64;
		match pos {
			SeekFrom::Start(pos) => {
				self.flush()?;
				let real = self.inner.seek(SeekFrom::Start(pos / bs * bs))?;
				let rem = pos - real;
				assert!(rem < bs);

				self.refill()?;
				self.idx = rem as usize;

				Ok(real + rem)
			}
			SeekFrom::Current(offset) => {
				let real = self.inner.stream_position()?;
				let cur = real - bs + self.idx as u64;
				let newidx = offset + self.idx as i64;
				if (0..BLOCK_SIZE as i64).contains(&newidx) {
					// still inside the buffered block
					self.idx = newidx as usize;
					Ok(real - bs + newidx as u64)
				} else if cur as i64 + offset < 0 {
					Err(io::Error::from_raw_os_error(libc::EINVAL))
				} else {
					self.seek(SeekFrom::Start((cur as i64 + offset) as u64))
				}
			}
			SeekFrom::End(offset) => {
				self.flush()?;
				let end = self.inner.seek(SeekFrom::End(0))?;
				let target = end as i64 + offset;
				if target < 0 {
					return Err(io::Error::from_raw_os_error(libc::EINVAL));
				}
				self.seek(SeekFrom::Start(target as u64))
			}
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	const FSIZE: u64 = 64 * BLOCK_SIZE as u64;

	fn harness(rw: bool) -> BlockIo<File> {
		let f = tempfile::NamedTempFile::new().unwrap();
		f.as_file().set_len(FSIZE).unwrap();
		BlockIo::open(f.path(), rw).unwrap()
	}

	#[test]
	fn write_then_read_back() {
		let mut io = harness(true);
		let pos = BLOCK_SIZE as u64 * 3 + 100;
		io.seek(SeekFrom::Start(pos)).unwrap();
		io.write_all(b"sofs").unwrap();

		let mut buf = [0u8; 4];
		io.seek(SeekFrom::Start(pos)).unwrap();
		io.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"sofs");
	}

	#[test]
	fn unaligned_write_preserves_neighbours() {
		let mut io = harness(true);
		io.seek(SeekFrom::Start(0)).unwrap();
		io.write_all(&[0xAA; BLOCK_SIZE]).unwrap();

		// overwrite four bytes in the middle of the block
		io.seek(SeekFrom::Start(10)).unwrap();
		io.write_all(&[0x11; 4]).unwrap();

		let mut buf = [0u8; BLOCK_SIZE];
		io.seek(SeekFrom::Start(0)).unwrap();
		io.read_exact(&mut buf).unwrap();
		assert_eq!(buf[9], 0xAA);
		assert_eq!(&buf[10..14], &[0x11; 4]);
		assert_eq!(buf[14], 0xAA);
	}

	#[test]
	fn seek_current_stays_in_block() {
		let mut io = harness(false);
		let start = BLOCK_SIZE as u64 + 32;
		io.seek(SeekFrom::Start(start)).unwrap();
		let pos = io.seek(SeekFrom::Current(8)).unwrap();
		assert_eq!(pos, start + 8);
		let pos = io.seek(SeekFrom::Current(-16)).unwrap();
		assert_eq!(pos, start - 8);
	}

	#[test]
	fn seek_current_across_blocks() {
		let mut io = harness(false);
		io.seek(SeekFrom::Start(10)).unwrap();
		let pos = io
			.seek(SeekFrom::Current(3 * BLOCK_SIZE as i64))
			.unwrap();
		assert_eq!(pos, 10 + 3 * BLOCK_SIZE as u64);
	}

	#[test]
	fn seek_before_start_is_einval() {
		let mut io = harness(false);
		io.seek(SeekFrom::Start(4)).unwrap();
		let e = io.seek(SeekFrom::Current(-100)).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
	}

	#[test]
	fn seek_end() {
		let mut io = harness(false);
		let pos = io.seek(SeekFrom::End(-8)).unwrap();
		assert_eq!(pos, FSIZE - 8);
	}
}
