use std::io::{Error, ErrorKind, Read, Result, Seek, SeekFrom, Write};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// All SOFS on-disk records are little-endian with fixed-width integers.
const fn config() -> Configuration<LittleEndian, Fixint, NoLimit> {
	bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian()
}

/// Typed views over a byte stream, usually a [`crate::BlockIo`].
pub struct Codec<T> {
	inner: T,
}

impl<T> Codec<T> {
	pub fn new(inner: T) -> Self {
		Self {
			inner,
		}
	}

	pub fn inner(&self) -> &T {
		&self.inner
	}

	pub fn inner_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn into_inner(self) -> T {
		self.inner
	}
}

impl<T: Read> Codec<T> {
	pub fn decode<X: Decode>(&mut self) -> Result<X> {
		bincode::decode_from_std_read(&mut self.inner, config())
			.map_err(|e| Error::new(ErrorKind::InvalidData, format!("decode failed: {e}")))
	}

	pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
		self.inner.read_exact(buf)
	}
}

impl<T: Write> Codec<T> {
	pub fn encode<X: Encode>(&mut self, v: &X) -> Result<()> {
		bincode::encode_into_std_write(v, &mut self.inner, config())
			.map_err(|e| Error::new(ErrorKind::InvalidData, format!("encode failed: {e}")))?;
		Ok(())
	}

	pub fn write(&mut self, buf: &[u8]) -> Result<()> {
		self.inner.write_all(buf)
	}

	/// Write `count` copies of `byte`.
	pub fn fill(&mut self, byte: u8, count: usize) -> Result<()> {
		let chunk = [byte; 64];
		let mut left = count;
		while left > 0 {
			let n = left.min(chunk.len());
			self.inner.write_all(&chunk[..n])?;
			left -= n;
		}
		Ok(())
	}
}

impl<T: Seek> Codec<T> {
	pub fn seek(&mut self, pos: u64) -> Result<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}

	pub fn pos(&mut self) -> Result<u64> {
		self.inner.stream_position()
	}
}

impl<T: Read + Seek> Codec<T> {
	pub fn decode_at<X: Decode>(&mut self, pos: u64) -> Result<X> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
		self.seek(pos)?;
		self.read(buf)
	}
}

impl<T: Write + Seek> Codec<T> {
	pub fn encode_at<X: Encode>(&mut self, pos: u64, v: &X) -> Result<()> {
		self.seek(pos)?;
		self.encode(v)
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
		self.seek(pos)?;
		self.write(buf)
	}

	pub fn fill_at(&mut self, pos: u64, byte: u8, count: usize) -> Result<()> {
		self.seek(pos)?;
		self.fill(byte, count)
	}
}
