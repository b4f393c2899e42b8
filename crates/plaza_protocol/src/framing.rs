#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024; // 256 KiB

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("stream ended inside a frame: buffered={buffered}")]
	UnexpectedEof {
		buffered: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(frame_len_from_payload_len(payload_len));
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	buf.reserve(frame_len_from_payload_len(payload_len));
	buf.put_u32(payload_len as u32);
	msg.encode(buf)?;
	Ok(())
}

/// Compute total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	4 + payload_len
}

/// Decode a single frame from the start of `src`.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[4..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = M::decode(&frame[4..])?;
	Ok(Some(msg))
}

/// Buffered frame reader over any async byte stream.
///
/// `read_message` is cancel-safe: bytes already read stay buffered when the
/// future is dropped, so it can sit inside a `tokio::select!` loop.
pub struct FrameReader<R> {
	inner: R,
	buf: BytesMut,
	max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
	pub fn new(inner: R, max_frame_size: usize) -> Self {
		Self {
			inner,
			buf: BytesMut::with_capacity(2 * READ_CHUNK),
			max_frame_size,
		}
	}

	/// Read the next message. `Ok(None)` means the peer finished cleanly on a frame boundary.
	pub async fn read_message<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		loop {
			if let Some(msg) = try_decode_frame_from_buffer::<M>(&mut self.buf, self.max_frame_size)? {
				return Ok(Some(msg));
			}

			self.buf.reserve(READ_CHUNK);
			let n = self.inner.read_buf(&mut self.buf).await?;
			if n == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(FramingError::UnexpectedEof {
					buffered: self.buf.len(),
				});
			}
		}
	}

	pub fn max_frame_size(&self) -> usize {
		self.max_frame_size
	}

	pub fn into_inner(self) -> R {
		self.inner
	}
}

/// Encode `msg`, write it and flush. Returns the number of bytes written.
pub async fn write_message<W, M>(writer: &mut W, msg: &M, max_frame_size: usize) -> Result<usize, FramingError>
where
	W: AsyncWrite + Unpin,
	M: Message,
{
	let frame = encode_frame(msg, max_frame_size)?;
	writer.write_all(&frame).await?;
	writer.flush().await?;
	Ok(frame.len())
}
