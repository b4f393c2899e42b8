#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;
pub mod pb;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FrameReader, FramingError, decode_frame, encode_frame, encode_frame_default,
	encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer, write_message,
};

/// Protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// ALPN identifier negotiated on the QUIC handshake.
pub const ALPN: &[u8] = b"plaza-v1";

/// Build an envelope with the current protocol version.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}
