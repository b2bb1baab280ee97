//! Length-delimited MsgPack framing for the RPC transport.
//!
//! Every frame is a 4-byte big-endian length followed by a MsgPack-encoded
//! [`Envelope`].  The envelope addresses one sub-channel of the connection;
//! channel 0 is the main channel carrying [`crate::rpc::Request`]s, all
//! other IDs are allocated by the client and carried inside request
//! payloads.  Setting `end` closes the addressed channel.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::rpc::ChannelId;

/// The channel requests travel on.
pub const MAIN_CHANNEL: ChannelId = 0;

/// Upper bound on one frame's MsgPack body.
pub const MAX_FRAME: usize = 1 << 20;

/// One multiplexed frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Ch")]
    pub ch: ChannelId,
    /// Last frame on this channel; the channel is closed after it.
    #[serde(rename = "End", default)]
    pub end: bool,
    /// MsgPack-encoded payload; may be empty for a pure close.
    #[serde(rename = "Body", with = "serde_bytes", default)]
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new<B: Into<Vec<u8>>>(ch: ChannelId, body: B) -> Self {
        Envelope { ch, end: false, body: body.into() }
    }

    /// A frame that closes `ch` without carrying data.
    pub fn close(ch: ChannelId) -> Self {
        Envelope { ch, end: true, body: Vec::new() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    TooLarge(usize),
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a request/reply/stream item for an envelope body.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode an envelope body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameError> {
    Ok(rmp_serde::from_slice(body)?)
}

/// tokio codec turning a byte stream into [`Envelope`]s and back.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    _priv: (),
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME {
            return Err(FrameError::TooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(len);
        Ok(Some(rmp_serde::from_slice(&frame)?))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = rmp_serde::to_vec_named(&item)?;
        if body.len() > MAX_FRAME {
            return Err(FrameError::TooLarge(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
