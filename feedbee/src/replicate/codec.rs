//! Wire format: a u32 BE length followed by a postcard encoded [`Message`].

use std::ops::Range;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use feedbee_base::PublicKey;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tokio_util::codec::{Decoder, Encoder};

use crate::feed::{Proof, SignedHead};

pub(crate) const PROTOCOL: &str = "feedbee/replicate/v1";

/// Frames larger than this are rejected.
pub(crate) const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum CodecError {
    #[snafu(transparent)]
    Io { source: std::io::Error },
    #[snafu(display("message of {len} bytes exceeds the maximum"))]
    TooLarge { len: usize },
    #[snafu(display("malformed message"))]
    Decode { source: postcard::Error },
    #[snafu(display("failed to encode message"))]
    Encode { source: postcard::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Handshake {
    pub protocol: String,
    pub key: PublicKey,
    pub live: bool,
    pub head: Option<SignedHead>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Message {
    Handshake(Handshake),
    /// A newer head of the sender.
    Head(SignedHead),
    /// All entries the sender has, replacing earlier announcements.
    Have { ranges: Vec<Range<u64>> },
    Request { index: u64 },
    Data {
        index: u64,
        value: Bytes,
        proof: Proof,
        head: SignedHead,
    },
    /// The sender can not serve a requested entry.
    NoData { index: u64 },
    /// The sender has nothing left to request.
    ///
    /// `haves` counts the [`Message::Have`]s the sender received, so a receiver that announced
    /// more since can tell the declaration is stale.
    Synced { haves: u64 },
}

#[derive(Debug, Default)]
pub(crate) struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        ensure!(len <= MAX_MESSAGE_SIZE, TooLargeSnafu { len });
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        let message = postcard::from_bytes(&src[4..4 + len]).context(DecodeSnafu)?;
        src.advance(4 + len);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = postcard::to_stdvec(&item).context(EncodeSnafu)?;
        ensure!(
            encoded.len() <= MAX_MESSAGE_SIZE,
            TooLargeSnafu { len: encoded.len() }
        );
        dst.reserve(4 + encoded.len());
        dst.put_u32(encoded.len() as u32);
        dst.put_slice(&encoded);
        Ok(())
    }
}
