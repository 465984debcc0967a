use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frames::{Frame, Message};

/// Transport kind byte: UTF-8 JSON frame.
const KIND_TEXT: u8 = 0;
/// Transport kind byte: binary chunk frame.
const KIND_BINARY: u8 = 1;

const LEN_WIDTH: usize = 4;
const KIND_WIDTH: usize = 1;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the message size limit")]
    Oversize(usize),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// One message on the channel: a frame, plus the raw chunk bytes when the
/// frame is a [`Message::Chunk`] header.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub frame: Frame,
    pub data: Option<Bytes>,
}

impl WireMessage {
    #[must_use]
    pub fn text(frame: Frame) -> Self {
        Self { frame, data: None }
    }

    #[must_use]
    pub fn chunk(frame: Frame, data: Bytes) -> Self {
        Self {
            frame,
            data: Some(data),
        }
    }
}

/// Length-delimited framing: `[u32 len][u8 kind][body]`. Text bodies are
/// the frame JSON; binary bodies are `[u16 header len][header json][data]`.
#[derive(Debug)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub const fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Encoder<WireMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = serde_json::to_vec(&item.frame)?;

        let body_len = match &item.data {
            Some(data) => {
                if header.len() > usize::from(u16::MAX) {
                    return Err(CodecError::Malformed("chunk header exceeds u16 length"));
                }
                if !matches!(item.frame.message, Message::Chunk { .. }) {
                    return Err(CodecError::Malformed("binary payload on a non-chunk frame"));
                }
                2 + header.len() + data.len()
            }
            None => header.len(),
        };

        if body_len > self.max_message_size {
            return Err(CodecError::Oversize(body_len));
        }

        dst.reserve(LEN_WIDTH + KIND_WIDTH + body_len);
        dst.put_u32(body_len as u32);

        match item.data {
            Some(data) => {
                dst.put_u8(KIND_BINARY);
                dst.put_u16(header.len() as u16);
                dst.put_slice(&header);
                dst.put_slice(&data);
            }
            None => {
                dst.put_u8(KIND_TEXT);
                dst.put_slice(&header);
            }
        }

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = WireMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_WIDTH + KIND_WIDTH {
            return Ok(None);
        }

        let mut len_bytes = [0; LEN_WIDTH];
        len_bytes.copy_from_slice(&src[..LEN_WIDTH]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        if body_len > self.max_message_size {
            return Err(CodecError::Oversize(body_len));
        }

        if src.len() < LEN_WIDTH + KIND_WIDTH + body_len {
            src.reserve(LEN_WIDTH + KIND_WIDTH + body_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_WIDTH);
        let kind = src.get_u8();
        let mut body = src.split_to(body_len);

        match kind {
            KIND_TEXT => {
                let frame: Frame = serde_json::from_slice(&body)?;
                Ok(Some(WireMessage::text(frame)))
            }
            KIND_BINARY => {
                if body.len() < 2 {
                    return Err(CodecError::Malformed("binary frame shorter than its header length"));
                }
                let header_len = usize::from(body.get_u16());
                if body.len() < header_len {
                    return Err(CodecError::Malformed("chunk header truncated"));
                }
                let header = body.split_to(header_len);
                let frame: Frame = serde_json::from_slice(&header)?;
                if !matches!(frame.message, Message::Chunk { .. }) {
                    return Err(CodecError::Malformed("binary payload on a non-chunk frame"));
                }
                Ok(Some(WireMessage::chunk(frame, body.freeze())))
            }
            _ => Err(CodecError::Malformed("unknown transport kind byte")),
        }
    }
}

#[cfg(test)]
#[path = "tests/codec.rs"]
mod tests;
