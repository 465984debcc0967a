//! Wire protocol: frames, codec and the framed channel.
//!
//! Text frames are UTF-8 JSON; the chunk frame is binary, a two-byte
//! big-endian header length followed by the JSON header and the raw
//! (possibly deflated) chunk bytes. The transport beneath is any ordered
//! reliable byte stream; [`Channel`] wraps it with length-delimited
//! message framing.

pub mod codec;
pub mod compress;
pub mod frames;

use core::pin::Pin;
use core::task::{Context, Poll};

use futures_util::{Sink as FuturesSink, SinkExt, Stream as FuturesStream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::codec::Framed;

pub use crate::codec::{CodecError, FrameCodec, WireMessage};
pub use crate::frames::{AckStatus, Frame, Message, PairHello, PROTOCOL_VERSION};

pub const MAX_MESSAGE_SIZE: usize = 8 * 1_024 * 1_024;

/// A framed, ordered, reliable message channel to one peer.
#[derive(Debug)]
pub struct Channel<T> {
    inner: Framed<T, FrameCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Channel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Framed::new(transport, FrameCodec::new(MAX_MESSAGE_SIZE)),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> FuturesStream for Channel<T> {
    type Item = Result<WireMessage, CodecError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> FuturesSink<WireMessage> for Channel<T> {
    type Error = CodecError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready_unpin(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: WireMessage) -> Result<(), Self::Error> {
        self.inner.start_send_unpin(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_flush_unpin(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_close_unpin(cx)
    }
}

/// An in-process channel pair, for tests and same-host sessions.
#[must_use]
pub fn duplex_pair() -> (Channel<DuplexStream>, Channel<DuplexStream>) {
    let (a, b) = tokio::io::duplex(MAX_MESSAGE_SIZE);
    (Channel::new(a), Channel::new(b))
}
