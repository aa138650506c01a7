// Jackson Coxson

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::UsbmuxError;

/// Reads exact byte counts from a stream that may deliver data in arbitrary chunks
///
/// Bytes that arrive beyond what a read asked for stay buffered and are handed
/// out by the next read, so frame boundaries never depend on how the transport
/// happened to split the data.
#[derive(Debug)]
pub struct ExactReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> ExactReader<R> {
    /// Wraps a stream with an empty read buffer
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Reads exactly `len` bytes
    ///
    /// # Returns
    /// `None` if the stream ended cleanly with nothing buffered
    ///
    /// # Errors
    /// * `NotEnoughBytes` if the stream ended partway through the requested bytes.
    ///   The partial bytes remain buffered.
    /// * `Socket` if the underlying stream failed
    pub async fn read_exact(&mut self, len: usize) -> Result<Option<Bytes>, UsbmuxError> {
        loop {
            if self.buffer.len() >= len {
                return Ok(Some(self.buffer.split_to(len).freeze()));
            }

            self.buffer.reserve(len - self.buffer.len());
            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(UsbmuxError::NotEnoughBytes(self.buffer.len(), len));
            }
            trace!("Buffered {read} bytes, have {}/{len}", self.buffer.len());
        }
    }

    /// The wrapped stream, for writing requests on the same connection
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes that were read from the stream but not handed out yet
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Splits the reader into the stream and whatever is still buffered
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buffer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::ReadBuf;

    use super::*;

    /// Hands out at most `chunk` bytes per poll, yielding between chunks
    pub(crate) struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        pending: bool,
    }

    impl Trickle {
        pub(crate) fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk,
                pending: false,
            }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            // Alternate between pending and ready so every chunk is a separate wakeup
            if self.pending {
                self.pending = false;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            self.pending = true;

            let end = (self.pos + self.chunk)
                .min(self.data.len())
                .min(self.pos + buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    fn sample_frame() -> Vec<u8> {
        (0..=255u8).cycle().take(700).collect()
    }

    async fn read_in_pieces<R: AsyncRead + Unpin>(reader: &mut ExactReader<R>) -> Vec<u8> {
        let mut out = Vec::new();
        for len in [16, 300, 0, 4, 380] {
            let part = reader.read_exact(len).await.unwrap().unwrap();
            assert_eq!(part.len(), len);
            out.extend_from_slice(&part);
        }
        out
    }

    #[tokio::test]
    async fn fragmented_delivery_matches_single_chunk() {
        let frame = sample_frame();

        let mut whole = ExactReader::new(frame.as_slice());
        let from_whole = read_in_pieces(&mut whole).await;

        let mut trickle = ExactReader::new(Trickle::new(frame.clone(), 1));
        let from_trickle = read_in_pieces(&mut trickle).await;

        assert_eq!(from_whole, frame);
        assert_eq!(from_trickle, frame);
    }

    #[tokio::test]
    async fn over_delivery_is_kept_for_the_next_read() {
        let frame = sample_frame();
        let mut reader = ExactReader::new(frame.as_slice());

        let first = reader.read_exact(10).await.unwrap().unwrap();
        assert_eq!(&first[..], &frame[..10]);
        assert_eq!(reader.buffered(), &frame[10..]);

        let rest = reader.read_exact(690).await.unwrap().unwrap();
        assert_eq!(&rest[..], &frame[10..]);
    }

    #[tokio::test]
    async fn clean_end_of_stream_is_none() {
        let mut reader = ExactReader::new(&[1u8, 2, 3][..]);
        assert!(reader.read_exact(3).await.unwrap().is_some());
        assert!(reader.read_exact(16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let mut reader = ExactReader::new(Trickle::new(vec![7u8; 5], 2));
        match reader.read_exact(16).await {
            Err(UsbmuxError::NotEnoughBytes(got, wanted)) => {
                assert_eq!(got, 5);
                assert_eq!(wanted, 16);
            }
            other => panic!("expected NotEnoughBytes, got {other:?}"),
        }
        assert_eq!(reader.buffered(), &[7u8; 5]);
    }
}
