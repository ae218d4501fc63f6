use super::error::PeerError;
use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_LEN, READ_BUFFER_CAPACITY};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Length-prefixed framing over a byte stream.
///
/// Every frame is an 8-byte big-endian length followed by that many payload
/// bytes. The transport knows nothing about what the payload means. Bytes
/// read past the end of a frame stay buffered for the next call, so a frame
/// may arrive split over many reads and one read may carry several frames.
pub struct FrameTransport<S> {
    stream: S,
    read_buf: BytesMut,
    max_frame_len: usize,
    read_timeout: Option<Duration>,
}

impl<S> FrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            max_frame_len: MAX_FRAME_LEN,
            read_timeout: None,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Writes one frame and flushes it.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let header = (payload.len() as u64).to_be_bytes();
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Waits for the next complete frame and returns its payload.
    pub async fn recv_frame(&mut self) -> Result<Bytes, PeerError> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(frame);
            }
            self.fill_buf().await?;
        }
    }

    /// Closes the write half so the peer's pending read returns.
    pub async fn close(&mut self) -> Result<(), PeerError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn split_frame(&mut self) -> Result<Option<Bytes>, PeerError> {
        if self.read_buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.read_buf[..FRAME_HEADER_LEN]);
        let length = u64::from_be_bytes(header);

        if length > self.max_frame_len as u64 {
            return Err(PeerError::FrameTooLarge {
                len: length,
                max: self.max_frame_len,
            });
        }

        let total_len = FRAME_HEADER_LEN + length as usize;
        if self.read_buf.len() < total_len {
            self.read_buf.reserve(total_len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.read_buf.split_to(length as usize).freeze()))
    }

    async fn fill_buf(&mut self) -> Result<(), PeerError> {
        let read = self.stream.read_buf(&mut self.read_buf);
        let n = match self.read_timeout {
            Some(limit) => timeout(limit, read).await.map_err(|_| PeerError::Timeout)??,
            None => read.await?,
        };

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }
}
