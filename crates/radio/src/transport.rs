//! Byte transport under the frame codec.
//!
//! The stream is not length-delimited by the transport itself: a receiver
//! reads exactly the fixed prefix, learns `length` from it, then reads exactly
//! `length + 12` more bytes. A partial read is never handed up as a frame.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tdma_core::{Result, TdmaError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::framing::{Frame, FIXED_PREFIX_LEN, FRAME_HEADER, LENGTH_OFFSET, TRAILER_LEN};
use crate::LinkConfig;

#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, address: &str) -> Result<()>;

    async fn send_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Next complete frame's bytes. `None` waits indefinitely.
    async fn receive_bytes(&mut self, timeout: Option<Duration>) -> Result<Bytes>;

    async fn disconnect(&mut self) -> Result<()>;

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        trace!("Sending {}", frame);
        self.send_bytes(&bytes).await
    }

    /// Receives and validates one frame. Decode failures surface as frame
    /// errors; the connection stays usable.
    async fn receive_frame(&mut self, timeout: Option<Duration>) -> Result<Frame> {
        let bytes = self.receive_bytes(timeout).await?;
        match Frame::decode_valid(&bytes) {
            Ok(frame) => {
                trace!("Received {}", frame);
                Ok(frame)
            }
            Err(e) => {
                debug!("Dropping undecodable frame ({}): {}", e, hex::encode(&bytes));
                Err(e)
            }
        }
    }
}

/// Cuts complete frames out of a byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    max_payload: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_payload: u32) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(FIXED_PREFIX_LEN),
            max_payload,
        }
    }

    /// Bytes of the next frame, header sentinel through footer. Garbage in
    /// front of a header, or a header declaring an oversized payload, is
    /// skipped by searching for the next sentinel. Cancel-safe: bytes already
    /// read stay buffered for the next call.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            self.fill(FRAME_HEADER.len()).await?;
            if self.buf[..FRAME_HEADER.len()] != FRAME_HEADER {
                let skip = resync_offset(&self.buf);
                warn!("Discarding {} bytes before next frame header", skip);
                self.buf.advance(skip);
                continue;
            }

            self.fill(FIXED_PREFIX_LEN).await?;
            let mut length = &self.buf[LENGTH_OFFSET..LENGTH_OFFSET + 4];
            let declared = length.get_u32();
            if declared > self.max_payload {
                warn!(
                    "Frame declares {} payload bytes (limit {}), resynchronising",
                    declared, self.max_payload
                );
                self.buf.advance(1);
                continue;
            }

            let total = FIXED_PREFIX_LEN + declared as usize + TRAILER_LEN;
            self.fill(total).await?;
            return Ok(self.buf.split_to(total).freeze());
        }
    }

    // Never reads past `n` buffered bytes.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            let want = (n - self.buf.len()) as u64;
            let read = (&mut self.reader).take(want).read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(TdmaError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

/// Distance to the first position after 0 where a header sentinel starts, or
/// could start once more bytes arrive.
fn resync_offset(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| buf[i..].starts_with(&FRAME_HEADER) || FRAME_HEADER.starts_with(&buf[i..]))
        .unwrap_or(buf.len())
}

struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

/// TCP transport, used by ground stations to dial the hub and by the hub for
/// each accepted connection.
pub struct TcpTransport {
    config: LinkConfig,
    max_frame_payload: u32,
    conn: Option<Connection>,
}

impl TcpTransport {
    pub fn new(config: LinkConfig, max_frame_payload: u32) -> Self {
        Self { config, max_frame_payload, conn: None }
    }

    pub fn from_stream(stream: TcpStream, config: LinkConfig, max_frame_payload: u32) -> Result<Self> {
        let mut transport = Self::new(config, max_frame_payload);
        transport.attach(stream)?;
        Ok(transport)
    }

    fn attach(&mut self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (r, w) = stream.into_split();
        self.conn = Some(Connection {
            reader: FrameReader::new(r, self.max_frame_payload),
            writer: w,
            peer,
        });
        Ok(())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|c| c.peer)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, address: &str) -> Result<()> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TdmaError::Timeout)??;
        self.attach(stream)?;
        info!("Connected to {}", address);
        Ok(())
    }

    async fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(TdmaError::NotConnected)?;
        timeout(self.config.write_timeout, conn.writer.write_all(buf))
            .await
            .map_err(|_| TdmaError::Timeout)??;
        Ok(())
    }

    async fn receive_bytes(&mut self, wait: Option<Duration>) -> Result<Bytes> {
        let conn = self.conn.as_mut().ok_or(TdmaError::NotConnected)?;
        match wait {
            Some(d) => timeout(d, conn.reader.next_frame())
                .await
                .map_err(|_| TdmaError::Timeout)?,
            None => conn.reader.next_frame().await,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.writer.shutdown().await {
                debug!("Shutdown of connection to {} failed: {}", conn.peer, e);
            }
            info!("Disconnected from {}", conn.peer);
        }
        Ok(())
    }
}
