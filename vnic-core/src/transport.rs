//! Transport layer between the bridging daemon and the hub.
//!
//! This module handles:
//! - The TCP connection to the hub
//! - Framing outbound Ethernet frames into batched records
//! - Splitting the inbound byte stream back into frames

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::proto::{ProtocolError, RecordDecoder, SendBatcher};

/// Socket read buffer size
pub const SOCKBUFSIZE: usize = 32768;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connected hub session
pub struct HubConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl HubConnection {
    /// Connect to `endpoint` (`host:port`)
    pub async fn connect(endpoint: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(endpoint).await?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self { stream, peer_addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Split into independently usable read and write halves
    pub fn into_split(self, sendbuf_threshold: usize) -> (HubReader, HubWriter) {
        let (read, write) = self.stream.into_split();
        (
            HubReader {
                half: read,
                decoder: RecordDecoder::new(),
                buf: vec![0u8; SOCKBUFSIZE],
            },
            HubWriter {
                half: write,
                batcher: SendBatcher::new(sendbuf_threshold),
            },
        )
    }
}

/// Receiving half: yields whole frames
pub struct HubReader {
    half: OwnedReadHalf,
    decoder: RecordDecoder,
    buf: Vec<u8>,
}

impl HubReader {
    /// Next frame from the hub, `Ok(None)` once the hub closes the stream.
    ///
    /// Cancel-safe: bytes already read stay buffered in the decoder.
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

/// Sending half: batches records and flushes them to the socket
pub struct HubWriter {
    half: OwnedWriteHalf,
    batcher: SendBatcher,
}

impl HubWriter {
    /// Queue a frame, flushing if the batching rules say so.
    /// Returns the number of bytes written (0 if still buffered).
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        if self.batcher.push(frame) {
            self.flush().await
        } else {
            Ok(0)
        }
    }

    /// Write out everything buffered
    pub async fn flush(&mut self) -> Result<usize, TransportError> {
        if self.batcher.is_empty() {
            return Ok(0);
        }
        let data = self.batcher.take();
        self.half.write_all(&data).await?;
        Ok(data.len())
    }

    pub fn pending(&self) -> usize {
        self.batcher.len()
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.flush().await?;
        self.half.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{encode_record, ETHERMAX, SENDBUF_THRESHOLD};
    use bytes::BytesMut;
    use tokio::net::TcpListener;

    async fn pair() -> (HubConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("local addr").to_string();
        let (client, accepted) =
            tokio::join!(HubConnection::connect(&endpoint), listener.accept());
        (client.expect("connect"), accepted.expect("accept").0)
    }

    #[tokio::test]
    async fn test_receive_frames_from_hub() {
        let (conn, mut hub) = pair().await;
        let (mut reader, _writer) = conn.into_split(SENDBUF_THRESHOLD);

        let mut wire = BytesMut::new();
        encode_record(&[1u8; 61], &mut wire);
        encode_record(&[2u8; 64], &mut wire);
        hub.write_all(&wire).await.expect("hub write");
        drop(hub);

        let first = reader.recv_frame().await.expect("recv").expect("frame");
        assert_eq!(first.len(), 61);
        let second = reader.recv_frame().await.expect("recv").expect("frame");
        assert_eq!(&second[..], &[2u8; 64][..]);
        assert!(reader.recv_frame().await.expect("recv").is_none());
    }

    #[tokio::test]
    async fn test_batched_send() {
        let (conn, mut hub) = pair().await;
        let (_reader, mut writer) = conn.into_split(SENDBUF_THRESHOLD);

        // a full-size frame waits for company
        assert_eq!(writer.send_frame(&[0u8; ETHERMAX]).await.expect("send"), 0);
        assert!(writer.pending() > 0);

        // a short one flushes both
        let written = writer.send_frame(&[0u8; 60]).await.expect("send");
        assert_eq!(written, (8 + 1516) + (8 + 60));
        assert_eq!(writer.pending(), 0);

        let mut received = vec![0u8; written];
        hub.read_exact(&mut received).await.expect("hub read");
        assert_eq!(&received[0..4], &1516u32.to_be_bytes());
        assert_eq!(&received[4..8], &1514u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_garbage_from_hub_is_an_error() {
        let (conn, mut hub) = pair().await;
        let (mut reader, _writer) = conn.into_split(SENDBUF_THRESHOLD);
        hub.write_all(&[0xff; 8]).await.expect("hub write");

        assert!(matches!(
            reader.recv_frame().await,
            Err(TransportError::Protocol(_))
        ));
    }
}
