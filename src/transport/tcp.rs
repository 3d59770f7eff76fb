//! Length-prefixed frames over a TCP stream

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{READ_QUEUE_SIZE, Transport, TransportError, recv_from_reader, send_within};
use crate::codec::{FRAME_HEADER_SIZE, WireCodec};

type FrameResult = Result<Vec<u8>, TransportError>;

pub struct TcpTransport {
    peer: String,
    writer: Option<OwnedWriteHalf>,
    frames: mpsc::Receiver<FrameResult>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, TransportError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    endpoint: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(stream)) => stream,
        };
        // Frames are small and latency-bound
        let _ = stream.set_nodelay(true);
        tracing::debug!(peer = addr, "TCP connected");
        Ok(Self::from_stream(stream, addr.to_string(), max_frame_bytes))
    }

    /// Wrap an already-connected stream (also used by the simulated exchange)
    pub fn from_stream(stream: TcpStream, peer: String, max_frame_bytes: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(READ_QUEUE_SIZE);
        let reader = tokio::spawn(read_frames(
            read_half,
            WireCodec::new(max_frame_bytes),
            tx,
        ));
        Self {
            peer,
            writer: Some(write_half),
            frames: rx,
            reader,
        }
    }
}

/// Reader task: one `Ok(frame)` per complete frame, then a single `Err` on
/// EOF or failure. An oversized header ends the stream since the framing
/// cannot be recovered.
async fn read_frames(mut read: OwnedReadHalf, codec: WireCodec, tx: mpsc::Sender<FrameResult>) {
    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        if let Err(e) = read.read_exact(&mut header).await {
            let err = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Receive(e.to_string())
            };
            let _ = tx.send(Err(err)).await;
            return;
        }

        let len = match codec.payload_len(&header) {
            Ok(len) => len,
            Err(_) => {
                let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
                let _ = tx
                    .send(Err(TransportError::FrameTooLarge {
                        len,
                        max: codec.max_frame_bytes(),
                    }))
                    .await;
                return;
            }
        };

        let mut frame = vec![0u8; FRAME_HEADER_SIZE + len];
        frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
        if let Err(e) = read.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await {
            let _ = tx.send(Err(TransportError::Receive(e.to_string()))).await;
            return;
        }

        if tx.send(Ok(frame)).await.is_err() {
            // Transport dropped
            return;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        send_within(timeout, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.writer.is_none() {
            return Err(TransportError::Closed);
        }
        recv_from_reader(&mut self.frames, timeout).await
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            tracing::debug!(peer = %self.peer, "TCP closed");
        }
        self.reader.abort();
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Payload, WireMessage};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, server) = tokio::join!(
            TcpTransport::connect(&addr, Duration::from_secs(1), 1024),
            listener.accept()
        );
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_frames_split_across_writes() {
        let (mut client, mut server) = pair().await;
        let codec = WireCodec::new(1024);
        let frame = codec
            .encode(&WireMessage::new(1, Payload::Heartbeat { id: 9 }))
            .unwrap();

        // Dribble the frame in two writes plus a second frame
        server.write_all(&frame[..5]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(&frame[5..]).await.unwrap();
        server.write_all(&frame).await.unwrap();

        let a = client.receive(Duration::from_secs(1)).await.unwrap();
        let b = client.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(a, frame);
        assert_eq!(b, frame);
    }

    #[tokio::test]
    async fn test_receive_timeout_keeps_connection() {
        let (mut client, mut server) = pair().await;
        let err = client.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());

        let codec = WireCodec::new(1024);
        let frame = codec
            .encode(&WireMessage::new(2, Payload::HeartbeatAck { id: 1 }))
            .unwrap();
        server.write_all(&frame).await.unwrap();
        assert_eq!(client.receive(Duration::from_secs(1)).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_oversized_header_ends_stream() {
        let (mut client, mut server) = pair().await;
        let mut header = Vec::new();
        header.extend_from_slice(&(1_000_000u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        server.write_all(&header).await.unwrap();

        let err = client.receive(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::FrameTooLarge {
                len: 1_000_000,
                max: 1024
            }
        );
    }

    #[tokio::test]
    async fn test_peer_close_and_idempotent_close() {
        let (mut client, server) = pair().await;
        drop(server);
        let err = client.receive(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);

        client.close().await;
        client.close().await;
        assert_eq!(
            client.send(b"x", Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_send_times_out_when_peer_stops_reading() {
        let (mut client, _server) = pair().await;
        let chunk = vec![0u8; 64 * 1024];

        // The peer never reads; socket buffers fill and a write stalls
        let mut outcome = Ok(());
        for _ in 0..4096 {
            outcome = client.send(&chunk, Duration::from_millis(100)).await;
            if outcome.is_err() {
                break;
            }
        }
        assert_eq!(outcome, Err(TransportError::Timeout(Duration::from_millis(100))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpTransport::connect(&addr, Duration::from_secs(1), 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
