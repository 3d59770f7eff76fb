//! One frame per binary WebSocket message

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};

use super::{READ_QUEUE_SIZE, Transport, TransportError, recv_from_reader, send_within};
use crate::codec::FRAME_HEADER_SIZE;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FrameResult = Result<Vec<u8>, TransportError>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WsTransport {
    peer: String,
    sink: Option<SplitSink<WsStream, Message>>,
    frames: mpsc::Receiver<FrameResult>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(
        url: &str,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, TransportError> {
        let limit = FRAME_HEADER_SIZE + max_frame_bytes;
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(limit);
        config.max_frame_size = Some(limit);

        let (stream, _response) = match tokio::time::timeout(
            timeout,
            connect_async_with_config(url, Some(config), true),
        )
        .await
        {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    endpoint: url.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(pair)) => pair,
        };
        tracing::debug!(peer = url, "WebSocket connected");

        let (sink, stream) = stream.split();
        let (tx, rx) = mpsc::channel(READ_QUEUE_SIZE);
        let reader = tokio::spawn(read_messages(stream, tx));
        Ok(Self {
            peer: url.to_string(),
            sink: Some(sink),
            frames: rx,
            reader,
        })
    }
}

async fn read_messages(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<FrameResult>) {
    loop {
        let item = match stream.next().await {
            Some(Ok(Message::Binary(data))) => Ok(data),
            Some(Ok(Message::Text(text))) => {
                tracing::warn!(len = text.len(), "Ignoring text WebSocket message");
                continue;
            }
            // Pongs are queued by tungstenite and flushed on the next send
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                continue;
            }
            Some(Ok(Message::Close(_))) | None => Err(TransportError::Closed),
            Some(Err(e)) => Err(TransportError::Receive(e.to_string())),
        };
        let done = item.is_err();
        if tx.send(item).await.is_err() || done {
            return;
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let sink = self.sink.as_mut().ok_or(TransportError::Closed)?;
        send_within(timeout, sink.send(Message::Binary(frame.to_vec()))).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.sink.is_none() {
            return Err(TransportError::Closed);
        }
        recv_from_reader(&mut self.frames, timeout).await
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            // Close handshake is a write too; bound it
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                let _ = sink.send(Message::Close(None)).await;
                sink.close().await
            })
            .await;
            tracing::debug!(peer = %self.peer, "WebSocket closed");
        }
        self.reader.abort();
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_binary_messages_are_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text("hello".to_string())).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            // Echo one frame back
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => ws.send(Message::Binary(data)).await.unwrap(),
                other => panic!("unexpected {:?}", other),
            }
            let _ = ws.close(None).await;
        });

        let url = format!("ws://{}", addr);
        let mut client = WsTransport::connect(&url, Duration::from_secs(2), 1024)
            .await
            .unwrap();
        assert_eq!(client.receive(Duration::from_secs(2)).await.unwrap(), vec![1, 2, 3]);

        client.send(&[9, 9], Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.receive(Duration::from_secs(2)).await.unwrap(), vec![9, 9]);

        let err = client.receive(Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
        client.close().await;
        client.close().await;
        server.await.unwrap();
    }
}
