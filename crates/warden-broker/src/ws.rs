//! WebSocket client transport.
//!
//! Adapts a tungstenite WebSocket to [`ClientTransport`] so browser clients
//! and the session engine never see each other's concrete types. Text and
//! binary messages both map to byte frames; empty text frames are the
//! keep-alive.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use warden_core::constants::WS_HANDSHAKE_TIMEOUT;
use warden_core::error::{Error, Result};
use warden_core::transport::ClientTransport;

/// A WebSocket-backed client or viewer transport.
pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-negotiated WebSocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    /// Accept a server-side WebSocket on a raw stream, bounding the
    /// handshake.
    pub async fn accept(stream: S) -> Result<Self> {
        let ws = tokio::time::timeout(
            WS_HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_async(stream),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Protocol {
            message: format!("websocket handshake failed: {e}"),
        })?;
        Ok(Self::new(ws))
    }
}

#[async_trait]
impl<S> ClientTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&self) -> Result<Bytes> {
        loop {
            let message = self.stream.lock().await.next().await;
            match message {
                Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(Error::ConnectionClosed);
                }
                // Ping/pong are protocol-level; nothing to surface.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let message = match std::str::from_utf8(frame) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(frame.to_vec()),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Handshake a client/server pair over an in-memory duplex stream.
    async fn ws_pair() -> (
        Arc<WsTransport<tokio::io::DuplexStream>>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(WsTransport::accept(server_io));
        let (client_ws, _) = tokio_tungstenite::client_async("ws://broker.test/connect", client_io)
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();
        (Arc::new(server), client_ws)
    }

    #[tokio::test]
    async fn text_frames_round_trip() {
        let (server, mut client) = ws_pair().await;

        client
            .send(Message::Text("1ls -la\r".into()))
            .await
            .unwrap();
        assert_eq!(server.recv().await.unwrap().as_ref(), b"1ls -la\r");

        server.send(b"total 0\r\n").await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text, "total 0\r\n"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn binary_frames_round_trip() {
        let (server, mut client) = ws_pair().await;

        server.send(&[0x00, 0xFF, 0x80]).await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data, vec![0x00, 0xFF, 0x80]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_frame_ends_recv() {
        let (server, mut client) = ws_pair().await;
        client.close(None).await.unwrap();
        assert!(server.recv().await.is_err());
    }
}
