//! One client connection on the broker side.
//!
//! Each connection wraps a WebSocket stream, handling the split between read
//! and write halves for async operation. The read half runs in its own task
//! and forwards parsed frames to the broker loop.

use crate::message::{Frame, MAX_FRAME_SIZE};
use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A well-formed frame from the client.
    Frame { conn_id: String, frame: Frame },
    /// Connection was closed.
    Closed { conn_id: String },
}

/// A single WebSocket connection to a bus client.
pub struct ClientConnection {
    /// Unique bus name assigned on accept (e.g. ":1.3")
    pub conn_id: String,
    /// Whether the client answered our welcome
    pub greeted: bool,
    /// Write half of the WebSocket (wrapped for sharing across tasks)
    write: Arc<Mutex<futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>,
    /// Handle to the read task
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Create a new connection from a WebSocket stream.
    ///
    /// Spawns a read task that forwards frames to the event channel.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            greeted: false,
            write,
            read_task: Some(read_task),
        }
    }

    /// Read loop that forwards frames to the event channel.
    async fn read_loop(
        conn_id: String,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", conn_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    match Frame::from_binary(&data) {
                        Some(frame) => {
                            let _ = event_tx.send(ConnectionEvent::Frame {
                                conn_id: conn_id.clone(),
                                frame,
                            });
                        }
                        None => warn!("Unparseable frame from {} ({} bytes)", conn_id, data.len()),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send a frame to the client.
    ///
    /// All frames are sent as binary WebSocket frames.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let data = frame.to_binary()?;
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data))
            .await
            .map_err(|e| anyhow!("Failed to send frame: {}", e))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
