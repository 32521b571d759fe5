//! Client side of the broker: a `BusConnection` over WebSocket.
//!
//! Requests are matched to replies by serial. The read task delivers
//! signals and inbound calls on the same ordered channel, and answers each
//! inbound call once the local handler fills its `Responder`.

use crate::message::{Frame, MAX_FRAME_SIZE};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sharedpad_core::bus::{InboundSender, Result as BusResult};
use sharedpad_core::{BusConnection, BusError, BusEvent, InboundEvents, MethodCall, Responder, Signal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = Arc<Mutex<SplitSink<WsStream, Message>>>;
type PendingReplies = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to bus: {0}")]
    Connect(#[from] WsError),

    #[error("Bus handshake failed: {0}")]
    Handshake(String),

    #[error("Bus closed the connection during handshake")]
    Closed,
}

/// A connection to a `sharedpad-bus` broker.
pub struct WsBusConnection {
    unique_name: String,
    write: WsWrite,
    pending: PendingReplies,
    next_serial: AtomicU64,
    read_task: Option<JoinHandle<()>>,
}

fn lock(pending: &PendingReplies) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Frame>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Payload of a data message; None for control messages.
fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Binary(data) => Some(data.to_vec()),
        Message::Text(text) => Some(text.into_bytes()),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

async fn send_frame(write: &WsWrite, frame: &Frame) -> BusResult<()> {
    let data = frame.to_binary().map_err(|e| BusError::InvalidArgs {
        reason: e.to_string(),
    })?;
    let mut w = write.lock().await;
    w.send(Message::Binary(data.into())).await.map_err(|e| {
        debug!("Bus send failed: {}", e);
        BusError::Disconnected
    })
}

impl WsBusConnection {
    /// Connect to the broker at `url` (e.g. `ws://127.0.0.1:7878`).
    ///
    /// Returns the connection and the receiver for its inbound traffic.
    pub async fn connect(url: &str) -> Result<(Self, InboundEvents), ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, mut read) = ws_stream.split();

        let unique_name = loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let Some(data) = message_bytes(msg) else {
                        continue;
                    };
                    match Frame::from_binary(&data) {
                        Some(Frame::Welcome {
                            unique_name,
                            wire_version,
                        }) => {
                            debug!("Broker speaks wire version {}", wire_version);
                            break unique_name;
                        }
                        other => {
                            return Err(ClientError::Handshake(format!(
                                "expected welcome, got {other:?}"
                            )));
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::Closed),
            }
        };

        let write = Arc::new(Mutex::new(write));
        send_frame(&write, &Frame::Hello)
            .await
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        info!("Connected to bus at {} as {}", url, unique_name);

        let pending: PendingReplies = Arc::default();
        let (inbound_tx, inbound_rx) = futures::channel::mpsc::unbounded();
        let read_task = tokio::spawn(Self::read_loop(
            unique_name.clone(),
            read,
            Arc::clone(&write),
            Arc::clone(&pending),
            inbound_tx,
        ));

        let conn = Self {
            unique_name,
            write,
            pending,
            next_serial: AtomicU64::new(1),
            read_task: Some(read_task),
        };
        Ok((conn, inbound_rx))
    }

    /// Read loop that routes replies and forwards inbound traffic.
    async fn read_loop(
        name: String,
        mut read: SplitStream<WsStream>,
        write: WsWrite,
        pending: PendingReplies,
        inbound: InboundSender,
    ) {
        loop {
            match read.next().await {
                Some(Ok(Message::Close(_))) => {
                    debug!("Bus sent close frame to {}", name);
                    break;
                }
                Some(Ok(msg)) => {
                    let Some(data) = message_bytes(msg) else {
                        continue;
                    };
                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame for {} exceeds max size ({} > {}), dropping",
                            name,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }
                    match Frame::from_binary(&data) {
                        Some(frame) => Self::dispatch(frame, &write, &pending, &inbound),
                        None => warn!("Unparseable frame for {} ({} bytes)", name, data.len()),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Bus connection {} closed", name);
                        }
                        _ => {
                            error!("Bus connection error on {}: {}", name, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Bus stream for {} ended", name);
                    break;
                }
            }
        }

        // Waiting requests fail with Disconnected once their senders drop
        lock(&pending).clear();
    }

    fn dispatch(frame: Frame, write: &WsWrite, pending: &PendingReplies, inbound: &InboundSender) {
        match frame {
            Frame::Signal { signal } => {
                let _ = inbound.unbounded_send(BusEvent::Signal(signal));
            }
            Frame::Call { serial, call } => {
                let (reply, answer) = Responder::channel();
                if inbound
                    .unbounded_send(BusEvent::MethodCall { call, reply })
                    .is_err()
                {
                    debug!("Inbound call #{} arrived after shutdown", serial);
                }
                let write = Arc::clone(write);
                tokio::spawn(async move {
                    let result = answer.await.unwrap_or(Err(BusError::NoReply));
                    if let Err(e) = send_frame(&write, &Frame::Return { serial, result }).await {
                        debug!("Could not return call #{}: {}", serial, e);
                    }
                });
            }
            frame @ (Frame::Done { .. } | Frame::Names { .. } | Frame::Return { .. }) => {
                let serial = frame.serial().unwrap_or_default();
                match lock(pending).remove(&serial) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => warn!("Reply #{} matches no request", serial),
                }
            }
            other => warn!("Unexpected frame from bus: {:?}", other),
        }
    }

    /// Send a request and wait for the frame answering it.
    async fn request(&self, build: impl FnOnce(u64) -> Frame) -> BusResult<Frame> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(serial, tx);

        if let Err(e) = send_frame(&self.write, &build(serial)).await {
            lock(&self.pending).remove(&serial);
            return Err(e);
        }
        rx.await.map_err(|_| BusError::Disconnected)
    }

    async fn request_done(&self, build: impl FnOnce(u64) -> Frame) -> BusResult<()> {
        match self.request(build).await? {
            Frame::Done { result, .. } => result,
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(frame: &Frame) -> BusError {
    BusError::InvalidArgs {
        reason: format!("unexpected reply {frame:?}"),
    }
}

impl Drop for WsBusConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BusConnection for WsBusConnection {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    async fn register_types(&self, wire_version: u32) -> BusResult<()> {
        self.request_done(|serial| Frame::RegisterTypes {
            serial,
            wire_version,
        })
        .await
    }

    async fn register_object(&self, path: &str, interface: &str) -> BusResult<()> {
        self.request_done(|serial| Frame::RegisterObject {
            serial,
            path: path.to_string(),
            interface: interface.to_string(),
        })
        .await
    }

    async fn request_name(&self, name: &str) -> BusResult<()> {
        self.request_done(|serial| Frame::RequestName {
            serial,
            name: name.to_string(),
        })
        .await
    }

    async fn list_names(&self) -> BusResult<Vec<String>> {
        match self.request(|serial| Frame::ListNames { serial }).await? {
            Frame::Names { names, .. } => Ok(names),
            Frame::Done { result: Err(e), .. } => Err(e),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, interface: &str) -> BusResult<()> {
        self.request_done(|serial| Frame::Subscribe {
            serial,
            interface: interface.to_string(),
        })
        .await
    }

    async fn emit(&self, signal: Signal) -> BusResult<()> {
        send_frame(&self.write, &Frame::Emit { signal }).await
    }

    async fn call(&self, call: MethodCall) -> BusResult<Vec<u8>> {
        match self.request(|serial| Frame::Call { serial, call }).await? {
            Frame::Return { result, .. } => result,
            other => Err(unexpected(&other)),
        }
    }
}
