//! The broker: a message bus served over WebSocket.
//!
//! Owns every client connection and the routing table (well-known names,
//! exported objects, signal subscriptions, in-flight calls). All routing
//! happens on the single broker loop, so per-sender frame order is kept for
//! every receiver.

use crate::connection::{ClientConnection, ConnectionEvent};
use crate::message::Frame;
use anyhow::Result;
use sharedpad_core::{BusError, MethodCall, Signal, WIRE_VERSION};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Routing state of one client.
#[derive(Default)]
struct ClientState {
    types_registered: bool,
    /// path -> interface
    objects: HashMap<String, String>,
    subscriptions: BTreeSet<String>,
}

/// A call forwarded to a callee and not yet answered.
struct PendingCall {
    caller: String,
    caller_serial: u64,
    callee: String,
}

/// WebSocket message bus broker.
pub struct Broker {
    wire_version: u32,
    /// Connections indexed by unique name
    clients: HashMap<String, ClientConnection>,
    state: HashMap<String, ClientState>,
    /// well-known name -> unique name
    names: BTreeMap<String, String>,
    /// broker serial -> call awaiting its return
    pending_calls: HashMap<u64, PendingCall>,
    next_conn_id: u64,
    next_serial: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(WIRE_VERSION)
    }
}

impl Broker {
    /// Create a broker that accepts clients registering `wire_version`.
    pub fn new(wire_version: u32) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            wire_version,
            clients: HashMap::new(),
            state: HashMap::new(),
            names: BTreeMap::new(),
            pending_calls: HashMap::new(),
            next_conn_id: 1,
            next_serial: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Bus broker listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve clients from `listener` until the task is dropped.
    pub async fn serve(mut self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    /// Upgrade a new TCP connection to WebSocket and greet it.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Port checks connect and close without finishing the upgrade
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = format!(":1.{}", self.next_conn_id);
        self.next_conn_id += 1;
        info!("New bus client from {} ({})", addr, conn_id);

        let mut conn = ClientConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        let welcome = Frame::Welcome {
            unique_name: conn_id.clone(),
            wire_version: self.wire_version,
        };
        if let Err(e) = conn.send(&welcome).await {
            error!("Failed to greet {}: {}", conn_id, e);
            conn.close().await;
            return;
        }

        self.clients.insert(conn_id.clone(), conn);
        self.state.insert(conn_id, ClientState::default());
    }

    /// Route one event from a connection's read task.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { conn_id, frame } => self.handle_frame(&conn_id, frame).await,
            ConnectionEvent::Closed { conn_id } => self.remove_client(&conn_id).await,
        }
    }

    async fn handle_frame(&mut self, conn_id: &str, frame: Frame) {
        let greeted = match self.clients.get_mut(conn_id) {
            Some(conn) => {
                if matches!(frame, Frame::Hello) {
                    conn.greeted = true;
                    debug!("{} said hello", conn_id);
                    return;
                }
                conn.greeted
            }
            None => return,
        };
        if !greeted {
            warn!("Dropping frame from {} before hello", conn_id);
            return;
        }

        match frame {
            Frame::RegisterTypes { serial, wire_version } => {
                let result = self.register_types(conn_id, wire_version);
                self.reply_done(conn_id, serial, result).await;
            }
            Frame::RegisterObject {
                serial,
                path,
                interface,
            } => {
                let result = self.register_object(conn_id, path, interface);
                self.reply_done(conn_id, serial, result).await;
            }
            Frame::RequestName { serial, name } => {
                let result = self.request_name(conn_id, name);
                self.reply_done(conn_id, serial, result).await;
            }
            Frame::Subscribe { serial, interface } => {
                let result = self.registered(conn_id).map(|state| {
                    state.subscriptions.insert(interface);
                });
                self.reply_done(conn_id, serial, result).await;
            }
            Frame::ListNames { serial } => match self.registered(conn_id).map(|_| ()) {
                Ok(()) => {
                    let names = self.list_names();
                    self.send_to(conn_id, &Frame::Names { serial, names }).await;
                }
                Err(e) => self.reply_done(conn_id, serial, Err(e)).await,
            },
            Frame::Emit { signal } => self.emit(conn_id, signal).await,
            Frame::Call { serial, call } => self.route_call(conn_id, serial, call).await,
            Frame::Return { serial, result } => self.route_return(conn_id, serial, result).await,
            Frame::Welcome { .. }
            | Frame::Hello
            | Frame::Signal { .. }
            | Frame::Done { .. }
            | Frame::Names { .. } => {
                warn!("Unexpected frame from {}: {:?}", conn_id, frame);
            }
        }
    }

    fn registered(&mut self, conn_id: &str) -> Result<&mut ClientState, BusError> {
        match self.state.get_mut(conn_id) {
            Some(state) if state.types_registered => Ok(state),
            Some(_) => Err(BusError::TypesNotRegistered),
            None => Err(BusError::Disconnected),
        }
    }

    fn register_types(&mut self, conn_id: &str, wire_version: u32) -> Result<(), BusError> {
        if wire_version != self.wire_version {
            return Err(BusError::WireVersionMismatch {
                expected: self.wire_version,
                actual: wire_version,
            });
        }
        let state = self.state.get_mut(conn_id).ok_or(BusError::Disconnected)?;
        state.types_registered = true;
        Ok(())
    }

    fn register_object(&mut self, conn_id: &str, path: String, interface: String) -> Result<(), BusError> {
        let state = self.registered(conn_id)?;
        if state.objects.contains_key(&path) {
            return Err(BusError::ObjectPathInUse { path });
        }
        debug!("{} exports {} as {}", conn_id, path, interface);
        state.objects.insert(path, interface);
        Ok(())
    }

    fn request_name(&mut self, conn_id: &str, name: String) -> Result<(), BusError> {
        self.registered(conn_id)?;
        match self.names.get(&name) {
            Some(owner) if owner == conn_id => Ok(()),
            Some(_) => Err(BusError::NameTaken { name }),
            None => {
                info!("{} owns {}", conn_id, name);
                self.names.insert(name, conn_id.to_string());
                Ok(())
            }
        }
    }

    fn list_names(&self) -> Vec<String> {
        let mut unique: Vec<String> = self
            .clients
            .values()
            .filter(|conn| conn.greeted)
            .map(|conn| conn.conn_id.clone())
            .collect();
        unique.sort();
        unique.extend(self.names.keys().cloned());
        unique
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if self.clients.contains_key(name) {
            return Some(name.to_string());
        }
        self.names.get(name).cloned()
    }

    async fn emit(&mut self, conn_id: &str, mut signal: Signal) {
        if let Err(e) = self.registered(conn_id).map(|_| ()) {
            warn!("Dropping signal from {}: {}", conn_id, e);
            return;
        }
        signal.sender = conn_id.to_string();

        let receivers: Vec<String> = self
            .state
            .iter()
            .filter(|(_, state)| state.subscriptions.contains(&signal.interface))
            .map(|(id, _)| id.clone())
            .collect();
        debug!(
            "{} emits {}.{} to {} subscriber(s)",
            conn_id,
            signal.interface,
            signal.member,
            receivers.len()
        );

        let frame = Frame::Signal { signal };
        for receiver in receivers {
            self.send_to(&receiver, &frame).await;
        }
    }

    async fn route_call(&mut self, conn_id: &str, caller_serial: u64, mut call: MethodCall) {
        call.sender = conn_id.to_string();
        match self.prepare_call(conn_id, &call) {
            Ok(callee) => {
                let serial = self.next_serial;
                self.next_serial += 1;
                self.pending_calls.insert(
                    serial,
                    PendingCall {
                        caller: conn_id.to_string(),
                        caller_serial,
                        callee: callee.clone(),
                    },
                );
                debug!("{} calls {} on {} (#{})", conn_id, call.member, callee, serial);
                self.send_to(&callee, &Frame::Call { serial, call }).await;
            }
            Err(e) => {
                debug!("Call from {} failed: {}", conn_id, e);
                let frame = Frame::Return {
                    serial: caller_serial,
                    result: Err(e),
                };
                self.send_to(conn_id, &frame).await;
            }
        }
    }

    /// Find the callee for `call`, checking it exports the target object.
    fn prepare_call(&mut self, conn_id: &str, call: &MethodCall) -> Result<String, BusError> {
        self.registered(conn_id)?;
        let callee = self
            .resolve(&call.destination)
            .ok_or_else(|| BusError::ServiceUnknown {
                name: call.destination.clone(),
            })?;
        let exported = self
            .state
            .get(&callee)
            .and_then(|state| state.objects.get(&call.path));
        if exported != Some(&call.interface) {
            return Err(BusError::UnknownObject {
                path: call.path.clone(),
                interface: call.interface.clone(),
            });
        }
        Ok(callee)
    }

    async fn route_return(&mut self, conn_id: &str, serial: u64, result: Result<Vec<u8>, BusError>) {
        let Some(pending) = self.pending_calls.remove(&serial) else {
            warn!("Return #{} from {} matches no call", serial, conn_id);
            return;
        };
        if pending.callee != conn_id {
            warn!("Return #{} from {} but call went to {}", serial, conn_id, pending.callee);
            self.pending_calls.insert(serial, pending);
            return;
        }
        let frame = Frame::Return {
            serial: pending.caller_serial,
            result,
        };
        self.send_to(&pending.caller, &frame).await;
    }

    async fn reply_done(&self, conn_id: &str, serial: u64, result: Result<(), BusError>) {
        self.send_to(conn_id, &Frame::Done { serial, result }).await;
    }

    async fn send_to(&self, conn_id: &str, frame: &Frame) {
        let Some(conn) = self.clients.get(conn_id) else {
            debug!("Dropping frame for departed client {}", conn_id);
            return;
        };
        if let Err(e) = conn.send(frame).await {
            warn!("Failed to send to {}: {}", conn_id, e);
        }
    }

    /// Forget a client: its names, its objects and every call it was part of.
    async fn remove_client(&mut self, conn_id: &str) {
        if self.clients.remove(conn_id).is_none() {
            return;
        }
        self.state.remove(conn_id);
        self.names.retain(|_, owner| owner != conn_id);
        info!("Bus client disconnected: {}", conn_id);

        let orphaned: Vec<u64> = self
            .pending_calls
            .iter()
            .filter(|(_, call)| call.callee == conn_id || call.caller == conn_id)
            .map(|(serial, _)| *serial)
            .collect();
        for serial in orphaned {
            let Some(call) = self.pending_calls.remove(&serial) else {
                continue;
            };
            if call.caller != conn_id {
                let frame = Frame::Return {
                    serial: call.caller_serial,
                    result: Err(BusError::NoReply),
                };
                self.send_to(&call.caller, &frame).await;
            }
        }
    }
}
