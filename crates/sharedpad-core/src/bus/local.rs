//! In-process message bus.
//!
//! Every [`LocalConnection`] shares one routing table behind a mutex. The
//! lock is never held across an await: calls enqueue the request, release
//! the table and then wait on the reply slot.

use super::{
    BusConnection, BusError, BusEvent, InboundEvents, InboundSender, MethodCall, Responder, Result,
    Signal,
};
use crate::envelope::WIRE_VERSION;
use async_trait::async_trait;
use futures::channel::mpsc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

struct Peer {
    tx: InboundSender,
    types_registered: bool,
    /// path -> interface
    objects: HashMap<String, String>,
    subscriptions: BTreeSet<String>,
}

#[derive(Default)]
struct Routing {
    next_serial: u64,
    peers: BTreeMap<String, Peer>,
    /// well-known name -> unique name
    names: BTreeMap<String, String>,
}

impl Routing {
    fn resolve<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.peers.contains_key(name) {
            return Some(name);
        }
        self.names.get(name).map(String::as_str)
    }
}

/// An in-process bus. Cheap to clone; clones share the routing table.
#[derive(Clone)]
pub struct LocalBus {
    routing: Arc<Mutex<Routing>>,
    wire_version: u32,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_wire_version(WIRE_VERSION)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that only accepts connections registering `wire_version`.
    pub fn with_wire_version(wire_version: u32) -> Self {
        Self {
            routing: Arc::new(Mutex::new(Routing::default())),
            wire_version,
        }
    }

    /// Open a new connection and the receiver for its inbound traffic.
    pub fn connect(&self) -> (LocalConnection, InboundEvents) {
        let (tx, rx) = mpsc::unbounded();
        let mut routing = lock(&self.routing);
        routing.next_serial += 1;
        let unique_name = format!(":1.{}", routing.next_serial);
        routing.peers.insert(
            unique_name.clone(),
            Peer {
                tx,
                types_registered: false,
                objects: HashMap::new(),
                subscriptions: BTreeSet::new(),
            },
        );
        debug!("Local bus: {} connected", unique_name);

        let conn = LocalConnection {
            unique_name,
            routing: Arc::clone(&self.routing),
            wire_version: self.wire_version,
        };
        (conn, rx)
    }

    /// Every name currently on the bus.
    pub fn names(&self) -> Vec<String> {
        list(&lock(&self.routing))
    }
}

fn lock(routing: &Mutex<Routing>) -> MutexGuard<'_, Routing> {
    routing.lock().unwrap_or_else(|e| e.into_inner())
}

fn list(routing: &Routing) -> Vec<String> {
    routing
        .peers
        .keys()
        .chain(routing.names.keys())
        .cloned()
        .collect()
}

/// One connection to a [`LocalBus`]. Dropping it releases its names.
pub struct LocalConnection {
    unique_name: String,
    routing: Arc<Mutex<Routing>>,
    wire_version: u32,
}

impl LocalConnection {
    /// Run `f` against our own routing entry, failing if types are not yet
    /// registered.
    fn with_registered<T>(&self, f: impl FnOnce(&mut Routing) -> Result<T>) -> Result<T> {
        let mut routing = lock(&self.routing);
        match routing.peers.get(&self.unique_name) {
            None => return Err(BusError::Disconnected),
            Some(peer) if !peer.types_registered => return Err(BusError::TypesNotRegistered),
            Some(_) => {}
        }
        f(&mut routing)
    }

    fn with_self<T>(&self, f: impl FnOnce(&mut Peer) -> T) -> Result<T> {
        self.with_registered(|routing| {
            routing
                .peers
                .get_mut(&self.unique_name)
                .map(f)
                .ok_or(BusError::Disconnected)
        })
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        let mut routing = lock(&self.routing);
        routing.peers.remove(&self.unique_name);
        routing.names.retain(|_, owner| *owner != self.unique_name);
        debug!("Local bus: {} disconnected", self.unique_name);
    }
}

#[async_trait]
impl BusConnection for LocalConnection {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    async fn register_types(&self, wire_version: u32) -> Result<()> {
        if wire_version != self.wire_version {
            return Err(BusError::WireVersionMismatch {
                expected: self.wire_version,
                actual: wire_version,
            });
        }
        let mut routing = lock(&self.routing);
        let peer = routing
            .peers
            .get_mut(&self.unique_name)
            .ok_or(BusError::Disconnected)?;
        peer.types_registered = true;
        Ok(())
    }

    async fn register_object(&self, path: &str, interface: &str) -> Result<()> {
        self.with_self(|peer| {
            if peer.objects.contains_key(path) {
                return Err(BusError::ObjectPathInUse { path: path.to_string() });
            }
            peer.objects.insert(path.to_string(), interface.to_string());
            Ok(())
        })?
    }

    async fn request_name(&self, name: &str) -> Result<()> {
        self.with_registered(|routing| {
            match routing.names.get(name) {
                Some(owner) if *owner == self.unique_name => Ok(()),
                Some(_) => Err(BusError::NameTaken { name: name.to_string() }),
                None => {
                    routing.names.insert(name.to_string(), self.unique_name.clone());
                    Ok(())
                }
            }
        })
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        self.with_registered(|routing| Ok(list(routing)))
    }

    async fn subscribe(&self, interface: &str) -> Result<()> {
        self.with_self(|peer| {
            peer.subscriptions.insert(interface.to_string());
        })
    }

    async fn emit(&self, mut signal: Signal) -> Result<()> {
        signal.sender = self.unique_name.clone();
        self.with_registered(|routing| {
            for peer in routing.peers.values() {
                if peer.subscriptions.contains(&signal.interface) {
                    // A receiver that went away is not the sender's problem
                    let _ = peer.tx.unbounded_send(BusEvent::Signal(signal.clone()));
                }
            }
            Ok(())
        })
    }

    async fn call(&self, mut call: MethodCall) -> Result<Vec<u8>> {
        call.sender = self.unique_name.clone();
        let reply = self.with_registered(|routing| {
            let owner = routing
                .resolve(&call.destination)
                .ok_or_else(|| BusError::ServiceUnknown {
                    name: call.destination.clone(),
                })?
                .to_string();
            let peer = routing.peers.get(&owner).ok_or(BusError::NoReply)?;
            if peer.objects.get(&call.path) != Some(&call.interface) {
                return Err(BusError::UnknownObject {
                    path: call.path.clone(),
                    interface: call.interface.clone(),
                });
            }

            let (responder, reply) = Responder::channel();
            peer.tx
                .unbounded_send(BusEvent::MethodCall { call, reply: responder })
                .map_err(|_| BusError::NoReply)?;
            Ok(reply)
        })?;

        reply.await.unwrap_or(Err(BusError::NoReply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn registered(bus: &LocalBus) -> (LocalConnection, InboundEvents) {
        let (conn, rx) = bus.connect();
        conn.register_types(WIRE_VERSION).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_unique_names_are_listed() {
        let bus = LocalBus::new();
        let (a, _ra) = registered(&bus).await;
        let (b, _rb) = registered(&bus).await;
        assert_ne!(a.unique_name(), b.unique_name());

        let names = a.list_names().await.unwrap();
        assert!(names.contains(&a.unique_name().to_string()));
        assert!(names.contains(&b.unique_name().to_string()));
    }

    #[tokio::test]
    async fn test_types_must_be_registered_first() {
        let bus = LocalBus::new();
        let (conn, _rx) = bus.connect();
        assert_eq!(
            conn.request_name("a.b").await,
            Err(BusError::TypesNotRegistered)
        );
        assert_eq!(
            conn.register_types(WIRE_VERSION + 1).await,
            Err(BusError::WireVersionMismatch {
                expected: WIRE_VERSION,
                actual: WIRE_VERSION + 1
            })
        );
        conn.register_types(WIRE_VERSION).await.unwrap();
        conn.request_name("a.b").await.unwrap();
    }

    #[tokio::test]
    async fn test_names_are_exclusive_and_released_on_drop() {
        let bus = LocalBus::new();
        let (a, _ra) = registered(&bus).await;
        let (b, _rb) = registered(&bus).await;

        a.request_name("sharedpad.x._1").await.unwrap();
        a.request_name("sharedpad.x._1").await.unwrap();
        assert!(matches!(
            b.request_name("sharedpad.x._1").await,
            Err(BusError::NameTaken { .. })
        ));

        drop(a);
        assert!(!bus.names().contains(&"sharedpad.x._1".to_string()));
        b.request_name("sharedpad.x._1").await.unwrap();
    }

    #[tokio::test]
    async fn test_object_path_once_per_connection() {
        let bus = LocalBus::new();
        let (a, _ra) = registered(&bus).await;
        let (b, _rb) = registered(&bus).await;
        a.register_object("/doc", "x.y").await.unwrap();
        assert!(matches!(
            a.register_object("/doc", "x.z").await,
            Err(BusError::ObjectPathInUse { .. })
        ));
        b.register_object("/doc", "x.y").await.unwrap();
    }

    #[tokio::test]
    async fn test_signals_reach_subscribers_including_sender() {
        let bus = LocalBus::new();
        let (a, mut ra) = registered(&bus).await;
        let (b, mut rb) = registered(&bus).await;
        let (_c, mut rc) = registered(&bus).await;
        a.subscribe("s.one").await.unwrap();
        b.subscribe("s.one").await.unwrap();

        a.emit(Signal::new("/doc", "s.one", "ping", vec![7])).await.unwrap();

        for rx in [&mut ra, &mut rb] {
            match rx.next().await {
                Some(BusEvent::Signal(signal)) => {
                    assert_eq!(signal.sender, a.unique_name());
                    assert_eq!(signal.member, "ping");
                    assert_eq!(signal.body, vec![7]);
                }
                other => panic!("expected signal, got {other:?}"),
            }
        }
        assert!(rc.try_next().is_err());
    }

    #[tokio::test]
    async fn test_call_routes_and_replies() {
        let bus = LocalBus::new();
        let (server, mut inbound) = registered(&bus).await;
        let (client, _rc) = registered(&bus).await;
        server.register_object("/doc", "s.one").await.unwrap();
        server.request_name("s.one._srv").await.unwrap();

        let serve = async {
            match inbound.next().await {
                Some(BusEvent::MethodCall { call, reply }) => {
                    assert_eq!(call.member, "echo");
                    assert_eq!(call.sender, client.unique_name());
                    reply.send(Ok(call.body));
                }
                other => panic!("expected call, got {other:?}"),
            }
        };
        let request = client.call(MethodCall::new("s.one._srv", "/doc", "s.one", "echo", vec![1, 2]));
        let ((), result) = futures::join!(serve, request);
        assert_eq!(result.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_call_by_unique_name() {
        let bus = LocalBus::new();
        let (server, mut inbound) = registered(&bus).await;
        let (client, _rc) = registered(&bus).await;
        server.register_object("/doc", "s.one").await.unwrap();

        let serve = async {
            match inbound.next().await {
                Some(BusEvent::MethodCall { reply, .. }) => {
                    reply.send(Ok(vec![7]));
                }
                other => panic!("expected call, got {other:?}"),
            }
        };
        let request = client.call(MethodCall::new(server.unique_name(), "/doc", "s.one", "m", vec![]));
        let ((), result) = futures::join!(serve, request);
        assert_eq!(result.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_call_failures() {
        let bus = LocalBus::new();
        let (server, inbound) = registered(&bus).await;
        let (client, _rc) = registered(&bus).await;
        server.register_object("/doc", "s.one").await.unwrap();
        server.request_name("s.one._srv").await.unwrap();

        let unknown = client
            .call(MethodCall::new("s.nobody", "/doc", "s.one", "m", vec![]))
            .await;
        assert!(matches!(unknown, Err(BusError::ServiceUnknown { .. })));

        let wrong_path = client
            .call(MethodCall::new("s.one._srv", "/other", "s.one", "m", vec![]))
            .await;
        assert!(matches!(wrong_path, Err(BusError::UnknownObject { .. })));

        drop(inbound);
        let no_reply = client
            .call(MethodCall::new("s.one._srv", "/doc", "s.one", "m", vec![]))
            .await;
        assert_eq!(no_reply, Err(BusError::NoReply));
    }

    #[tokio::test]
    async fn test_dropped_responder_is_no_reply() {
        let bus = LocalBus::new();
        let (server, mut inbound) = registered(&bus).await;
        let (client, _rc) = registered(&bus).await;
        server.register_object("/doc", "s.one").await.unwrap();

        let serve = async {
            // Receive and drop without answering
            let _ = inbound.next().await;
        };
        let request = client.call(MethodCall::new(server.unique_name(), "/doc", "s.one", "m", vec![]));
        let ((), result) = futures::join!(serve, request);
        assert_eq!(result, Err(BusError::NoReply));
    }
}
