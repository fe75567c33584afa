//! In-process transport
//!
//! Ports live in a table shared by every clone of [`MemoryTransport`].
//! Clients dial a port with [`MemoryTransport::connect`] from any thread and
//! exchange events with the controller over tokio channels. Used by the
//! integration tests and by embedders that want a controller without a
//! socket.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Ack, Connection, Listener, Server, Transport, TransportEvent};
use crate::error::{KiteError, Result};

struct ClientFrame {
    event: String,
    args: Vec<Value>,
    ack: Option<oneshot::Sender<Value>>,
}

type ServerFrame = (String, Vec<Value>);

struct Dial {
    id: String,
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
}

/// Shared port table; clone freely
#[derive(Clone, Default)]
pub struct MemoryTransport {
    ports: Arc<Mutex<HashMap<u16, mpsc::UnboundedSender<Dial>>>>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.ports.lock().contains_key(&port)
    }

    /// Open a client connection to a listening port
    pub fn connect(&self, port: u16) -> Result<MemoryClient> {
        let dialer = self
            .ports
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| KiteError::transport(format!("nothing listening on memory port {port}")))?;

        let id = format!("mem-{}", self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, inbound) = mpsc::unbounded_channel();
        let (outbound, rx) = mpsc::unbounded_channel();

        dialer
            .send(Dial {
                id: id.clone(),
                inbound,
                outbound,
            })
            .map_err(|_| KiteError::transport(format!("memory port {port} closed")))?;

        Ok(MemoryClient { id, tx, rx })
    }
}

#[async_trait(?Send)]
impl Transport for MemoryTransport {
    async fn listen(&self, name: &str, port: u16, _options: &Value) -> Result<Listener> {
        let (dial_tx, mut dial_rx) = mpsc::unbounded_channel::<Dial>();
        {
            let mut ports = self.ports.lock();
            if ports.contains_key(&port) {
                return Err(KiteError::transport(format!("memory port {port} already in use")));
            }
            ports.insert(port, dial_tx);
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let server = Rc::new(MemoryServer {
            port,
            ports: self.ports.clone(),
            connections: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            accept: RefCell::new(None),
        });

        let weak = Rc::downgrade(&server);
        let controller = name.to_string();
        let accept = tokio::task::spawn_local(async move {
            while let Some(dial) = dial_rx.recv().await {
                let Some(server) = weak.upgrade() else { break };
                debug!(controller = %controller, connection = %dial.id, "Memory client connected");

                let connection = Rc::new(MemoryConnection {
                    id: dial.id,
                    outbound: RefCell::new(Some(dial.outbound)),
                    closed: Notify::new(),
                });
                server
                    .connections
                    .borrow_mut()
                    .insert(connection.id.clone(), connection.clone());

                if events_tx.send(TransportEvent::Connected(connection.clone())).is_err() {
                    break;
                }
                tokio::task::spawn_local(pump(
                    connection,
                    dial.inbound,
                    events_tx.clone(),
                    Rc::downgrade(&server),
                ));
            }
        });
        *server.accept.borrow_mut() = Some(accept);

        Ok(Listener { server, events })
    }
}

async fn pump(
    connection: Rc<MemoryConnection>,
    mut inbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    server: Weak<MemoryServer>,
) {
    let reason = loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    let event = TransportEvent::Message {
                        connection: connection.clone(),
                        event: frame.event,
                        args: frame.args,
                        ack: frame.ack.map(Ack::new),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                None => break "client disconnect",
            },
            _ = connection.closed.notified() => break "server disconnect",
        }
    };

    if let Some(server) = server.upgrade() {
        server.connections.borrow_mut().remove(&connection.id);
    }
    let _ = events.send(TransportEvent::Disconnected {
        connection: connection.clone(),
        reason: Some(reason.to_string()),
    });
}

struct MemoryServer {
    port: u16,
    ports: Arc<Mutex<HashMap<u16, mpsc::UnboundedSender<Dial>>>>,
    connections: RefCell<HashMap<String, Rc<MemoryConnection>>>,
    closed: Cell<bool>,
    accept: RefCell<Option<JoinHandle<()>>>,
}

impl Server for MemoryServer {
    fn port(&self) -> u16 {
        self.port
    }

    fn broadcast(&self, event: &str, args: &[Value]) {
        for connection in self.connections.borrow().values() {
            connection.emit(event, args.to_vec());
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.ports.lock().remove(&self.port);
        if let Some(accept) = self.accept.borrow_mut().take() {
            accept.abort();
        }
        let connections: Vec<_> = self.connections.borrow_mut().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.disconnect();
        }
        debug!(port = self.port, "Memory server closed");
    }
}

struct MemoryConnection {
    id: String,
    outbound: RefCell<Option<mpsc::UnboundedSender<ServerFrame>>>,
    closed: Notify,
}

impl Connection for MemoryConnection {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn emit(&self, event: &str, args: Vec<Value>) {
        if let Some(outbound) = self.outbound.borrow().as_ref() {
            let _ = outbound.send((event.to_string(), args));
        }
    }

    fn disconnect(&self) {
        if self.outbound.borrow_mut().take().is_some() {
            self.closed.notify_one();
        }
    }
}

/// Client end of a memory connection
#[derive(Debug)]
pub struct MemoryClient {
    id: String,
    tx: mpsc::UnboundedSender<ClientFrame>,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
}

impl MemoryClient {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send an event without waiting for an acknowledgement
    pub fn send(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.tx
            .send(ClientFrame {
                event: event.to_string(),
                args,
                ack: None,
            })
            .map_err(|_| KiteError::transport(format!("connection {} closed", self.id)))
    }

    /// Send an event and wait for the controller's acknowledgement
    pub async fn request(&self, event: &str, args: Vec<Value>) -> Result<Value> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ClientFrame {
                event: event.to_string(),
                args,
                ack: Some(ack),
            })
            .map_err(|_| KiteError::transport(format!("connection {} closed", self.id)))?;
        rx.await
            .map_err(|_| KiteError::transport(format!("no acknowledgement for {event}")))
    }

    /// Next event emitted by the server; `None` once disconnected
    pub async fn recv(&mut self) -> Option<(String, Vec<Value>)> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for ClientFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFrame").field("event", &self.event).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_connect_message_disconnect() {
        LocalSet::new()
            .run_until(async {
                let transport = MemoryTransport::new();
                let Listener { server, mut events } =
                    transport.listen("gate", 9001, &Value::Null).await.unwrap();
                assert!(transport.is_listening(9001));

                let client = transport.connect(9001).unwrap();
                match events.recv().await.unwrap() {
                    TransportEvent::Connected(c) => assert_eq!(c.id(), client.id()),
                    other => panic!("unexpected {other:?}"),
                }

                let pending = client.request("ping", vec![json!(1)]);
                let answer = async {
                    match events.recv().await.unwrap() {
                        TransportEvent::Message { event, args, ack, .. } => {
                            assert_eq!(event, "ping");
                            assert_eq!(args, vec![json!(1)]);
                            ack.unwrap().send(json!("pong"));
                        }
                        other => panic!("unexpected {other:?}"),
                    }
                };
                let (reply, ()) = tokio::join!(pending, answer);
                assert_eq!(reply.unwrap(), json!("pong"));

                drop(client);
                match events.recv().await.unwrap() {
                    TransportEvent::Disconnected { reason, .. } => {
                        assert_eq!(reason.as_deref(), Some("client disconnect"))
                    }
                    other => panic!("unexpected {other:?}"),
                }

                server.close();
                assert!(!transport.is_listening(9001));
                assert!(transport.connect(9001).is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_port_in_use() {
        LocalSet::new()
            .run_until(async {
                let transport = MemoryTransport::new();
                let _first = transport.listen("a", 9002, &Value::Null).await.unwrap();
                let err = transport.listen("b", 9002, &Value::Null).await.err().unwrap();
                assert_eq!(err.category(), "transport");
            })
            .await;
    }

    #[tokio::test]
    async fn test_broadcast_and_server_disconnect() {
        LocalSet::new()
            .run_until(async {
                let transport = MemoryTransport::new();
                let Listener { server, mut events } =
                    transport.listen("gate", 9003, &Value::Null).await.unwrap();
                let mut client = transport.connect(9003).unwrap();

                let connection = match events.recv().await.unwrap() {
                    TransportEvent::Connected(c) => c,
                    other => panic!("unexpected {other:?}"),
                };

                server.broadcast("news", &[json!("hello")]);
                assert_eq!(client.recv().await, Some(("news".to_string(), vec![json!("hello")])));

                connection.disconnect();
                assert_eq!(client.recv().await, None);
                match events.recv().await.unwrap() {
                    TransportEvent::Disconnected { reason, .. } => {
                        assert_eq!(reason.as_deref(), Some("server disconnect"))
                    }
                    other => panic!("unexpected {other:?}"),
                }
            })
            .await;
    }
}
