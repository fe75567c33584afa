//! WebSocket transport
//!
//! JSON text frames over tokio-tungstenite. Clients send
//! `{"event": "login", "args": [...], "ack": 7}` (`ack` optional) and
//! receive either `{"event": "...", "args": [...]}` for emits or
//! `{"ack": 7, "data": ...}` answering an acknowledged message.
//!
//! Driver options: `host` (default `127.0.0.1`).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use kite_actors::{Ack, Connection, KiteError, Listener, Server, Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    ack: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ServerFrame {
    Emit { event: String, args: Vec<Value> },
    Ack { ack: u64, data: Value },
}

#[derive(Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl Transport for WsTransport {
    async fn listen(&self, name: &str, port: u16, options: &Value) -> kite_actors::Result<Listener> {
        let host = options.get("host").and_then(Value::as_str).unwrap_or(DEFAULT_HOST);
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| KiteError::transport_with_source(format!("failed to bind {host}:{port}"), e))?;
        let bound = listener
            .local_addr()
            .map_err(|e| KiteError::transport_with_source("listener has no local address", e))?;
        info!(controller = %name, address = %bound, "WebSocket listener bound");

        let (events_tx, events) = mpsc::unbounded_channel();
        let server = Rc::new(WsServer {
            port: bound.port(),
            connections: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            accept: RefCell::new(None),
        });

        let accept = tokio::task::spawn_local(accept_loop(listener, Rc::downgrade(&server), events_tx));
        *server.accept.borrow_mut() = Some(accept);

        Ok(Listener { server, events })
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Weak<WsServer>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        if server.upgrade().is_none() {
            break;
        }
        debug!(peer = %peer, "TCP connection accepted");
        tokio::task::spawn_local(serve_connection(stream, server.clone(), events.clone()));
    }
}

async fn serve_connection(stream: TcpStream, server: Weak<WsServer>, events: mpsc::UnboundedSender<TransportEvent>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let connection = Rc::new(WsConnection {
        id: Uuid::new_v4().to_string(),
        outbound: RefCell::new(Some(outbound)),
        closed: Notify::new(),
    });
    match server.upgrade() {
        Some(server) => {
            server
                .connections
                .borrow_mut()
                .insert(connection.id.clone(), connection.clone());
        }
        None => return,
    }
    if events.send(TransportEvent::Connected(connection.clone())).is_err() {
        return;
    }

    let reason = loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break "server disconnect" };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection = %connection.id, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                    debug!(connection = %connection.id, error = %e, "Send failed");
                    break "transport error";
                }
            }
            _ = connection.closed.notified() => break "server disconnect",
            message = ws_receiver.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: ClientFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(connection = %connection.id, error = %e, "Discarded malformed frame");
                            continue;
                        }
                    };
                    let ack = frame.ack.map(|id| acknowledge(id, &connection));
                    let event = TransportEvent::Message {
                        connection: connection.clone(),
                        event: frame.event,
                        args: frame.args,
                        ack,
                    };
                    if events.send(event).is_err() {
                        break "controller gone";
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break "client disconnect",
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %connection.id, error = %e, "Receive failed");
                    break "transport error";
                }
            },
        }
    };

    let _ = ws_sender.close().await;
    if let Some(server) = server.upgrade() {
        server.connections.borrow_mut().remove(&connection.id);
    }
    let _ = events.send(TransportEvent::Disconnected {
        connection,
        reason: Some(reason.to_string()),
    });
}

/// Ack whose value is written back as `{"ack": id, "data": value}`
fn acknowledge(id: u64, connection: &Rc<WsConnection>) -> Ack {
    let (tx, rx) = oneshot::channel();
    let connection = Rc::downgrade(connection);
    tokio::task::spawn_local(async move {
        let Ok(data) = rx.await else { return };
        if let Some(connection) = connection.upgrade() {
            connection.send(ServerFrame::Ack { ack: id, data });
        }
    });
    Ack::new(tx)
}

struct WsServer {
    port: u16,
    connections: RefCell<HashMap<String, Rc<WsConnection>>>,
    closed: Cell<bool>,
    accept: RefCell<Option<JoinHandle<()>>>,
}

impl Server for WsServer {
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
        if let Some(accept) = self.accept.borrow_mut().take() {
            accept.abort();
        }
        let connections: Vec<_> = self.connections.borrow_mut().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.disconnect();
        }
        info!(port = self.port, "WebSocket listener closed");
    }
}

struct WsConnection {
    id: String,
    outbound: RefCell<Option<mpsc::UnboundedSender<ServerFrame>>>,
    closed: Notify,
}

impl WsConnection {
    fn send(&self, frame: ServerFrame) {
        if let Some(outbound) = self.outbound.borrow().as_ref() {
            let _ = outbound.send(frame);
        }
    }
}

impl Connection for WsConnection {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn emit(&self, event: &str, args: Vec<Value>) {
        self.send(ServerFrame::Emit {
            event: event.to_string(),
            args,
        });
    }

    fn disconnect(&self) {
        if self.outbound.borrow_mut().take().is_some() {
            self.closed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_message_ack_and_emit() {
        LocalSet::new()
            .run_until(async {
                let Listener { server, mut events } =
                    WsTransport::new().listen("gate", 0, &Value::Null).await.unwrap();
                let port = server.port();
                assert_ne!(port, 0);

                let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
                    .await
                    .unwrap();

                let connection = match events.recv().await.unwrap() {
                    TransportEvent::Connected(connection) => connection,
                    other => panic!("unexpected {other:?}"),
                };

                let request = json!({ "event": "ping", "args": [1], "ack": 4 });
                client.send(WsMessage::Text(request.to_string())).await.unwrap();
                match events.recv().await.unwrap() {
                    TransportEvent::Message { event, args, ack, .. } => {
                        assert_eq!(event, "ping");
                        assert_eq!(args, vec![json!(1)]);
                        ack.unwrap().send(json!("hello"));
                    }
                    other => panic!("unexpected {other:?}"),
                }

                let reply = client.next().await.unwrap().unwrap();
                let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
                assert_eq!(reply, json!({ "ack": 4, "data": "hello" }));

                connection.emit("news", vec![json!("update")]);
                let pushed = client.next().await.unwrap().unwrap();
                let pushed: Value = serde_json::from_str(pushed.to_text().unwrap()).unwrap();
                assert_eq!(pushed, json!({ "event": "news", "args": ["update"] }));

                server.close();
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
