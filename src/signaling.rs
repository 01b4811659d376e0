//! Signaling Dispatcher: the WebSocket-facing half of the core. Accepts
//! connections, maintains the per-connection [`PeerSession`], decodes and
//! encodes wire messages, enforces the request/response timeout, and
//! implements [`RoomEventSink`] so room actors can hand it broadcasts and
//! unicasts without depending on this module.

use crate::error::RoomError;
use crate::manager::Manager;
use crate::messages::{
    self, ConsumedData, ErrorData, ServerMessage, TransportCreatedData,
};
use crate::room::RoomEventSink;
use crate::session::PeerSession;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

type Tx = mpsc::UnboundedSender<Message>;
type Clients = RwLock<HashMap<SocketAddr, ClientInfo>>;

struct ClientInfo {
    session: PeerSession,
    tx: Tx,
}

pub struct SignalingServer {
    manager: Arc<Manager>,
    clients: Arc<Clients>,
}

impl SignalingServer {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn run(&self, host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "signaling server listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!(%peer_addr, "new tcp connection");

            let manager = self.manager.clone();
            let clients = self.clients.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, manager, clients).await {
                    tracing::warn!(%peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

impl RoomEventSink for SignalingServer {
    fn broadcast(&self, room_id: &str, exclude_peer_id: Option<&str>, message: ServerMessage) {
        let Ok(value) = serde_json::to_value(&message) else {
            return;
        };
        let clients = self.clients.read();
        for info in clients.values() {
            if info.session.room_id() != Some(room_id) {
                continue;
            }
            if exclude_peer_id == Some(info.session.peer_id()) {
                continue;
            }
            let _ = info.tx.send(Message::Text(value.to_string()));
        }
    }

    fn unicast(&self, room_id: &str, peer_id: &str, message: ServerMessage) {
        let Ok(value) = serde_json::to_value(&message) else {
            return;
        };
        let clients = self.clients.read();
        for info in clients.values() {
            if info.session.room_id() == Some(room_id) && info.session.peer_id() == peer_id {
                let _ = info.tx.send(Message::Text(value.to_string()));
                break;
            }
        }
    }

    fn close_connection(&self, room_id: &str, peer_id: &str) {
        let mut clients = self.clients.write();
        let addr = clients.iter().find_map(|(addr, info)| {
            (info.session.room_id() == Some(room_id) && info.session.peer_id() == peer_id)
                .then_some(*addr)
        });
        if let Some(addr) = addr {
            if let Some(info) = clients.remove(&addr) {
                let _ = info.tx.send(Message::Close(None));
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<Manager>,
    clients: Arc<Clients>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Peer id is minted here, never accepted from the client.
    let peer_id = Uuid::new_v4().to_string();
    clients.write().insert(
        addr,
        ClientInfo {
            session: PeerSession::new(peer_id),
            tx: tx.clone(),
        },
    );

    let ping_interval = std::time::Duration::from_secs(manager.config().ping_interval_secs);
    let ping_timeout = std::time::Duration::from_secs(manager.config().ping_timeout_secs);
    let mut ping_ticker = tokio::time::interval(ping_interval);
    ping_ticker.tick().await; // first tick fires immediately; discard it
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                if last_pong.elapsed() > ping_timeout {
                    tracing::debug!(%addr, "signaling keepalive timed out, closing connection");
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            msg = ws_receiver.next() => {
                let Some(msg) = msg else { break };
                let msg = msg?;
                match msg {
                    Message::Text(text) => match messages::parse_inbound(&text) {
                        Ok((client_msg, ack)) => {
                            dispatch(addr, client_msg, ack, &manager, &clients, &tx).await;
                        }
                        Err(e) => {
                            tracing::debug!(%addr, error = %e, "dropping malformed frame");
                            send_error(&tx, &e, None);
                        }
                    },
                    Message::Ping(payload) => {
                        let _ = tx.send(Message::Pong(payload));
                    }
                    Message::Pong(_) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Frame(_) => {}
                }
            }
        }
    }

    handle_disconnect(addr, &manager, &clients);
    send_task.abort();
    Ok(())
}

fn send_message(tx: &Tx, message: ServerMessage, ack: Option<Value>) {
    let Ok(value) = serde_json::to_value(&message) else {
        return;
    };
    let value = messages::with_ack(value, ack);
    let _ = tx.send(Message::Text(value.to_string()));
}

fn send_error(tx: &Tx, err: &RoomError, ack: Option<Value>) {
    err.log("signaling dispatch");
    send_message(tx, ServerMessage::Error(ErrorData::from_room_error(err)), ack);
}

/// Snapshot the peer id and current room, if joined, for `addr`.
fn session_of(clients: &Clients, addr: SocketAddr) -> Option<(String, Option<String>)> {
    clients
        .read()
        .get(&addr)
        .map(|info| (info.session.peer_id().to_string(), info.session.room_id().map(str::to_string)))
}

async fn dispatch(
    addr: SocketAddr,
    message: messages::ClientMessage,
    ack: Option<Value>,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    tx: &Tx,
) {
    use messages::ClientMessage::*;

    let ack_for_error = ack.clone();

    let result: Result<(), RoomError> = match message {
        JoinRoom { data } => handle_join(addr, data.room_id, manager, clients, tx, ack).await,
        CreateWebRtcTransport { data } => {
            handle_create_transport(addr, data.sender, manager, clients, tx, ack).await
        }
        ConnectTransport { data } => {
            handle_connect_transport(addr, data, manager, clients, tx, ack).await
        }
        Produce { data } => handle_produce(addr, data, manager, clients, tx, ack).await,
        Consume { data } => handle_consume(addr, data, manager, clients, tx, ack).await,
        ResumeConsumer { data } => {
            handle_resume_consumer(addr, data, manager, clients, tx, ack).await
        }
        CloseProducer { data } => {
            handle_close_producer(addr, data, manager, clients);
            Ok(())
        }
        KickPeer { data } => handle_kick_peer(data, manager, clients).await,
        RequestSync { data } => {
            handle_request_sync(addr, data, manager, clients);
            Ok(())
        }
    };

    if let Err(err) = result {
        send_error(tx, &err, ack_for_error);
    }
}

async fn handle_join(
    addr: SocketAddr,
    room_id: String,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    tx: &Tx,
    ack: Option<Value>,
) -> Result<(), RoomError> {
    let peer_id = {
        let mut clients = clients.write();
        let info = clients
            .get_mut(&addr)
            .ok_or_else(|| RoomError::Fatal("connection vanished".into()))?;
        info.session.join(room_id.clone())?;
        info.session.peer_id().to_string()
    };

    let outcome = async {
        let room = manager.get_or_create_room(&room_id).await?;
        room.join(peer_id.clone(), manager.config().request_timeout())
            .await
    }
    .await;

    if outcome.is_err() {
        // Roll the session state back so the connection can retry `joinRoom`,
        // whether room creation itself failed or the actor's join call did.
        if let Some(info) = clients.write().get_mut(&addr) {
            info.session = PeerSession::new(peer_id.clone());
        }
    }

    send_message(tx, ServerMessage::Joined(outcome?), ack);
    Ok(())
}

async fn handle_create_transport(
    addr: SocketAddr,
    sender: bool,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    tx: &Tx,
    ack: Option<Value>,
) -> Result<(), RoomError> {
    let (peer_id, room_id) = require_joined(clients, addr)?;
    let room = manager
        .get_room(&room_id)
        .ok_or_else(|| RoomError::NotFound("room not found".into()))?;

    let params = room
        .create_transport(peer_id, sender, manager.config().request_timeout())
        .await?;

    send_message(tx, ServerMessage::TransportCreated(TransportCreatedData { params }), ack);
    Ok(())
}

async fn handle_connect_transport(
    addr: SocketAddr,
    data: messages::ConnectTransportData,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    _tx: &Tx,
    ack: Option<Value>,
) -> Result<(), RoomError> {
    let (peer_id, room_id) = require_joined(clients, addr)?;
    let room = manager
        .get_room(&room_id)
        .ok_or_else(|| RoomError::NotFound("room not found".into()))?;

    room.connect_transport(
        peer_id,
        data.sender,
        data.dtls_parameters,
        manager.config().request_timeout(),
    )
    .await?;

    // No success reply, only an error one.
    let _ = ack;
    Ok(())
}

async fn handle_produce(
    addr: SocketAddr,
    data: messages::ProduceData,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    tx: &Tx,
    ack: Option<Value>,
) -> Result<(), RoomError> {
    let (peer_id, room_id) = require_joined(clients, addr)?;
    let room = manager
        .get_room(&room_id)
        .ok_or_else(|| RoomError::NotFound("room not found".into()))?;

    let produced = room
        .produce(
            peer_id,
            data.kind,
            data.rtp_parameters,
            data.app_data,
            manager.config().request_timeout(),
        )
        .await?;

    send_message(tx, ServerMessage::Produced(produced), ack);
    Ok(())
}

async fn handle_consume(
    addr: SocketAddr,
    data: messages::ConsumeData,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    tx: &Tx,
    ack: Option<Value>,
) -> Result<(), RoomError> {
    let (peer_id, room_id) = require_joined(clients, addr)?;
    let room = manager
        .get_room(&room_id)
        .ok_or_else(|| RoomError::NotFound("room not found".into()))?;

    let params = room
        .consume(
            peer_id,
            data.producer_id,
            data.rtp_capabilities,
            manager.config().request_timeout(),
        )
        .await?;

    send_message(tx, ServerMessage::Consumed(ConsumedData { params }), ack);
    Ok(())
}

async fn handle_resume_consumer(
    addr: SocketAddr,
    data: messages::ResumeConsumerData,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
    _tx: &Tx,
    ack: Option<Value>,
) -> Result<(), RoomError> {
    let (peer_id, room_id) = require_joined(clients, addr)?;
    let room = manager
        .get_room(&room_id)
        .ok_or_else(|| RoomError::NotFound("room not found".into()))?;

    room.resume_consumer(peer_id, data.consumer_id, manager.config().request_timeout())
        .await?;

    // No success reply, only an error one.
    let _ = ack;
    Ok(())
}

/// Fire-and-forget: failures are logged and dropped, never replied to.
fn handle_close_producer(
    addr: SocketAddr,
    data: messages::CloseProducerData,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
) {
    let (peer_id, room_id) = match require_joined(clients, addr) {
        Ok(v) => v,
        Err(e) => {
            e.log("closeProducer");
            return;
        }
    };
    match manager.get_room(&room_id) {
        Some(room) => room.close_producer(peer_id, data.producer_id),
        None => tracing::debug!(room_id, "closeProducer for unknown room, dropped"),
    }
}

async fn handle_kick_peer(
    data: messages::KickPeerData,
    manager: &Arc<Manager>,
    _clients: &Arc<Clients>,
) -> Result<(), RoomError> {
    // No authorization check: any joined peer may kick any other.
    if let Some(room) = manager.get_room(&data.room_id) {
        room.kick_peer(data.peer_id);
    }
    Ok(())
}

/// Fire-and-forget: failures are logged and dropped, never replied to.
fn handle_request_sync(
    addr: SocketAddr,
    data: messages::RequestSyncData,
    manager: &Arc<Manager>,
    clients: &Arc<Clients>,
) {
    let (peer_id, room_id) = match require_joined(clients, addr) {
        Ok(v) => v,
        Err(e) => {
            e.log("requestSync");
            return;
        }
    };
    match manager.get_room(&room_id) {
        Some(room) => room.request_sync(peer_id, data.peer_id),
        None => tracing::debug!(room_id, "requestSync for unknown room, dropped"),
    }
}

fn require_joined(clients: &Clients, addr: SocketAddr) -> Result<(String, String), RoomError> {
    let (peer_id, room_id) = session_of(clients, addr)
        .ok_or_else(|| RoomError::Fatal("connection vanished".into()))?;
    let room_id = room_id.ok_or_else(|| RoomError::PreconditionFailed("peer has not joined a room".into()))?;
    Ok((peer_id, room_id))
}

fn handle_disconnect(addr: SocketAddr, manager: &Arc<Manager>, clients: &Clients) {
    let info = clients.write().remove(&addr);
    if let Some(mut info) = info {
        if let Some(room_id) = info.session.room_id().map(str::to_string) {
            if let Some(room) = manager.get_room(&room_id) {
                room.disconnect_peer(info.session.peer_id().to_string());
            }
        }
        info.session.terminate();
        tracing::info!(peer_id = %info.session.peer_id(), "peer disconnected");
    }
}
