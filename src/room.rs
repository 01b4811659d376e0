//! Room State Machine and its single-writer actor runtime.
//!
//! A `Room` is a handle to a `tokio::spawn`ed task ("the room actor") that
//! owns a [`RoomRegistry`] plus every live `mediasoup` handle created for
//! that room. Every operation is one [`RoomCommand`] variant; the actor
//! drains its queue one command at a time, end to end, including any
//! `.await` on a media-worker call. No two commands for the same room are
//! ever in flight concurrently.

use crate::cleanup;
use crate::config::Config;
use crate::error::{RoomError, RoomResult};
use crate::facade;
use crate::messages::{
    AppDataIn, AppDataOut, ConsumeParams, JoinedData, MediaTypeWire, NewPeerData, NewProducerData,
    PeerLeftData, ProducedData, ProducerClosedData, ProducerSummary, RequestSyncData,
    ServerMessage, TransportParams,
};
use crate::registry::{ConsumerRecord, Direction, MediaType, PeerId, ProducerRecord, RoomRegistry};
use mediasoup::data_structures::DtlsState;
use mediasoup::prelude::*;
use mediasoup::worker::Worker;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Sink the room actor uses to hand broadcasts and unicasts back to the
/// Signaling Dispatcher. Implemented by `signaling::SignalingServer`.
pub trait RoomEventSink: Send + Sync {
    fn broadcast(&self, room_id: &str, exclude_peer_id: Option<&str>, message: ServerMessage);
    fn unicast(&self, room_id: &str, peer_id: &str, message: ServerMessage);
    fn close_connection(&self, room_id: &str, peer_id: &str);
}

/// Handle to a running room actor, held by the `Manager`'s room directory.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn call<T>(
        &self,
        deadline: std::time::Duration,
        build: impl FnOnce(oneshot::Sender<RoomResult<T>>) -> RoomCommand,
    ) -> RoomResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| RoomError::NotFound("room actor is gone".into()))?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            // The actor dropped the reply sender, which only happens if it
            // panicked mid-command; treat as a media error rather than a hang.
            Ok(Err(_)) => Err(RoomError::MediaError("room actor dropped reply".into())),
            Err(_) => Err(RoomError::Timeout),
        }
    }

    pub async fn join(&self, peer_id: PeerId, deadline: std::time::Duration) -> RoomResult<JoinedData> {
        self.call(deadline, |reply| RoomCommand::Join { peer_id, reply })
            .await
    }

    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        sender: bool,
        deadline: std::time::Duration,
    ) -> RoomResult<TransportParams> {
        self.call(deadline, |reply| RoomCommand::CreateTransport {
            peer_id,
            sender,
            reply,
        })
        .await
    }

    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        sender: bool,
        dtls_parameters: DtlsParameters,
        deadline: std::time::Duration,
    ) -> RoomResult<()> {
        self.call(deadline, |reply| RoomCommand::ConnectTransport {
            peer_id,
            sender,
            dtls_parameters,
            reply,
        })
        .await
    }

    pub async fn produce(
        &self,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppDataIn,
        deadline: std::time::Duration,
    ) -> RoomResult<ProducedData> {
        self.call(deadline, |reply| RoomCommand::Produce {
            peer_id,
            kind,
            rtp_parameters,
            app_data,
            reply,
        })
        .await
    }

    pub async fn consume(
        &self,
        peer_id: PeerId,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        deadline: std::time::Duration,
    ) -> RoomResult<ConsumeParams> {
        self.call(deadline, |reply| RoomCommand::Consume {
            peer_id,
            producer_id,
            rtp_capabilities,
            reply,
        })
        .await
    }

    pub async fn resume_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: String,
        deadline: std::time::Duration,
    ) -> RoomResult<()> {
        self.call(deadline, |reply| RoomCommand::ResumeConsumer {
            peer_id,
            consumer_id,
            reply,
        })
        .await
    }

    pub fn close_producer(&self, peer_id: PeerId, producer_id: String) {
        let _ = self.tx.send(RoomCommand::CloseProducer { peer_id, producer_id });
    }

    pub fn disconnect_peer(&self, peer_id: PeerId) {
        let _ = self.tx.send(RoomCommand::DisconnectPeer { peer_id });
    }

    pub fn kick_peer(&self, peer_id: PeerId) {
        let _ = self.tx.send(RoomCommand::KickPeer { peer_id });
    }

    pub fn request_sync(&self, from_peer_id: PeerId, target_peer_id: PeerId) {
        let _ = self.tx.send(RoomCommand::RequestSync {
            from_peer_id,
            target_peer_id,
        });
    }
}

enum RoomCommand {
    Join {
        peer_id: PeerId,
        reply: oneshot::Sender<RoomResult<JoinedData>>,
    },
    CreateTransport {
        peer_id: PeerId,
        sender: bool,
        reply: oneshot::Sender<RoomResult<TransportParams>>,
    },
    ConnectTransport {
        peer_id: PeerId,
        sender: bool,
        dtls_parameters: DtlsParameters,
        reply: oneshot::Sender<RoomResult<()>>,
    },
    Produce {
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppDataIn,
        reply: oneshot::Sender<RoomResult<ProducedData>>,
    },
    Consume {
        peer_id: PeerId,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        reply: oneshot::Sender<RoomResult<ConsumeParams>>,
    },
    ResumeConsumer {
        peer_id: PeerId,
        consumer_id: String,
        reply: oneshot::Sender<RoomResult<()>>,
    },
    CloseProducer {
        peer_id: PeerId,
        producer_id: String,
    },
    DisconnectPeer {
        peer_id: PeerId,
    },
    KickPeer {
        peer_id: PeerId,
    },
    RequestSync {
        from_peer_id: PeerId,
        target_peer_id: PeerId,
    },
    ProducerClosedEvent {
        producer_id: ProducerId,
    },
    TransportClosedEvent {
        peer_id: PeerId,
        transport_id: TransportId,
    },
}

/// Spawn a room actor for a freshly created router on `worker`, returning a
/// handle. `on_empty` fires with the room id once the last peer leaves, so
/// `manager.rs` can drop it from the global directory.
pub async fn spawn(
    room_id: String,
    worker: &Worker,
    config: Arc<Config>,
    sink: Arc<dyn RoomEventSink>,
    on_empty: mpsc::UnboundedSender<String>,
) -> RoomResult<RoomHandle> {
    let router = facade::create_router(worker).await?;
    let (tx, rx) = mpsc::unbounded_channel();

    let actor = RoomActor {
        room_id: room_id.clone(),
        router,
        config,
        sink,
        self_tx: tx.clone(),
        registry: RoomRegistry::new(),
        transports: HashMap::new(),
        producers: HashMap::new(),
        consumers: HashMap::new(),
        on_empty,
    };

    tokio::spawn(actor.run(rx));

    Ok(RoomHandle { room_id, tx })
}

struct RoomActor {
    room_id: String,
    router: Router,
    config: Arc<Config>,
    sink: Arc<dyn RoomEventSink>,
    self_tx: mpsc::UnboundedSender<RoomCommand>,
    registry: RoomRegistry,
    transports: HashMap<TransportId, WebRtcTransport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    on_empty: mpsc::UnboundedSender<String>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
            if self.registry.is_empty() {
                tracing::info!(room_id = %self.room_id, "room empty, reaping");
                let _ = self.on_empty.send(self.room_id.clone());
                // Router and every remaining handle are dropped with `self`,
                // closing them on the media side exactly once.
                return;
            }
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { peer_id, reply } => self.on_join(peer_id, reply),
            RoomCommand::CreateTransport { peer_id, sender, reply } => {
                self.on_create_transport(peer_id, sender, reply).await
            }
            RoomCommand::ConnectTransport {
                peer_id,
                sender,
                dtls_parameters,
                reply,
            } => {
                self.on_connect_transport(peer_id, sender, dtls_parameters, reply)
                    .await
            }
            RoomCommand::Produce {
                peer_id,
                kind,
                rtp_parameters,
                app_data,
                reply,
            } => self.on_produce(peer_id, kind, rtp_parameters, app_data, reply).await,
            RoomCommand::Consume {
                peer_id,
                producer_id,
                rtp_capabilities,
                reply,
            } => self.on_consume(peer_id, producer_id, rtp_capabilities, reply).await,
            RoomCommand::ResumeConsumer {
                peer_id,
                consumer_id,
                reply,
            } => self.on_resume_consumer(peer_id, consumer_id, reply).await,
            RoomCommand::CloseProducer { peer_id, producer_id } => {
                self.on_close_producer(peer_id, producer_id)
            }
            RoomCommand::DisconnectPeer { peer_id } => self.disconnect_peer(&peer_id),
            RoomCommand::KickPeer { peer_id } => {
                self.disconnect_peer(&peer_id);
                self.sink.close_connection(&self.room_id, &peer_id);
            }
            RoomCommand::RequestSync {
                from_peer_id,
                target_peer_id,
            } => self.on_request_sync(from_peer_id, target_peer_id),
            RoomCommand::ProducerClosedEvent { producer_id } => {
                self.close_producer_cascade(producer_id)
            }
            RoomCommand::TransportClosedEvent { peer_id, transport_id } => {
                self.on_transport_closed_event(peer_id, transport_id)
            }
        }
    }

    fn on_join(&mut self, peer_id: PeerId, reply: oneshot::Sender<RoomResult<JoinedData>>) {
        let is_new = self.registry.ensure_peer(&peer_id);

        let current_producers = self
            .registry
            .producers_excluding(&peer_id)
            .into_iter()
            .map(to_producer_summary)
            .collect();

        let payload = JoinedData {
            router_rtp_capabilities: self.router.rtp_capabilities().clone(),
            current_producers,
        };

        if reply.send(Ok(payload)).is_err() {
            // Caller already timed out. The registry entry is harmless to leave.
            return;
        }

        if is_new {
            self.sink.broadcast(
                &self.room_id,
                Some(&peer_id),
                ServerMessage::NewPeer(NewPeerData { peer_id: peer_id.clone() }),
            );
        }
    }

    async fn on_create_transport(
        &mut self,
        peer_id: PeerId,
        sender: bool,
        reply: oneshot::Sender<RoomResult<TransportParams>>,
    ) {
        if !self.registry.has_peer(&peer_id) {
            let _ = reply.send(Err(RoomError::NotFound(format!("peer {peer_id} not found"))));
            return;
        }
        let direction = if sender { Direction::Send } else { Direction::Recv };

        if let Some(existing_id) = self.registry.transport_for(&peer_id, direction) {
            if let Some(transport) = self.transports.get(&existing_id) {
                let params = TransportParams {
                    id: transport.id().to_string(),
                    ice_parameters: transport.ice_parameters().clone(),
                    ice_candidates: transport.ice_candidates().clone(),
                    dtls_parameters: transport.dtls_parameters(),
                };
                let _ = reply.send(Ok(params));
                return;
            }
        }

        let created = facade::create_webrtc_transport(&self.router, &self.config).await;
        let (transport, handshake) = match created {
            Ok(v) => v,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let transport_id = transport.id();
        self.subscribe_transport_close(peer_id.clone(), &transport);

        let params = TransportParams {
            id: handshake.id.to_string(),
            ice_parameters: handshake.ice_parameters,
            ice_candidates: handshake.ice_candidates,
            dtls_parameters: handshake.dtls_parameters,
        };

        if reply.send(Ok(params)).is_err() {
            // Timed out before we could deliver the handshake: roll the
            // allocation back.
            drop(transport);
            return;
        }

        self.registry.set_transport(&peer_id, direction, transport_id);
        self.transports.insert(transport_id, transport);
    }

    fn subscribe_transport_close(&self, peer_id: PeerId, transport: &WebRtcTransport) {
        let transport_id = transport.id();

        let tx1 = self.self_tx.clone();
        let peer_for_close = peer_id.clone();
        transport
            .on_close(move || {
                let _ = tx1.send(RoomCommand::TransportClosedEvent {
                    peer_id: peer_for_close.clone(),
                    transport_id,
                });
            })
            .detach();

        let tx2 = self.self_tx.clone();
        transport
            .on_dtls_state_change(move |state| {
                if state == DtlsState::Closed || state == DtlsState::Failed {
                    let _ = tx2.send(RoomCommand::TransportClosedEvent {
                        peer_id: peer_id.clone(),
                        transport_id,
                    });
                }
            })
            .detach();
    }

    fn on_transport_closed_event(&mut self, peer_id: PeerId, transport_id: TransportId) {
        let direction = match self.registry.find_transport_direction(&peer_id, transport_id) {
            Some(d) => d,
            None => return, // already cleared (explicit close beat us here)
        };
        self.transports.remove(&transport_id);
        if let Some(is_bare) = self.registry.clear_transport(&peer_id, direction) {
            if is_bare {
                // Peer has neither transport nor any resources left.
                self.disconnect_peer(&peer_id);
            }
        }
    }

    async fn on_connect_transport(
        &mut self,
        peer_id: PeerId,
        sender: bool,
        dtls_parameters: DtlsParameters,
        reply: oneshot::Sender<RoomResult<()>>,
    ) {
        let direction = if sender { Direction::Send } else { Direction::Recv };
        let transport_id = match self.registry.transport_for(&peer_id, direction) {
            Some(id) => id,
            None => {
                let _ = reply.send(Err(RoomError::NotFound("transport not found".into())));
                return;
            }
        };
        let transport = match self.transports.get(&transport_id) {
            Some(t) => t.clone(),
            None => {
                let _ = reply.send(Err(RoomError::NotFound("transport not found".into())));
                return;
            }
        };

        let result = facade::connect_transport(&transport, dtls_parameters).await;
        let _ = reply.send(result);
    }

    async fn on_produce(
        &mut self,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppDataIn,
        reply: oneshot::Sender<RoomResult<ProducedData>>,
    ) {
        let transport_id = match self.registry.transport_for(&peer_id, Direction::Send) {
            Some(id) => id,
            None => {
                let _ = reply.send(Err(RoomError::NotFound("send transport not found".into())));
                return;
            }
        };
        let transport = match self.transports.get(&transport_id) {
            Some(t) => t.clone(),
            None => {
                let _ = reply.send(Err(RoomError::NotFound("send transport not found".into())));
                return;
            }
        };

        let producer = match facade::produce(&transport, kind, rtp_parameters).await {
            Ok(p) => p,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let producer_id = producer.id();
        let media_type: MediaType = app_data.media_type.map(Into::into).unwrap_or_default();
        self.producers.insert(producer_id, producer);
        self.subscribe_producer_close(producer_id);

        let payload = ProducedData {
            producer_id: producer_id.to_string(),
        };

        if reply.send(Ok(payload)).is_err() {
            self.producers.remove(&producer_id);
            return;
        }

        self.registry.insert_producer(ProducerRecord {
            id: producer_id,
            owner_peer_id: peer_id.clone(),
            kind,
            media_type,
        });

        self.sink.broadcast(
            &self.room_id,
            Some(&peer_id),
            ServerMessage::NewProducer(NewProducerData {
                producer_id: producer_id.to_string(),
                peer_id,
                kind,
                app_data: AppDataOut {
                    media_type: media_type.into(),
                },
            }),
        );
    }

    fn subscribe_producer_close(&self, producer_id: ProducerId) {
        let producer = match self.producers.get(&producer_id) {
            Some(p) => p,
            None => return,
        };

        let tx1 = self.self_tx.clone();
        producer
            .on_close(move || {
                let _ = tx1.send(RoomCommand::ProducerClosedEvent { producer_id });
            })
            .detach();

        let tx2 = self.self_tx.clone();
        producer
            .on_transport_close(move || {
                let _ = tx2.send(RoomCommand::ProducerClosedEvent { producer_id });
            })
            .detach();
    }

    async fn on_consume(
        &mut self,
        peer_id: PeerId,
        producer_id_str: String,
        rtp_capabilities: RtpCapabilities,
        reply: oneshot::Sender<RoomResult<ConsumeParams>>,
    ) {
        let producer_id: ProducerId = match producer_id_str.parse() {
            Ok(id) => id,
            Err(_) => {
                let _ = reply.send(Err(RoomError::NotFound("malformed producer id".into())));
                return;
            }
        };

        let owner_peer_id = match self.registry.get_producer(&producer_id) {
            Some(record) if record.owner_peer_id == peer_id => {
                let _ = reply.send(Err(RoomError::PreconditionFailed(
                    "cannot consume a producer owned by self".into(),
                )));
                return;
            }
            Some(record) => record.owner_peer_id.clone(),
            None => {
                let _ = reply.send(Err(RoomError::NotFound("producer not found".into())));
                return;
            }
        };

        if !facade::can_consume(&self.router, producer_id, &rtp_capabilities) {
            let _ = reply.send(Err(RoomError::CannotConsume(
                "router cannot bridge this rtp capability set".into(),
            )));
            return;
        }

        let transport_id = match self.registry.transport_for(&peer_id, Direction::Recv) {
            Some(id) => id,
            None => {
                let _ = reply.send(Err(RoomError::NotFound("recv transport not found".into())));
                return;
            }
        };
        let transport = match self.transports.get(&transport_id) {
            Some(t) => t.clone(),
            None => {
                let _ = reply.send(Err(RoomError::NotFound("recv transport not found".into())));
                return;
            }
        };

        let consumer = match facade::consume(&transport, producer_id, rtp_capabilities).await {
            Ok(c) => c,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let consumer_id = consumer.id();
        let kind = consumer.kind();
        let rtp_parameters = consumer.rtp_parameters().clone();
        let consumer_type = consumer.r#type();
        let producer_paused = consumer.producer_paused();

        self.consumers.insert(consumer_id, consumer);
        self.subscribe_consumer_close(consumer_id, producer_id);

        let payload = ConsumeParams {
            id: consumer_id.to_string(),
            producer_id: producer_id.to_string(),
            peer_id: owner_peer_id,
            kind,
            rtp_parameters,
            r#type: consumer_type,
            producer_paused,
        };

        if reply.send(Ok(payload)).is_err() {
            self.consumers.remove(&consumer_id);
            return;
        }

        self.registry.insert_consumer(ConsumerRecord {
            id: consumer_id,
            producer_id,
            owner_peer_id: peer_id,
        });
    }

    fn subscribe_consumer_close(&self, consumer_id: ConsumerId, producer_id: ProducerId) {
        let consumer = match self.consumers.get(&consumer_id) {
            Some(c) => c,
            None => return,
        };

        let tx1 = self.self_tx.clone();
        consumer
            .on_transport_close(move || {
                let _ = tx1.send(RoomCommand::ProducerClosedEvent { producer_id });
            })
            .detach();

        let tx2 = self.self_tx.clone();
        consumer
            .on_producer_close(move || {
                let _ = tx2.send(RoomCommand::ProducerClosedEvent { producer_id });
            })
            .detach();
    }

    async fn on_resume_consumer(
        &mut self,
        peer_id: PeerId,
        consumer_id_str: String,
        reply: oneshot::Sender<RoomResult<()>>,
    ) {
        let consumer_id: ConsumerId = match consumer_id_str.parse() {
            Ok(id) => id,
            Err(_) => {
                let _ = reply.send(Err(RoomError::NotFound("malformed consumer id".into())));
                return;
            }
        };

        match self.registry.get_consumer(&consumer_id) {
            Some(record) if record.owner_peer_id == peer_id => {}
            Some(_) => {
                let _ = reply.send(Err(RoomError::PreconditionFailed(
                    "consumer belongs to a different peer".into(),
                )));
                return;
            }
            None => {
                let _ = reply.send(Err(RoomError::NotFound("consumer not found".into())));
                return;
            }
        }

        let consumer = match self.consumers.get(&consumer_id) {
            Some(c) => c.clone(),
            None => {
                let _ = reply.send(Err(RoomError::NotFound("consumer not found".into())));
                return;
            }
        };

        let result = facade::resume_consumer(&consumer).await;
        let _ = reply.send(result);
    }

    fn on_close_producer(&mut self, peer_id: PeerId, producer_id_str: String) {
        let producer_id: ProducerId = match producer_id_str.parse() {
            Ok(id) => id,
            Err(_) => return,
        };

        match self.registry.get_producer(&producer_id) {
            Some(record) if record.owner_peer_id == peer_id => {}
            _ => return, // not found, or not owned by this peer
        }

        self.close_producer_cascade(producer_id);
    }

    fn close_producer_cascade(&mut self, producer_id: ProducerId) {
        let removal = match self.registry.remove_producer(&producer_id) {
            Some(r) => r,
            None => return, // already closed via the other path; the dedupe latch
        };
        self.producers.remove(&producer_id);

        for notice in cleanup::plan_producer_close(producer_id, removal) {
            self.consumers.remove(&notice.consumer.id);
            self.notify_producer_closed(notice.producer_id, notice.consumer);
        }
    }

    fn notify_producer_closed(&mut self, producer_id: ProducerId, consumer: ConsumerRecord) {
        if self
            .registry
            .claim_producer_closed_notification(producer_id, consumer.id)
        {
            self.sink.unicast(
                &self.room_id,
                &consumer.owner_peer_id,
                ServerMessage::ProducerClosed(ProducerClosedData {
                    producer_id: producer_id.to_string(),
                    consumer_id: Some(consumer.id.to_string()),
                }),
            );
        }
    }

    fn disconnect_peer(&mut self, peer_id: &str) {
        let removal = match self.registry.remove_peer(peer_id) {
            Some(r) => r,
            None => return,
        };

        for producer in &removal.producers {
            self.producers.remove(&producer.id);
        }

        let cascade = cleanup::plan_peer_disconnect(removal);
        for notice in cascade.producer_closed {
            self.consumers.remove(&notice.consumer.id);
            self.notify_producer_closed(notice.producer_id, notice.consumer);
        }
        for transport_id in cascade.transports_to_close {
            self.transports.remove(&transport_id);
        }

        self.sink.broadcast(
            &self.room_id,
            None,
            ServerMessage::PeerLeft(PeerLeftData {
                peer_id: peer_id.to_string(),
            }),
        );
    }

    fn on_request_sync(&self, from_peer_id: PeerId, target_peer_id: PeerId) {
        if !self.registry.has_peer(&target_peer_id) {
            return;
        }
        self.sink.unicast(
            &self.room_id,
            &target_peer_id,
            ServerMessage::RequestSync(RequestSyncData { peer_id: from_peer_id }),
        );
    }
}

fn to_producer_summary(record: ProducerRecord) -> ProducerSummary {
    ProducerSummary {
        producer_id: record.id.to_string(),
        peer_id: record.owner_peer_id,
        kind: record.kind,
        app_data: AppDataOut {
            media_type: MediaTypeWire::from(record.media_type),
        },
    }
}
