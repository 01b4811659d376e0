//! In-memory tables for a single Room's peers, transports, producers, and
//! consumers, plus the secondary indexes that keep them consistent.
//!
//! This module holds no live `mediasoup` handle, only ids and ownership
//! metadata, so its invariants can be exercised by plain unit tests
//! without a running media worker. The room actor (`room.rs`) pairs every
//! mutation here with the matching `mediasoup` call and keeps the live
//! handles in its own `RoomResources`.

use mediasoup::consumer::ConsumerId;
use mediasoup::producer::ProducerId;
use mediasoup::rtp_parameters::MediaKind;
use mediasoup::transport::TransportId;
use std::collections::{HashMap, HashSet};

pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    #[default]
    Camera,
    Screen,
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub owner_peer_id: PeerId,
    pub kind: MediaKind,
    pub media_type: MediaType,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub owner_peer_id: PeerId,
}

#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    pub id: PeerId,
    pub send_transport_id: Option<TransportId>,
    pub recv_transport_id: Option<TransportId>,
    pub producer_ids: HashSet<ProducerId>,
    pub consumer_ids: HashSet<ConsumerId>,
}

impl PeerRecord {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// True once the peer has no transports and no producers or consumers left.
    pub fn is_bare(&self) -> bool {
        self.send_transport_id.is_none()
            && self.recv_transport_id.is_none()
            && self.producer_ids.is_empty()
            && self.consumer_ids.is_empty()
    }
}

/// The result of removing a producer: the full set of consumers that
/// referenced it, gathered before removal.
#[derive(Debug, Clone, Default)]
pub struct ProducerRemoval {
    pub consumers: Vec<ConsumerRecord>,
}

/// Snapshot of a peer's cascade of owned resources, gathered before the
/// peer entry itself is deleted.
#[derive(Debug, Clone, Default)]
pub struct PeerRemoval {
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
    pub send_transport_id: Option<TransportId>,
    pub recv_transport_id: Option<TransportId>,
}

/// Per-room entity tables. Owned exclusively by that room's actor.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    peers: HashMap<PeerId, PeerRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    /// Per-(producer, consumer) latch ensuring `producerClosed` is emitted
    /// exactly once even though the explicit `closeProducer` path and the
    /// event-driven `producerclose` path can both race to close the same
    /// producer.
    notified_producer_closed: HashSet<(ProducerId, ConsumerId)>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Insert a peer if absent. Returns `true` if this call actually created
    /// the peer, used to decide whether to emit `newPeer`.
    pub fn ensure_peer(&mut self, peer_id: &str) -> bool {
        if self.peers.contains_key(peer_id) {
            return false;
        }
        self.peers
            .insert(peer_id.to_string(), PeerRecord::new(peer_id.to_string()));
        true
    }

    pub fn set_transport(&mut self, peer_id: &str, direction: Direction, transport_id: TransportId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            match direction {
                Direction::Send => peer.send_transport_id = Some(transport_id),
                Direction::Recv => peer.recv_transport_id = Some(transport_id),
            }
        }
    }

    pub fn transport_for(&self, peer_id: &str, direction: Direction) -> Option<TransportId> {
        let peer = self.peers.get(peer_id)?;
        match direction {
            Direction::Send => peer.send_transport_id,
            Direction::Recv => peer.recv_transport_id,
        }
    }

    /// Remove a single transport slot. Returns the peer's new "bare" status.
    pub fn clear_transport(&mut self, peer_id: &str, direction: Direction) -> Option<bool> {
        let peer = self.peers.get_mut(peer_id)?;
        match direction {
            Direction::Send => peer.send_transport_id = None,
            Direction::Recv => peer.recv_transport_id = None,
        }
        Some(peer.is_bare())
    }

    pub fn find_transport_direction(
        &self,
        peer_id: &str,
        transport_id: TransportId,
    ) -> Option<Direction> {
        let peer = self.peers.get(peer_id)?;
        if peer.send_transport_id == Some(transport_id) {
            Some(Direction::Send)
        } else if peer.recv_transport_id == Some(transport_id) {
            Some(Direction::Recv)
        } else {
            None
        }
    }

    pub fn insert_producer(&mut self, record: ProducerRecord) {
        if let Some(peer) = self.peers.get_mut(&record.owner_peer_id) {
            peer.producer_ids.insert(record.id);
        }
        self.producers.insert(record.id, record);
    }

    pub fn get_producer(&self, producer_id: &ProducerId) -> Option<&ProducerRecord> {
        self.producers.get(producer_id)
    }

    /// All producers in the room not owned by `excluding_peer_id`. Order is
    /// not guaranteed; callers needing a stable order sort by id.
    pub fn producers_excluding(&self, excluding_peer_id: &str) -> Vec<ProducerRecord> {
        self.producers
            .values()
            .filter(|p| p.owner_peer_id != excluding_peer_id)
            .cloned()
            .collect()
    }

    /// Remove a producer and every consumer that referenced it. Idempotent:
    /// returns `None` if the producer was already removed.
    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<ProducerRemoval> {
        let record = self.producers.remove(producer_id)?;
        if let Some(peer) = self.peers.get_mut(&record.owner_peer_id) {
            peer.producer_ids.remove(producer_id);
        }

        let mut removed_consumers = Vec::new();
        let consumer_ids: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.producer_id == producer_id)
            .map(|c| c.id)
            .collect();
        for consumer_id in consumer_ids {
            if let Some(consumer) = self.consumers.remove(&consumer_id) {
                if let Some(peer) = self.peers.get_mut(&consumer.owner_peer_id) {
                    peer.consumer_ids.remove(&consumer_id);
                }
                removed_consumers.push(consumer);
            }
        }

        Some(ProducerRemoval {
            consumers: removed_consumers,
        })
    }

    pub fn insert_consumer(&mut self, record: ConsumerRecord) {
        if let Some(peer) = self.peers.get_mut(&record.owner_peer_id) {
            peer.consumer_ids.insert(record.id);
        }
        self.consumers.insert(record.id, record);
    }

    pub fn get_consumer(&self, consumer_id: &ConsumerId) -> Option<&ConsumerRecord> {
        self.consumers.get(consumer_id)
    }

    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(consumer_id)?;
        if let Some(peer) = self.peers.get_mut(&record.owner_peer_id) {
            peer.consumer_ids.remove(consumer_id);
        }
        Some(record)
    }

    /// Record that `producerClosed` has been sent for this (producer,
    /// consumer) pair. Returns `true` if this call is the first to claim the
    /// latch (i.e. the caller should actually send the notification).
    pub fn claim_producer_closed_notification(
        &mut self,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    ) -> bool {
        self.notified_producer_closed
            .insert((producer_id, consumer_id))
    }

    /// Remove a peer and everything it owned. Returns the full cascade for
    /// the caller to close on the media side and gathered before the peer
    /// entry is deleted, satisfying invariant 4.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<PeerRemoval> {
        let peer = self.peers.remove(peer_id)?;

        let mut producers = Vec::new();
        for producer_id in &peer.producer_ids {
            if let Some(record) = self.producers.remove(producer_id) {
                producers.push(record);
            }
        }
        // Consumers held by peers other than this one, for producers this
        // peer owned, must also be torn down (invariant 1/3): gather them
        // before the owning producers are fully purged.
        let mut consumers = Vec::new();
        for producer in &producers {
            let dangling: Vec<ConsumerId> = self
                .consumers
                .values()
                .filter(|c| c.producer_id == producer.id)
                .map(|c| c.id)
                .collect();
            for consumer_id in dangling {
                if let Some(record) = self.consumers.remove(&consumer_id) {
                    if let Some(other_peer) = self.peers.get_mut(&record.owner_peer_id) {
                        other_peer.consumer_ids.remove(&consumer_id);
                    }
                    consumers.push(record);
                }
            }
        }
        // This peer's own consumers (of other peers' producers).
        for consumer_id in &peer.consumer_ids {
            if let Some(record) = self.consumers.remove(consumer_id) {
                consumers.push(record);
            }
        }

        Some(PeerRemoval {
            producers,
            consumers,
            send_transport_id: peer.send_transport_id,
            recv_transport_id: peer.recv_transport_id,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    /// Assert the registry's cross-table invariants hold. Test-only.
    #[cfg(test)]
    fn check_invariants(&self) {
        for producer in self.producers.values() {
            let owner = self
                .peers
                .get(&producer.owner_peer_id)
                .expect("producer owner must exist (invariant 1)");
            assert!(
                owner.producer_ids.contains(&producer.id),
                "producer must be reachable through its owner's producer set (invariant 1)"
            );
        }
        for consumer in self.consumers.values() {
            let producer = self
                .producers
                .get(&consumer.producer_id)
                .expect("consumer's source producer must exist in this room (invariant 2/3)");
            assert_ne!(
                producer.owner_peer_id, consumer.owner_peer_id,
                "a peer must never hold a consumer for a producer it owns itself (invariant 2)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> ProducerId {
        format!("00000000-0000-0000-0000-{:012}", n).parse().unwrap()
    }

    fn cid(n: u8) -> ConsumerId {
        format!("00000000-0000-0000-0000-{:012}", n).parse().unwrap()
    }

    fn tid(n: u8) -> TransportId {
        format!("00000000-0000-0000-0000-{:012}", n).parse().unwrap()
    }

    #[test]
    fn join_is_idempotent() {
        let mut reg = RoomRegistry::new();
        assert!(reg.ensure_peer("A"));
        assert!(!reg.ensure_peer("A"));
        assert_eq!(reg.peer_count(), 1);
    }

    #[test]
    fn produce_then_consume_maintains_invariants() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.ensure_peer("B");
        reg.set_transport("A", Direction::Send, tid(1));
        reg.set_transport("B", Direction::Recv, tid(2));

        reg.insert_producer(ProducerRecord {
            id: pid(1),
            owner_peer_id: "A".into(),
            kind: MediaKind::Video,
            media_type: MediaType::Camera,
        });
        reg.insert_consumer(ConsumerRecord {
            id: cid(1),
            producer_id: pid(1),
            owner_peer_id: "B".into(),
        });

        reg.check_invariants();
        assert_eq!(reg.producers_excluding("B").len(), 1);
        assert_eq!(reg.producers_excluding("A").len(), 0);
    }

    #[test]
    fn closing_producer_closes_its_consumers() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.ensure_peer("B");
        reg.insert_producer(ProducerRecord {
            id: pid(1),
            owner_peer_id: "A".into(),
            kind: MediaKind::Audio,
            media_type: MediaType::Camera,
        });
        reg.insert_consumer(ConsumerRecord {
            id: cid(1),
            producer_id: pid(1),
            owner_peer_id: "B".into(),
        });

        let removal = reg.remove_producer(&pid(1)).expect("producer existed");
        assert_eq!(removal.consumers.len(), 1);
        assert_eq!(removal.consumers[0].id, cid(1));
        assert!(reg.get_consumer(&cid(1)).is_none());
        assert!(reg.get_peer("B").unwrap().consumer_ids.is_empty());
    }

    #[test]
    fn closing_producer_twice_is_idempotent() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.insert_producer(ProducerRecord {
            id: pid(1),
            owner_peer_id: "A".into(),
            kind: MediaKind::Audio,
            media_type: MediaType::Camera,
        });
        assert!(reg.remove_producer(&pid(1)).is_some());
        assert!(reg.remove_producer(&pid(1)).is_none());
    }

    #[test]
    fn producer_closed_notification_latch_fires_once() {
        let mut reg = RoomRegistry::new();
        assert!(reg.claim_producer_closed_notification(pid(1), cid(1)));
        assert!(!reg.claim_producer_closed_notification(pid(1), cid(1)));
        assert!(reg.claim_producer_closed_notification(pid(1), cid(2)));
    }

    #[test]
    fn disconnect_purges_all_indexes() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.ensure_peer("B");
        reg.set_transport("A", Direction::Send, tid(1));
        reg.set_transport("B", Direction::Recv, tid(2));
        reg.insert_producer(ProducerRecord {
            id: pid(1),
            owner_peer_id: "A".into(),
            kind: MediaKind::Video,
            media_type: MediaType::Camera,
        });
        reg.insert_consumer(ConsumerRecord {
            id: cid(1),
            producer_id: pid(1),
            owner_peer_id: "B".into(),
        });

        let removal = reg.remove_peer("A").expect("peer existed");
        assert_eq!(removal.producers.len(), 1);
        assert_eq!(removal.consumers.len(), 1, "B's dangling consumer must cascade");
        assert!(!reg.has_peer("A"));
        assert!(reg.get_producer(&pid(1)).is_none());
        assert!(reg.get_consumer(&cid(1)).is_none());
        assert!(reg.get_peer("B").unwrap().consumer_ids.is_empty());
        assert!(!reg.is_empty(), "B is still present");

        let removal_b = reg.remove_peer("B").unwrap();
        assert!(removal_b.producers.is_empty());
        assert!(removal_b.consumers.is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn transport_slot_is_idempotent_until_closed() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.set_transport("A", Direction::Send, tid(1));
        assert_eq!(reg.transport_for("A", Direction::Send), Some(tid(1)));
        // A second creation request for the same (peer, direction) should be
        // satisfied by the existing transport id at the call site (room.rs),
        // not by overwriting it here.
        assert_eq!(
            reg.find_transport_direction("A", tid(1)),
            Some(Direction::Send)
        );
        let bare_after = reg.clear_transport("A", Direction::Send).unwrap();
        assert!(bare_after);
    }
}
