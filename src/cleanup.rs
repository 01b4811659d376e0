//! Cleanup cascade planning for `closeProducer` and `disconnectPeer`/`kickPeer`.
//!
//! These functions take the removal snapshots [`RoomRegistry`] already
//! gathers and turn them into the flat list of notifications the room actor
//! must deliver. Nothing here touches a live `mediasoup` handle or the
//! notification-dedupe latch, so the cascades are exercised by plain unit
//! tests independent of both the media worker and the registry's own latch
//! bookkeeping.

use crate::registry::{ConsumerRecord, PeerRemoval, ProducerRemoval};
use mediasoup::producer::ProducerId;
use mediasoup::transport::TransportId;

/// A single `producerClosed` notification still to be delivered, addressed
/// to the peer that held the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerClosedNotice {
    pub producer_id: ProducerId,
    pub consumer: ConsumerRecord,
}

/// Plan the notifications for closing a single producer: one notice per
/// consumer that referenced it, addressed to that consumer's owning peer.
pub fn plan_producer_close(producer_id: ProducerId, removal: ProducerRemoval) -> Vec<ProducerClosedNotice> {
    removal
        .consumers
        .into_iter()
        .map(|consumer| ProducerClosedNotice {
            producer_id,
            consumer,
        })
        .collect()
}

/// The full cascade of a peer leaving the room: every `producerClosed`
/// notice owed to other peers, plus the transports that must be closed on
/// the media side.
#[derive(Debug, Clone, Default)]
pub struct PeerDisconnectCascade {
    pub producer_closed: Vec<ProducerClosedNotice>,
    pub transports_to_close: Vec<TransportId>,
}

/// Plan the cascade for a peer's departure. `removal.consumers` mixes two
/// kinds of consumer record: other peers' consumers left dangling by this
/// peer's producers closing, and this peer's own consumers of others'
/// producers. Both collapse to the same notice shape, telling whoever owns
/// the consumer that its producer is gone.
pub fn plan_peer_disconnect(removal: PeerRemoval) -> PeerDisconnectCascade {
    let producer_closed = removal
        .consumers
        .into_iter()
        .map(|consumer| ProducerClosedNotice {
            producer_id: consumer.producer_id,
            consumer,
        })
        .collect();

    let transports_to_close = removal
        .send_transport_id
        .into_iter()
        .chain(removal.recv_transport_id)
        .collect();

    PeerDisconnectCascade {
        producer_closed,
        transports_to_close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Direction, MediaType, ProducerRecord, RoomRegistry};
    use mediasoup::rtp_parameters::MediaKind;

    fn pid(n: u8) -> ProducerId {
        format!("00000000-0000-0000-0000-{:012}", n).parse().unwrap()
    }

    fn cid(n: u8) -> mediasoup::consumer::ConsumerId {
        format!("00000000-0000-0000-0000-{:012}", n).parse().unwrap()
    }

    fn tid(n: u8) -> TransportId {
        format!("00000000-0000-0000-0000-{:012}", n).parse().unwrap()
    }

    #[test]
    fn closing_a_producer_plans_one_notice_per_consumer() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.ensure_peer("B");
        reg.insert_producer(ProducerRecord {
            id: pid(1),
            owner_peer_id: "A".into(),
            kind: MediaKind::Video,
            media_type: MediaType::Camera,
        });
        reg.insert_consumer(crate::registry::ConsumerRecord {
            id: cid(1),
            producer_id: pid(1),
            owner_peer_id: "B".into(),
        });

        let removal = reg.remove_producer(&pid(1)).unwrap();
        let plan = plan_producer_close(pid(1), removal);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].producer_id, pid(1));
        assert_eq!(plan[0].consumer.owner_peer_id, "B");
    }

    #[test]
    fn peer_disconnect_plans_notices_and_transport_closes() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        reg.ensure_peer("B");
        reg.set_transport("A", Direction::Send, tid(1));
        reg.set_transport("A", Direction::Recv, tid(2));
        reg.insert_producer(ProducerRecord {
            id: pid(1),
            owner_peer_id: "A".into(),
            kind: MediaKind::Audio,
            media_type: MediaType::Camera,
        });
        reg.insert_consumer(crate::registry::ConsumerRecord {
            id: cid(1),
            producer_id: pid(1),
            owner_peer_id: "B".into(),
        });

        let removal = reg.remove_peer("A").unwrap();
        let cascade = plan_peer_disconnect(removal);

        assert_eq!(cascade.producer_closed.len(), 1);
        assert_eq!(cascade.producer_closed[0].consumer.owner_peer_id, "B");
        assert_eq!(cascade.transports_to_close.len(), 2);
        assert!(cascade.transports_to_close.contains(&tid(1)));
        assert!(cascade.transports_to_close.contains(&tid(2)));
    }

    #[test]
    fn peer_disconnect_with_no_resources_plans_nothing() {
        let mut reg = RoomRegistry::new();
        reg.ensure_peer("A");
        let removal = reg.remove_peer("A").unwrap();
        let cascade = plan_peer_disconnect(removal);
        assert!(cascade.producer_closed.is_empty());
        assert!(cascade.transports_to_close.is_empty());
    }
}
