//! Wire schemas for the signaling channel.
//!
//! Both inbound envelope shapes, `{type, data}` and `{event, data, ack?}`,
//! are normalized into the same [`ClientMessage`] enum by [`parse_inbound`]
//! before dispatch. The dispatcher never has to know which shape a given
//! connection prefers.

use crate::error::RoomError;
use crate::registry::MediaType;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound request/response and fire-and-forget messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        data: JoinRoomData,
    },
    CreateWebRtcTransport {
        data: CreateWebRtcTransportData,
    },
    ConnectTransport {
        data: ConnectTransportData,
    },
    Produce {
        data: ProduceData,
    },
    Consume {
        data: ConsumeData,
    },
    ResumeConsumer {
        data: ResumeConsumerData,
    },
    CloseProducer {
        data: CloseProducerData,
    },
    KickPeer {
        data: KickPeerData,
    },
    RequestSync {
        data: RequestSyncData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomData {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransportData {
    /// `true` requests a send transport, `false` a recv transport.
    pub sender: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportData {
    pub dtls_parameters: DtlsParameters,
    pub sender: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppDataIn,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppDataIn {
    pub media_type: Option<MediaTypeWire>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaTypeWire {
    Camera,
    Screen,
}

impl From<MediaTypeWire> for MediaType {
    fn from(value: MediaTypeWire) -> Self {
        match value {
            MediaTypeWire::Camera => MediaType::Camera,
            MediaTypeWire::Screen => MediaType::Screen,
        }
    }
}

impl From<MediaType> for MediaTypeWire {
    fn from(value: MediaType) -> Self {
        match value {
            MediaType::Camera => MediaTypeWire::Camera,
            MediaType::Screen => MediaTypeWire::Screen,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerData {
    pub consumer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerData {
    pub producer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPeerData {
    pub peer_id: String,
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSyncData {
    pub peer_id: String,
}

/// Outbound replies and broadcasts.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Error(ErrorData),
    Joined(JoinedData),
    TransportCreated(TransportCreatedData),
    Produced(ProducedData),
    Consumed(ConsumedData),
    NewPeer(NewPeerData),
    PeerLeft(PeerLeftData),
    NewProducer(NewProducerData),
    ProducerClosed(ProducerClosedData),
    RequestSync(RequestSyncData),
}

#[derive(Debug, Serialize)]
pub struct ErrorData {
    pub error: String,
}

impl ErrorData {
    pub fn from_room_error(err: &RoomError) -> Self {
        Self {
            error: format!("{}: {}", err.kind(), err),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedData {
    pub router_rtp_capabilities: RtpCapabilitiesFinalized,
    pub current_producers: Vec<ProducerSummary>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub app_data: AppDataOut,
}

#[derive(Debug, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppDataOut {
    pub media_type: MediaTypeWire,
}

impl Default for MediaTypeWire {
    fn default() -> Self {
        MediaTypeWire::Camera
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedData {
    pub params: TransportParams,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducedData {
    pub producer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedData {
    pub params: ConsumeParams,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub id: String,
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub r#type: ConsumerType,
    pub producer_paused: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPeerData {
    pub peer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeftData {
    pub peer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducerData {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub app_data: AppDataOut,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedData {
    pub producer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
}

/// Normalize either inbound envelope shape into `(message, ack)`.
///
/// - `{"type": "...", "data": {...}}`
/// - `{"event": "...", "data": {...}, "ack": <any>}`
///
/// `ack`, when present, is echoed back verbatim on the reply so the caller
/// can correlate it.
pub fn parse_inbound(text: &str) -> Result<(ClientMessage, Option<Value>), RoomError> {
    let mut raw: Value = serde_json::from_str(text)
        .map_err(|e| RoomError::PreconditionFailed(format!("invalid JSON: {e}")))?;

    let obj = raw
        .as_object_mut()
        .ok_or_else(|| RoomError::PreconditionFailed("frame is not a JSON object".into()))?;

    let message_type = obj
        .remove("type")
        .or_else(|| obj.remove("event"))
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| {
            RoomError::PreconditionFailed("frame has neither `type` nor `event`".into())
        })?;

    let ack = obj.remove("ack");
    let data = obj.remove("data").unwrap_or(Value::Null);

    let normalized = serde_json::json!({ "type": message_type, "data": data });
    let message = serde_json::from_value(normalized)
        .map_err(|e| RoomError::PreconditionFailed(format!("invalid message shape: {e}")))?;

    Ok((message, ack))
}

/// Attach an ack correlation id to an already-serialized outbound envelope,
/// if one was present on the originating request.
pub fn with_ack(mut envelope: Value, ack: Option<Value>) -> Value {
    if let (Some(ack), Some(obj)) = (ack, envelope.as_object_mut()) {
        obj.insert("ack".to_string(), ack);
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_shape() {
        let text = r#"{"type":"joinRoom","data":{"roomId":"r1"}}"#;
        let (msg, ack) = parse_inbound(text).unwrap();
        assert!(ack.is_none());
        match msg {
            ClientMessage::JoinRoom { data } => assert_eq!(data.room_id, "r1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_event_ack_shape() {
        let text = r#"{"event":"resumeConsumer","data":{"consumerId":"c1"},"ack":42}"#;
        let (msg, ack) = parse_inbound(text).unwrap();
        assert_eq!(ack, Some(Value::from(42)));
        match msg {
            ClientMessage::ResumeConsumer { data } => assert_eq!(data.consumer_id, "c1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_frame_without_type_or_event() {
        let text = r#"{"data":{}}"#;
        assert!(parse_inbound(text).is_err());
    }

    #[test]
    fn serializes_new_producer_broadcast() {
        let msg = ServerMessage::NewProducer(NewProducerData {
            producer_id: "p1".into(),
            peer_id: "A".into(),
            kind: MediaKind::Video,
            app_data: AppDataOut {
                media_type: MediaTypeWire::Screen,
            },
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["data"]["producerId"], "p1");
        assert_eq!(value["data"]["appData"]["mediaType"], "screen");
    }

    #[test]
    fn with_ack_attaches_correlation_id() {
        let value = serde_json::json!({"type": "produced", "data": {"producerId": "p1"}});
        let value = with_ack(value, Some(Value::from("abc")));
        assert_eq!(value["ack"], "abc");
    }
}
