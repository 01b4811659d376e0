//! Thin, business-logic-free wrapper over the `mediasoup` crate. Every
//! fallible call here is translated into the core's own error taxonomy
//! (`RoomError::MediaError`) so callers never see a raw `mediasoup` error
//! type.

use crate::config::{self, Config};
use crate::error::RoomError;
use mediasoup::prelude::*;
use mediasoup::worker::Worker;

fn media_error(context: &str, err: impl std::fmt::Display) -> RoomError {
    RoomError::MediaError(format!("{context}: {err}"))
}

pub async fn create_router(worker: &Worker) -> Result<Router, RoomError> {
    worker
        .create_router(config::router_options())
        .await
        .map_err(|e| media_error("create_router", e))
}

pub struct TransportHandshake {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

pub async fn create_webrtc_transport(
    router: &Router,
    config: &Config,
) -> Result<(WebRtcTransport, TransportHandshake), RoomError> {
    let transport = router
        .create_webrtc_transport(config::webrtc_transport_options(config))
        .await
        .map_err(|e| media_error("create_webrtc_transport", e))?;

    transport
        .set_max_incoming_bitrate(config.max_incoming_bitrate)
        .await
        .map_err(|e| media_error("set_max_incoming_bitrate", e))?;

    let handshake = TransportHandshake {
        id: transport.id(),
        ice_parameters: transport.ice_parameters().clone(),
        ice_candidates: transport.ice_candidates().clone(),
        dtls_parameters: transport.dtls_parameters(),
    };

    Ok((transport, handshake))
}

pub async fn connect_transport(
    transport: &WebRtcTransport,
    dtls_parameters: DtlsParameters,
) -> Result<(), RoomError> {
    transport
        .connect(WebRtcTransportRemoteParameters { dtls_parameters })
        .await
        .map_err(|e| media_error("connect_transport", e))
}

pub async fn produce(
    transport: &WebRtcTransport,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
) -> Result<Producer, RoomError> {
    let options = ProducerOptions::new(kind, rtp_parameters);
    transport
        .produce(options)
        .await
        .map_err(|e| media_error("produce", e))
}

pub fn can_consume(router: &Router, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
    router.can_consume(&producer_id, rtp_capabilities)
}

pub async fn consume(
    transport: &WebRtcTransport,
    producer_id: ProducerId,
    rtp_capabilities: RtpCapabilities,
) -> Result<Consumer, RoomError> {
    let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
    options.paused = true;
    transport
        .consume(options)
        .await
        .map_err(|e| media_error("consume", e))
}

pub async fn resume_consumer(consumer: &Consumer) -> Result<(), RoomError> {
    consumer
        .resume()
        .await
        .map_err(|e| media_error("resume_consumer", e))
}
