//! Process configuration and the small amount of `mediasoup`
//! option-building that depends on it.

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag, WorkerSettings};
use serde::Deserialize;
use std::num::{NonZeroU32, NonZeroU8};

/// Recognized configuration surface. Every field has a default, so the
/// process starts with nothing configured at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listening endpoint of the signaling server.
    pub listen_host: String,
    pub listen_port: u16,

    /// Media worker pool.
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Room-level limits.
    pub max_peers_per_room: usize,

    /// WebRTC transport policy.
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub max_incoming_bitrate: u32,
    pub initial_outgoing_bitrate: u32,

    /// Signaling channel keep-alive.
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,

    /// Deadline enforced by the Signaling Dispatcher on request/response
    /// operations.
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get().min(3);
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 3016,
            num_workers: num_cpus,
            rtc_min_port: 40000,
            rtc_max_port: 45000,
            max_peers_per_room: 50,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: true,
            max_incoming_bitrate: 6_000_000,
            initial_outgoing_bitrate: 6_000_000,
            ping_interval_secs: 10,
            ping_timeout_secs: 20,
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from (in increasing precedence order) compiled-in
    /// defaults, an optional `config/default.toml`, and environment
    /// variables prefixed `SFU_ROOM_CORE__` (double underscore separates
    /// nested keys, e.g. `SFU_ROOM_CORE__LISTEN_PORT=4000`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Config::default();
        let builder = config::Config::builder()
            .set_default("listen_host", defaults.listen_host)?
            .set_default("listen_port", defaults.listen_port as i64)?
            .set_default("num_workers", defaults.num_workers as i64)?
            .set_default("rtc_min_port", defaults.rtc_min_port as i64)?
            .set_default("rtc_max_port", defaults.rtc_max_port as i64)?
            .set_default("max_peers_per_room", defaults.max_peers_per_room as i64)?
            .set_default("listen_ip", defaults.listen_ip)?
            .set_default("enable_udp", defaults.enable_udp)?
            .set_default("enable_tcp", defaults.enable_tcp)?
            .set_default("prefer_udp", defaults.prefer_udp)?
            .set_default("max_incoming_bitrate", defaults.max_incoming_bitrate as i64)?
            .set_default(
                "initial_outgoing_bitrate",
                defaults.initial_outgoing_bitrate as i64,
            )?
            .set_default("ping_interval_secs", defaults.ping_interval_secs as i64)?
            .set_default("ping_timeout_secs", defaults.ping_timeout_secs as i64)?
            .set_default("request_timeout_secs", defaults.request_timeout_secs as i64)?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::default()
                    .prefix("SFU_ROOM_CORE")
                    .separator("__"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Create worker settings from configuration.
pub fn worker_settings(config: &Config) -> WorkerSettings {
    let mut settings = WorkerSettings::default();
    settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;
    settings.log_level = WorkerLogLevel::Warn;
    settings.log_tags = vec![
        WorkerLogTag::Ice,
        WorkerLogTag::Dtls,
        WorkerLogTag::Rtp,
        WorkerLogTag::Rtcp,
    ];
    settings
}

/// Create router options with the codec descriptor set.
pub fn router_options() -> RouterOptions {
    RouterOptions::new(media_codecs())
}

fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        // Audio - Opus
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("useinbandfec", 1u32.into()),
                ("minptime", 10u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
        // Video - H264 (Primary)
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1u32.into()),
                ("profile-level-id", "42e01f".into()),
                ("level-asymmetry-allowed", 1u32.into()),
                ("x-google-start-bitrate", 3000u32.into()),
                ("x-google-max-bitrate", 5000u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
        // Video - VP8 (Fallback)
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("x-google-start-bitrate", 2500u32.into()),
                ("x-google-max-bitrate", 4000u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
    ]
}

/// Create WebRTC transport options from configuration.
pub fn webrtc_transport_options(config: &Config) -> WebRtcTransportOptions {
    let listen_info = ListenInfo {
        protocol: if config.prefer_udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        },
        ip: config
            .listen_ip
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
        announced_address: config.announced_ip.clone(),
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    };

    let listen_infos = WebRtcTransportListenInfos::new(listen_info);

    let mut options = WebRtcTransportOptions::new(listen_infos);
    options.initial_available_outgoing_bitrate = config.initial_outgoing_bitrate;
    options
}

/// Get local IP address, falling back to loopback when it cannot be
/// determined (containers without a default route, etc).
pub fn get_local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.num_workers >= 1);
        assert!(config.rtc_min_port < config.rtc_max_port);
        assert_eq!(config.listen_port, 3016);
    }

    #[test]
    fn load_falls_back_to_defaults_with_no_files_or_env() {
        let config = Config::load().expect("config should load from defaults alone");
        assert_eq!(config.listen_port, Config::default().listen_port);
        assert_eq!(config.request_timeout_secs, 10);
    }
}
