//! Engine configuration and construction

use crate::call::CallEngine;
use crate::media::CaptureDevice;
use crate::peer::PeerConnectionFactory;
use crate::signaling::SignalingChannel;
use crate::types::{IceServer, ParticipantId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default time an outbound call rings before it is missed
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(45);

/// Default wait for the server to acknowledge a hang-up
pub const DEFAULT_END_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Call engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallEngineConfig {
    /// STUN/TURN servers for every peer connection
    pub ice_servers: Vec<IceServer>,
    /// How long an outbound call rings before it is missed
    #[serde(rename = "ring_timeout_ms", with = "duration_ms")]
    pub ring_timeout: Duration,
    /// How long a hang-up notification waits for its acknowledgement
    #[serde(rename = "end_ack_timeout_ms", with = "duration_ms")]
    pub end_ack_timeout: Duration,
    /// Capacity of the broadcast side of the event bus
    pub event_capacity: usize,
}

impl Default for CallEngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            ring_timeout: DEFAULT_RING_TIMEOUT,
            end_ack_timeout: DEFAULT_END_ACK_TIMEOUT,
            event_capacity: 256,
        }
    }
}

impl CallEngineConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid configuration
    pub fn from_json(text: &str) -> Result<Self, ServiceError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ServiceError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns error on a zero timeout or event capacity
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.ring_timeout.is_zero() {
            return Err(ServiceError::ConfigError(
                "ring_timeout_ms must be positive".to_string(),
            ));
        }
        if self.end_ack_timeout.is_zero() {
            return Err(ServiceError::ConfigError(
                "end_ack_timeout_ms must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ServiceError::ConfigError(
                "event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Call engine builder
pub struct CallEngineBuilder<S: SignalingChannel + 'static> {
    local: ParticipantId,
    channel: Arc<S>,
    config: CallEngineConfig,
    capture: Option<Arc<dyn CaptureDevice>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
}

impl<S: SignalingChannel + 'static> CallEngineBuilder<S> {
    /// Create new builder
    #[must_use]
    pub fn new(local: ParticipantId, channel: Arc<S>) -> Self {
        Self {
            local,
            channel,
            config: CallEngineConfig::default(),
            capture: None,
            peers: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the ring timeout
    #[must_use]
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.config.ring_timeout = timeout;
        self
    }

    /// Set how long a hang-up waits for its acknowledgement
    #[must_use]
    pub fn with_end_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.end_ack_timeout = timeout;
        self
    }

    /// Replace the ICE server list
    #[must_use]
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    /// Set the capture device
    #[must_use]
    pub fn with_capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(device);
        self
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(factory);
        self
    }

    /// Build the engine
    ///
    /// Without the `webrtc-backend` feature, a capture device and a peer
    /// factory must be supplied.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or a backend is missing
    /// or cannot be created
    pub fn build(self) -> Result<Arc<CallEngine<S>>, ServiceError> {
        self.config.validate()?;

        let capture = match self.capture {
            Some(capture) => capture,
            None => default_capture()?,
        };
        let peers = match self.peers {
            Some(peers) => peers,
            None => default_peers()?,
        };

        tracing::info!(
            local = %self.local,
            ice_servers = self.config.ice_servers.len(),
            ring_timeout = ?self.config.ring_timeout,
            "Call engine created"
        );
        Ok(CallEngine::new(
            self.local,
            self.config,
            self.channel,
            capture,
            peers,
        ))
    }
}

impl<S: SignalingChannel + 'static> CallEngine<S> {
    /// Create a builder
    #[must_use]
    pub fn builder(local: ParticipantId, channel: Arc<S>) -> CallEngineBuilder<S> {
        CallEngineBuilder::new(local, channel)
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_capture() -> Result<Arc<dyn CaptureDevice>, ServiceError> {
    Ok(Arc::new(crate::rtc::SampleCaptureDevice::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_capture() -> Result<Arc<dyn CaptureDevice>, ServiceError> {
    Err(ServiceError::InitError("no capture device configured".to_string()))
}

#[cfg(feature = "webrtc-backend")]
fn default_peers() -> Result<Arc<dyn PeerConnectionFactory>, ServiceError> {
    let factory = crate::rtc::RtcPeerConnectionFactory::new()
        .map_err(|e| ServiceError::InitError(e.to_string()))?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_peers() -> Result<Arc<dyn PeerConnectionFactory>, ServiceError> {
    Err(ServiceError::InitError("no peer connection factory configured".to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = CallEngineConfig::default();
        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert_eq!(config.end_ack_timeout, Duration::from_secs(5));
        assert_eq!(config.ice_servers, vec![IceServer::new(DEFAULT_STUN_SERVER)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json() {
        let config =
            CallEngineConfig::from_json(r#"{"ring_timeout_ms": 1500, "end_ack_timeout_ms": 250}"#)
                .unwrap();
        assert_eq!(config.ring_timeout, Duration::from_millis(1500));
        assert_eq!(config.end_ack_timeout, Duration::from_millis(250));
        assert_eq!(config.event_capacity, 256);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["ring_timeout_ms"], 1500);
        assert_eq!(json["end_ack_timeout_ms"], 250);
        assert_eq!(json["ice_servers"][0]["urls"][0], DEFAULT_STUN_SERVER);
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let err = CallEngineConfig::from_json(r#"{"ring_timeout_ms": 0}"#).unwrap_err();
        assert!(matches!(err, ServiceError::ConfigError(_)));
        assert!(CallEngineConfig::from_json(r#"{"end_ack_timeout_ms": 0}"#).is_err());
        assert!(CallEngineConfig::from_json("not json").is_err());
    }
}
