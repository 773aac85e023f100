//! Relay engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::xor::DEFAULT_XOR_KEY;

/// Codec framing the resizer works in.
///
/// A base frame is `base_sample_size` payload bytes spanning `base_time_ms`
/// milliseconds and `clock_rate` timestamp units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizerCodec {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub base_sample_size: usize,
    pub base_time_ms: u32,
}

impl Default for ResizerCodec {
    /// G.729: 10 bytes and 80 timestamp units per 10 ms frame
    fn default() -> Self {
        Self {
            payload_type: 18,
            clock_rate: 80,
            base_sample_size: 10,
            base_time_ms: 10,
        }
    }
}

impl ResizerCodec {
    /// PCMU at 8 kHz in 20 ms frames
    pub fn pcmu() -> Self {
        Self {
            payload_type: 0,
            clock_rate: 160,
            base_sample_size: 160,
            base_time_ms: 20,
        }
    }
}

/// Configuration for the relay manager and the sessions it creates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// First port of the relay window (even)
    pub port_base: u16,
    /// Last port of the relay window
    pub port_max: u16,
    /// Ceiling on concurrent relay sessions
    pub session_max: usize,
    /// Period of the inactivity sweep
    #[serde(with = "duration_secs")]
    pub housekeeping_interval: Duration,
    /// Silence after which a relay pair is considered inactive
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    /// How long an offer may wait on an authentication challenge
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,
    /// Port tuples tried before giving up on a session
    pub bind_retry: usize,
    /// DSCP code point for relayed packets (46 = EF)
    pub dscp: u8,
    /// Two byte obfuscation key
    pub xor_key: String,
    /// Framing used by the resizer
    pub codec: ResizerCodec,
    /// Always relay media even between public endpoints
    pub force_create: bool,
    /// Keep per-route session counters
    pub count_sessions: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_base: 30000,
            port_max: 60000,
            session_max: 1000,
            housekeeping_interval: Duration::from_secs(5),
            read_timeout: Duration::from_secs(300),
            auth_timeout: Duration::from_secs(60),
            bind_retry: 10,
            dscp: 46,
            xor_key: DEFAULT_XOR_KEY.to_string(),
            codec: ResizerCodec::default(),
            force_create: false,
            count_sessions: false,
        }
    }
}

impl RelayConfig {
    /// TOS byte derived from the DSCP code point
    pub fn tos(&self) -> u32 {
        (self.dscp as u32) << 2
    }
}

/// Serde adapter storing a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
