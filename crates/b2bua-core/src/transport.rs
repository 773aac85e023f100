//! Transport seams
//!
//! The wire transport layer lives outside this crate. Transactions talk to it
//! through two traits: [`ClientTransport`] sends requests toward the next hop
//! and hands back a stream of responses, [`ServerResponder`] delivers responses
//! to whoever sent the inbound request.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{B2bError, Result};
use crate::message::SipMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl Transport {
    /// Transports in SRV preference order
    pub const SRV_ORDER: [Transport; 4] = [Transport::Udp, Transport::Tcp, Transport::Tls, Transport::Ws];

    pub fn default_port(self) -> u16 {
        match self {
            Transport::Tls => 5061,
            _ => 5060,
        }
    }

    /// SRV owner name for `host`, e.g. `_sip._udp.example.com`
    pub fn srv_name(self, host: &str) -> String {
        format!("_sip._{}.{}", self.as_str(), host)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ws => "ws",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for Transport {
    type Err = B2bError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "ws" | "wss" => Ok(Transport::Ws),
            other => Err(B2bError::protocol(format!("unknown transport {other}"))),
        }
    }
}

/// One end of a signalling flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: Transport,
    /// Connection identifier reused for mid-dialog requests
    pub id: String,
    /// Address advertised instead of `local` when behind NAT
    #[serde(default)]
    pub external: Option<IpAddr>,
    /// Peer speaks the XOR obfuscated signalling variant
    #[serde(default)]
    pub xor: bool,
}

impl TransportInfo {
    pub fn new(local: SocketAddr, remote: SocketAddr, transport: Transport) -> Self {
        Self {
            local,
            remote,
            transport,
            id: String::new(),
            external: None,
            xor: false,
        }
    }

    /// Local address as advertised to the peer
    pub fn advertised(&self) -> SocketAddr {
        SocketAddr::new(self.external.unwrap_or(self.local.ip()), self.local.port())
    }
}

/// Where and how a client request leaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRoute {
    pub local: SocketAddr,
    pub target: SocketAddr,
    pub transport: Transport,
    /// Existing connection to reuse, if any
    pub transport_id: Option<String>,
    pub xor: bool,
}

/// A request in flight: the flow it went out on and the responses coming back
#[derive(Debug)]
pub struct ClientFlow {
    pub info: TransportInfo,
    pub responses: mpsc::Receiver<SipMessage>,
}

#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send `request` along `route`.
    ///
    /// Responses for this attempt arrive on the returned flow. A closed
    /// response channel is treated as a transport failure.
    async fn send_request(&self, request: &SipMessage, route: &OutboundRoute) -> Result<ClientFlow>;

    /// Whether `addr` is one of our listeners
    fn is_local_interface(&self, _addr: &SocketAddr) -> bool {
        true
    }

    /// Listener behind an advertised (possibly NAT mapped) address
    fn internal_address(&self, advertised: SocketAddr) -> SocketAddr {
        advertised
    }

    /// Address advertised for the listener at `local`, when NAT mapped
    fn external_address(&self, _local: &SocketAddr) -> Option<IpAddr> {
        None
    }
}

#[async_trait]
pub trait ServerResponder: Send + Sync {
    async fn send_response(&self, response: &SipMessage) -> Result<()>;
}
