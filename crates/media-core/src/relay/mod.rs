//! UDP relay primitives
//!
//! A [`RelayPair`] bridges two sockets for one media class. A [`RelayTuple`]
//! groups the data (RTP) and control (RTCP) pairs of one media stream.

pub mod pair;
pub mod tuple;

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

pub use pair::{PairOptions, PairState, PairStats, RelayPair};
pub use tuple::RelayTuple;

/// Media class carried by a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairKind {
    /// RTP; eligible for resizing
    Data,
    /// RTCP
    Control,
}

/// Leg index, 1 for the inbound (UAS) side and 2 for the outbound (UAC) side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    One,
    Two,
}

impl Leg {
    pub fn index(self) -> usize {
        match self {
            Leg::One => 0,
            Leg::Two => 1,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Leg::One => 1,
            Leg::Two => 2,
        }
    }

    pub fn other(self) -> Leg {
        match self {
            Leg::One => Leg::Two,
            Leg::Two => Leg::One,
        }
    }
}

/// Local listening address of a leg plus the address advertised in SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegAddress {
    pub local: SocketAddr,
    /// NAT mapped address peers should send to, when it differs from `local`
    pub external: Option<IpAddr>,
}

impl LegAddress {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            external: None,
        }
    }

    pub fn with_external(mut self, external: Option<IpAddr>) -> Self {
        self.external = external;
        self
    }

    /// Address to write into SDP
    pub fn advertised_ip(&self) -> IpAddr {
        self.external.unwrap_or_else(|| self.local.ip())
    }

    pub fn port(&self) -> u16 {
        self.local.port()
    }
}

/// A listening interface as handed over by the signalling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<IpAddr>,
}

impl Interface {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip, external: None }
    }

    pub fn with_external(mut self, external: IpAddr) -> Self {
        self.external = Some(external);
        self
    }

    pub fn at_port(&self, port: u16) -> LegAddress {
        LegAddress::new(SocketAddr::new(self.ip, port)).with_external(self.external)
    }
}
