//! # SBC Media Core
//!
//! RTP relay engine of the session border controller. Media for every call is
//! anchored on local UDP sockets so both peers talk to the border element
//! rather than to each other.
//!
//! ## Architecture
//!
//! - `packet`: RTP header codec over the raw datagram
//! - `xor`: two byte stream obfuscation
//! - `resizer`: re-packetization queue and its pacing task
//! - `relay`: socket pairs ([`RelayPair`]) and data/control tuples
//! - `sdp`: the SDP lines the relay reads and rewrites
//! - `session`: per-call offer/answer state machine ([`RelaySession`])
//! - `manager`: session registry, port allocation and housekeeping
//! - `rpc`: JSON dispatcher exposing the manager to other processes

pub mod config;
pub mod error;
pub mod manager;
pub mod packet;
pub mod ports;
pub mod relay;
pub mod resizer;
pub mod rpc;
pub mod sdp;
pub mod session;
pub mod xor;

pub use config::{RelayConfig, ResizerCodec};
pub use error::{MediaError, Result};
pub use manager::{RelayManager, SessionHandle};
pub use packet::RtpPacket;
pub use ports::PortAllocator;
pub use relay::{Interface, Leg, LegAddress, PairKind, PairState, RelayPair, RelayTuple};
pub use resizer::{ResizeQueue, Resizer};
pub use rpc::RpcDispatcher;
pub use sdp::{MediaKind, Sdp};
pub use session::{NegotiationState, RelaySession, RequestType, SdpAttributes, SignalingAddresses};
pub use xor::XorCipher;
