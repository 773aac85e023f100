//! # SBC B2BUA Core
//!
//! Back-to-back user agent of the session border controller. Every call is
//! split into two dialogs, leg 1 toward the caller and leg 2 toward the
//! callee, and the agent rewrites signalling between them while the media
//! relay of `sbc-media-core` anchors the RTP.
//!
//! ## Architecture
//!
//! - `message`: SIP message model and the header helpers the agent needs
//! - `transport`: seams to the wire transport ([`ClientTransport`], [`ServerResponder`])
//! - `resolver`: SRV/A resolution of request targets
//! - `transaction`: one [`B2bTransaction`] per inbound request, with failover
//! - `dialog`: dialog cache, persistence, state capture and mid-dialog routing
//! - `contact`: the session contact convention linking requests to sessions
//! - `engine`: [`B2bEngine`], wiring all of the above to the media relay
//! - `config`: TOML configuration of the whole process

pub mod config;
pub mod contact;
pub mod dialog;
pub mod engine;
pub mod error;
pub mod message;
pub mod resolver;
pub mod transaction;
pub mod transport;

pub use config::{EngineConfig, SbcConfig};
pub use dialog::{AckRoute, DialogData, DialogPersistence, DialogStore, InMemoryStore, LegInfo, RetransmitCache};
pub use engine::{B2bEngine, RequestUriPolicy, RoutePolicy};
pub use error::{B2bError, Result};
pub use message::{SipMessage, SipUri};
pub use resolver::{Resolver, StaticResolver, SystemResolver};
pub use transaction::{B2bTransaction, ForwardTarget, RouteOutcome, TransactionContext, TransactionHooks};
pub use transport::{ClientFlow, ClientTransport, OutboundRoute, ServerResponder, Transport, TransportInfo};
