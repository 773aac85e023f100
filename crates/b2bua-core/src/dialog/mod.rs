//! Cross-leg dialog correlation
//!
//! Every bridged call is one [`DialogData`] record holding the state of both
//! legs. Records are grouped by Call-ID in the [`DialogStore`] and mirrored to
//! a pluggable [`DialogPersistence`] backend so a restarted agent can keep
//! routing in-dialog requests.
//!
//! ## Components
//!
//! - `store`: the Call-ID keyed cache and its lookup heuristics
//! - `state`: capture of leg state from responses flowing through
//! - `router`: rewriting of mid-dialog requests and ACKs toward the other leg
//! - `persistence`: storage backend trait and the in-memory default
//! - `retransmit`: short lived cache of 2xx responses needed to route ACKs

pub mod persistence;
pub mod retransmit;
pub mod router;
pub mod state;
pub mod store;

use chrono::{DateTime, Utc};
use sbc_media_core::Leg;
use serde::{Deserialize, Serialize};

pub use persistence::{DialogPersistence, InMemoryStore, RegData};
pub use retransmit::RetransmitCache;
pub use router::AckRoute;
pub use store::{DialogMatch, DialogStore};

/// State of one side of a bridged call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegInfo {
    pub call_id: String,
    /// Our side of the dialog on this leg
    pub from: String,
    /// The peer's side of the dialog on this leg
    pub to: String,
    pub remote_contact: String,
    pub local_contact: String,
    pub local_record_route: String,
    /// Last known signalling source, `ip:port`
    pub remote_ip: String,
    pub transport_id: String,
    pub target_transport: String,
    pub local_sdp: String,
    pub remote_sdp: String,
    /// Route set with the top route last
    pub route_set: Vec<String>,
    pub xor_encrypted: bool,
    pub no_rtp_proxy: bool,
    pub local_cseq: u32,
}

/// Both legs of one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogData {
    pub session_id: String,
    pub leg1: LegInfo,
    pub leg2: LegInfo,
    /// When the record was last written
    pub session_age: DateTime<Utc>,
}

impl DialogData {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_age: Utc::now(),
            ..Default::default()
        }
    }

    pub fn leg(&self, leg: Leg) -> &LegInfo {
        match leg {
            Leg::One => &self.leg1,
            Leg::Two => &self.leg2,
        }
    }

    pub fn leg_mut(&mut self, leg: Leg) -> &mut LegInfo {
        match leg {
            Leg::One => &mut self.leg1,
            Leg::Two => &mut self.leg2,
        }
    }

    /// Call-ID the record is filed under
    pub fn call_id(&self) -> &str {
        if self.leg1.call_id.is_empty() {
            &self.leg2.call_id
        } else {
            &self.leg1.call_id
        }
    }
}
