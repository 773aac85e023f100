//! Session contact convention
//!
//! The agent advertises `Contact: <sip:{session}-{leg}@{host}:{port}>` on both
//! legs. Mid-dialog requests then name their session and the leg they came
//! from in the request-URI user part. Peers that rewrite contacts can carry
//! the same information as `sbc-session-id`/`sbc-call-index` URI parameters,
//! either in the request-URI or in the top Route.

use std::net::SocketAddr;

use sbc_media_core::Leg;
use tracing::debug;

use crate::message::{SipMessage, SipUri};
use crate::transport::Transport;

pub const SESSION_ID_PARAM: &str = "sbc-session-id";
pub const CALL_INDEX_PARAM: &str = "sbc-call-index";

/// Session named by a mid-dialog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    /// Leg the request was sent on
    pub leg: Leg,
}

fn leg_from_index(index: &str) -> Option<Leg> {
    match index.trim() {
        "1" => Some(Leg::One),
        "2" => Some(Leg::Two),
        _ => None,
    }
}

fn from_params(uri: &SipUri) -> Option<SessionInfo> {
    let session_id = uri.param(SESSION_ID_PARAM)?;
    let leg = leg_from_index(uri.param(CALL_INDEX_PARAM)?)?;
    Some(SessionInfo {
        session_id: session_id.to_string(),
        leg,
    })
}

/// Recover the session from a request, removing a Route that carried it
pub fn session_info(request: &mut SipMessage) -> Option<SessionInfo> {
    let uri = SipUri::parse(request.request_uri()?).ok()?;
    if let Some(info) = from_params(&uri) {
        debug!(session_id = %info.session_id, "Session-ID in Params");
        return Some(info);
    }

    if let Some(top_route) = request.header_list("route").into_iter().next() {
        if let Some(info) = SipUri::parse(&top_route).ok().as_ref().and_then(from_params) {
            request.remove_header("route");
            debug!(session_id = %info.session_id, "Session-ID in Route Header");
            return Some(info);
        }
        return None;
    }

    let user = uri.user?;
    let tokens: Vec<&str> = user.split('-').collect();
    if tokens.len() == 2 && tokens[1].len() == 1 {
        let leg = leg_from_index(tokens[1])?;
        debug!(session_id = tokens[0], "Session-ID in User Info");
        return Some(SessionInfo {
            session_id: tokens[0].to_string(),
            leg,
        });
    }
    None
}

/// Contact value advertised to the peer on `leg`
pub fn session_contact(session_id: &str, leg: Leg, local: SocketAddr) -> String {
    format!("<sip:{}-{}@{}>", session_id, leg.number(), local)
}

/// Via header value the agent inserts on an outbound request
pub fn construct_via(transport: Transport, sent_by: SocketAddr, branch: &str) -> String {
    format!("SIP/2.0/{} {};branch={};rport", transport, sent_by, branch)
}

/// Replace the Contact of `message` with the session contact
pub fn transform(message: &mut SipMessage, session_id: &str, leg: Leg, local: SocketAddr) {
    message.set_header("Contact", session_contact(session_id, leg, local));
}
