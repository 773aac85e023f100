//! Mid-dialog routing
//!
//! A request inside an established dialog is rebuilt from the stored state of
//! the other leg: request-URI from the remote contact, From/To/Call-ID/Contact
//! from the leg, Route from the route set. The next hop is, in order, the top
//! route, the remote contact host, and finally the address the leg last
//! signalled from when nothing resolves or a private address is reached over
//! UDP.

use std::net::SocketAddr;

use sbc_media_core::Leg;
use sbc_media_core::sdp::is_private;
use tracing::{debug, info, warn};

use super::store::DialogStore;
use super::LegInfo;
use super::retransmit::{RetransmitCache, cache_key};
use crate::contact;
use crate::error::{B2bError, Result};
use crate::message::{DEFAULT_MAX_FORWARDS, SipMessage, SipUri, uri_of};
use crate::resolver::Resolver;
use crate::transaction::{B2bTransaction, ForwardTarget, RouteOutcome, props};
use crate::transport::{ClientTransport, Transport};

/// Where a rewritten ACK goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRoute {
    pub session_id: String,
    pub sender: Leg,
    pub target_leg: Leg,
    pub local: SocketAddr,
    pub target: SocketAddr,
    pub transport: Transport,
    pub transport_id: Option<String>,
    /// Target leg is XOR obfuscated
    pub xor: bool,
    pub has_sdp: bool,
}

fn parse_transport(value: &str) -> Transport {
    value.parse().unwrap_or_default()
}

async fn resolve_uri(resolver: &dyn Resolver, uri: &SipUri) -> Option<(SocketAddr, Option<Transport>)> {
    let address = resolver.lookup_host(&uri.host).await.into_iter().next()?;
    let transport = if uri.is_secure() { Some(Transport::Tls) } else { uri.transport() };
    let port = uri.port.unwrap_or(transport.unwrap_or_default().default_port());
    Some((SocketAddr::new(address, port), transport))
}

/// Emit the route set of `leg` and resolve the top route.
///
/// A strict router at the top takes the request-URI; the remote contact then
/// takes its place at the bottom of the emitted set.
async fn encode_route_set(
    leg: &LegInfo,
    method: &str,
    remote_contact: &str,
    request: &mut SipMessage,
    resolver: &dyn Resolver,
) -> Option<(SocketAddr, Option<Transport>)> {
    let mut routes = leg.route_set.clone();
    let top = routes.last()?.clone();
    let top_uri = uri_of(&top).to_string();
    if !top.contains(";lr") {
        request.set_request_line(method, top_uri.clone());
        if let Some(last) = routes.last_mut() {
            *last = format!("<{}>", remote_contact);
        }
    }
    for route in routes.iter().rev() {
        request.add_header("Route", route.clone());
    }

    let uri = SipUri::parse(&top_uri).ok()?;
    resolve_uri(resolver, &uri).await
}

struct Rewritten {
    target: Option<SocketAddr>,
    transport: Transport,
}

/// Shared header rewrite of mid-dialog requests and ACKs
async fn rewrite_toward(
    request: &mut SipMessage,
    method: &str,
    leg: &LegInfo,
    resolver: &dyn Resolver,
) -> Rewritten {
    let remote_contact = uri_of(&leg.remote_contact).to_string();
    for name in ["call-id", "from", "to", "contact", "via", "route", "record-route"] {
        request.remove_header(name);
    }
    request.set_request_line(method, remote_contact.clone());
    request.set_header("From", leg.from.clone());
    request.set_header("To", leg.to.clone());
    request.set_header("Contact", leg.local_contact.clone());
    request.set_header("Call-ID", leg.call_id.clone());
    if !leg.local_record_route.is_empty() {
        request.set_header("Record-Route", leg.local_record_route.clone());
    }

    let mut transport = parse_transport(&leg.target_transport);
    let mut target = None;
    if let Some((address, scheme)) = encode_route_set(leg, method, &remote_contact, request, resolver).await {
        target = Some(address);
        transport = scheme.unwrap_or(transport);
    }

    if target.is_none() && transport != Transport::Ws {
        if let Ok(uri) = SipUri::parse(&remote_contact) {
            if let Some((address, scheme)) = resolve_uri(resolver, &uri).await {
                debug!(host = %uri.host, %address, "Setting target from contact address");
                target = Some(address);
                transport = scheme.unwrap_or(transport);
            }
        }
    }

    let unusable = match target {
        None => true,
        Some(address) => is_private(&address.ip()) && transport == Transport::Udp,
    };
    if unusable {
        if let Ok(remote) = leg.remote_ip.parse::<SocketAddr>() {
            info!(%remote, "Setting target from source address");
            target = Some(remote);
        }
    }

    Rewritten { target, transport }
}

/// Host and port of a stored contact
fn contact_address(value: &str) -> Option<SocketAddr> {
    let uri = SipUri::parse(uri_of(value)).ok()?;
    Some(SocketAddr::new(uri.ip()?, uri.port.unwrap_or(5060)))
}

impl DialogStore {
    /// Rewrite a mid-dialog request toward the other leg of its dialog
    pub async fn route_mid_dialog(
        &self,
        request: &mut SipMessage,
        tx: &B2bTransaction,
        resolver: &dyn Resolver,
        client: &dyn ClientTransport,
        user_agent: Option<&str>,
    ) -> RouteOutcome {
        let respond = |status, reason| RouteOutcome::Respond(tx.server_request().create_response(status, reason));

        let Some(branch) = request.top_via_branch() else {
            return respond(400, "Missing Via Branch Parameter");
        };
        let Some(request_uri) = request.request_uri().and_then(|uri| SipUri::parse(uri).ok()) else {
            return respond(400, "Bad Request URI");
        };
        let Some(method) = request.method().map(str::to_string) else {
            return respond(400, "Bad Request URI");
        };

        let Some(matched) = self.find_dialog_with_legs(request) else {
            return respond(481, "Unable to match dialog");
        };
        let session_id = matched.session_id;
        let call_id = request.call_id().unwrap_or_default().to_string();

        tx.set_property(props::LEG_IDENTIFIER, request_uri.user.clone().unwrap_or_default());
        tx.set_property(props::LEG_INDEX, matched.sender.number().to_string());
        tx.set_property(props::SESSION_ID, session_id.clone());

        // the CSeq bump is decided under the store lock
        let requested = request.cseq().map(|(number, _)| number).unwrap_or_default();
        let mut cseq = 0;
        let updated = self.modify(&call_id, &session_id, |dialog| {
            let leg = dialog.leg_mut(matched.target);
            cseq = if requested > leg.local_cseq {
                requested
            } else {
                leg.local_cseq + 1
            };
            leg.local_cseq = cseq;
        });
        let Some(dialog) = updated else {
            return respond(481, "Unable to match dialog");
        };
        self.persist(&dialog);

        let leg = dialog.leg(matched.target).clone();
        if leg.no_rtp_proxy {
            tx.set_property(props::NO_RTP_PROXY, "1");
        }
        if leg.xor_encrypted {
            tx.set_property(props::XOR, "1");
        }

        request.remove_header("cseq");
        let rewritten = rewrite_toward(request, &method, &leg, resolver).await;
        request.set_header("CSeq", format!("{} {}", cseq, method));

        let Some(sent_by) = contact_address(&leg.local_contact) else {
            return respond(481, "Unable to determine dialog target");
        };
        let local = client.internal_address(sent_by);
        request.prepend_header("Via", contact::construct_via(rewritten.transport, sent_by, &branch));
        if let Some(agent) = user_agent {
            request.set_header("User-Agent", agent);
        }

        tx.set_property(props::TARGET_TRANSPORT, rewritten.transport.as_str());
        tx.set_property(props::TRANSPORT_ID, leg.transport_id.clone());
        debug!(
            "{}Target transport identifier set by dialog data: transport-id={}",
            tx.log_id(),
            leg.transport_id
        );

        let Some(target) = rewritten.target else {
            return respond(481, "Unable to determine dialog target");
        };
        tx.set_property(props::TARGET_PORT, target.port().to_string());

        RouteOutcome::Forward(ForwardTarget {
            local,
            target: Some(target),
            transport: Some(rewritten.transport),
            transport_id: (!leg.transport_id.is_empty()).then(|| leg.transport_id.clone()),
        })
    }

    /// Rewrite an ACK for a 2xx toward the other leg.
    ///
    /// The branch comes from the 2xx the far leg sent, which must still be in
    /// `retransmits`.
    pub async fn route_ack(
        &self,
        request: &mut SipMessage,
        retransmits: &RetransmitCache,
        resolver: &dyn Resolver,
        client: &dyn ClientTransport,
        user_agent: Option<&str>,
    ) -> Result<AckRoute> {
        if !request.is_method("ACK") {
            return Err(B2bError::protocol("non-ACK request fed to route_ack"));
        }
        let call_id = request.call_id().unwrap_or_default().to_string();

        let max_forwards = request.max_forwards().unwrap_or(DEFAULT_MAX_FORWARDS);
        if max_forwards <= 1 {
            return Err(B2bError::MaxForwardsExceeded);
        }
        request.set_header("Max-Forwards", (max_forwards - 1).to_string());

        let Some(matched) = self.find_dialog_with_legs(request) else {
            debug!(call_id, "No dialog data found for ACK request");
            return Err(B2bError::NoDialogExists(call_id));
        };
        let leg = matched.dialog.leg(matched.target).clone();
        debug!(
            session_id = %matched.session_id,
            target_leg = matched.target.number(),
            contact = %leg.remote_contact,
            "Found dialog data for ACK request"
        );

        let rewritten = rewrite_toward(request, "ACK", &leg, resolver).await;
        if leg.local_cseq > 0 {
            request.set_header("CSeq", format!("{} ACK", leg.local_cseq));
        }
        let target = rewritten
            .target
            .ok_or_else(|| B2bError::unresolvable(leg.remote_contact.clone()))?;

        let key = cache_key(request).ok_or_else(|| B2bError::MissingBranch(call_id.clone()))?;
        let Some(ok) = retransmits.get(&key) else {
            warn!(call_id, key, "Unable to find 2xx in retransmission cache");
            return Err(B2bError::MissingBranch(call_id));
        };
        let Some(branch) = ok.top_via_branch() else {
            warn!(call_id, "Cached 2xx has no Via branch");
            return Err(B2bError::MissingBranch(call_id));
        };

        let sent_by = contact_address(&leg.local_contact)
            .ok_or_else(|| B2bError::protocol("stored local contact has no address"))?;
        request.prepend_header("Via", contact::construct_via(rewritten.transport, sent_by, &branch));
        if let Some(agent) = user_agent {
            request.set_header("User-Agent", agent);
        }
        let local = client.internal_address(sent_by);

        let has_sdp = request.has_sdp();
        if has_sdp {
            let sdp = request.body().to_string();
            let updated = self.modify(&call_id, &matched.session_id, |dialog| {
                dialog.leg_mut(matched.sender).remote_sdp = sdp.clone();
                dialog.leg_mut(matched.target).local_sdp = sdp;
            });
            if let Some(dialog) = updated {
                self.persist(&dialog);
            }
        }

        info!(
            session_id = %matched.session_id,
            src = %local,
            dst = %target,
            enc = leg.xor_encrypted,
            prot = %rewritten.transport,
            ">>> ACK {}",
            request.request_uri().unwrap_or("")
        );

        Ok(AckRoute {
            session_id: matched.session_id,
            sender: matched.sender,
            target_leg: matched.target,
            local,
            target,
            transport: rewritten.transport,
            transport_id: (!leg.transport_id.is_empty()).then(|| leg.transport_id.clone()),
            xor: leg.xor_encrypted,
            has_sdp,
        })
    }
}
