//! Shared fixtures for the engine tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use sbc_b2bua_core::{
    B2bEngine, B2bError, ClientFlow, ClientTransport, DialogStore, EngineConfig, OutboundRoute, RequestUriPolicy,
    Resolver, Result, ServerResponder, SipMessage, Transport, TransportInfo,
};
use sbc_media_core::{RelayConfig, RelayManager};

/// How a mocked next hop reacts to a request
#[derive(Debug, Clone)]
pub enum Peer {
    /// Accepts the request and never answers
    Silent,
    /// Refuses the connection
    Unreachable,
    /// Answers with these statuses, SDP attached to the 2xx when given
    Answer(Vec<u16>, Option<String>),
}

/// Client transport driving scripted peers
#[derive(Default)]
pub struct MockNetwork {
    peers: Mutex<HashMap<SocketAddr, Peer>>,
    sent: Mutex<Vec<(SipMessage, OutboundRoute)>>,
    /// Keeps the channels of silent peers open
    parked: Mutex<Vec<mpsc::Sender<SipMessage>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer(&self, address: &str, peer: Peer) {
        self.peers.lock().insert(address.parse().unwrap(), peer);
    }

    pub fn sent(&self) -> Vec<(SipMessage, OutboundRoute)> {
        self.sent.lock().clone()
    }

    pub fn sent_with_method(&self, method: &str) -> Vec<(SipMessage, OutboundRoute)> {
        self.sent().into_iter().filter(|(m, _)| m.is_method(method)).collect()
    }
}

#[async_trait]
impl ClientTransport for MockNetwork {
    async fn send_request(&self, request: &SipMessage, route: &OutboundRoute) -> Result<ClientFlow> {
        self.sent.lock().push((request.clone(), route.clone()));
        let peer = self.peers.lock().get(&route.target).cloned().unwrap_or(Peer::Silent);

        let (tx, rx) = mpsc::channel(16);
        match peer {
            Peer::Unreachable => return Err(B2bError::transport(format!("connection refused by {}", route.target))),
            Peer::Silent => self.parked.lock().push(tx),
            Peer::Answer(statuses, sdp) => {
                if !request.is_method("ACK") {
                    for status in statuses {
                        let mut response = request.create_response(status, "Scripted");
                        if let Some(to) = request.header("to") {
                            if !to.contains(";tag=") {
                                response.set_header("To", format!("{};tag=b2", to));
                            }
                        }
                        response.set_header("Contact", format!("<sip:bob@{}>", route.target));
                        if (200..300).contains(&status) {
                            if let Some(sdp) = &sdp {
                                response.set_header("Content-Type", "application/sdp");
                                response.set_body(sdp.clone());
                            }
                        }
                        let _ = tx.try_send(response);
                    }
                }
            }
        }

        let mut info = TransportInfo::new(route.local, route.target, route.transport);
        info.id = route.transport_id.clone().unwrap_or_default();
        Ok(ClientFlow { info, responses: rx })
    }
}

/// Responses delivered to the server side
#[derive(Default)]
pub struct Responses(Mutex<Vec<SipMessage>>);

impl Responses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<SipMessage> {
        self.0.lock().clone()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.0.lock().iter().filter_map(|r| r.status()).collect()
    }

    pub fn last(&self) -> Option<SipMessage> {
        self.0.lock().last().cloned()
    }
}

#[async_trait]
impl ServerResponder for Responses {
    async fn send_response(&self, response: &SipMessage) -> Result<()> {
        self.0.lock().push(response.clone());
        Ok(())
    }
}

pub const ENGINE_LOCAL: &str = "127.0.0.1:5080";

pub fn engine(
    config: EngineConfig,
    relay: RelayConfig,
    network: Arc<MockNetwork>,
    resolver: Arc<dyn Resolver>,
) -> Arc<B2bEngine> {
    let dialogs = Arc::new(DialogStore::with_memory_store(config.dialog_lifetime));
    engine_with_store(config, relay, dialogs, network, resolver)
}

pub fn engine_with_store(
    config: EngineConfig,
    relay: RelayConfig,
    dialogs: Arc<DialogStore>,
    network: Arc<MockNetwork>,
    resolver: Arc<dyn Resolver>,
) -> Arc<B2bEngine> {
    B2bEngine::new(
        config,
        Arc::new(RelayManager::new(relay)),
        dialogs,
        network,
        resolver,
        Arc::new(RequestUriPolicy::new(ENGINE_LOCAL.parse().unwrap())),
    )
}

/// Flow the caller's requests arrive on
pub fn caller_flow() -> TransportInfo {
    let mut info = TransportInfo::new(
        "127.0.0.1:5060".parse().unwrap(),
        "127.0.0.1:5062".parse().unwrap(),
        Transport::Udp,
    );
    info.id = "caller-flow".to_string();
    info
}

pub fn invite(call_id: &str, uri: &str, sdp: Option<&str>) -> SipMessage {
    let mut msg = SipMessage::new_request("INVITE", uri);
    msg.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bKcaller1");
    msg.add_header("Max-Forwards", "70");
    msg.add_header("From", "<sip:alice@example.org>;tag=a1");
    msg.add_header("To", format!("<{}>", uri));
    msg.add_header("Call-ID", call_id);
    msg.add_header("CSeq", "1 INVITE");
    msg.add_header("Contact", "<sip:alice@127.0.0.1:5062>");
    if let Some(sdp) = sdp {
        msg.add_header("Content-Type", "application/sdp");
        msg.set_body(sdp);
    }
    msg
}

pub fn sdp(origin: &str, ip: &str, port: u16) -> String {
    format!(
        "v=0\r\no=- {origin} 1 IN IP4 {ip}\r\ns=call\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n"
    )
}
