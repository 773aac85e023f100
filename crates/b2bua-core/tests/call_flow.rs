//! A full call through the engine: INVITE, 180, 200, ACK and BYE
//!
//! Media is anchored on the relay for real, so these tests bind UDP ports and
//! run one at a time.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serial_test::serial;

use sbc_b2bua_core::message::uri_of;
use sbc_b2bua_core::{B2bEngine, EngineConfig, SipMessage, StaticResolver, Transport, TransportInfo};
use sbc_media_core::{MediaKind, RelayConfig, ResizerCodec, Sdp};

use common::{MockNetwork, Peer, Responses, caller_flow, engine, invite, sdp};

const PORT_BASE: u16 = 45000;
const PORT_MAX: u16 = 45999;
const CALLEE: &str = "127.0.0.1:5070";

fn relay() -> RelayConfig {
    RelayConfig {
        port_base: PORT_BASE,
        port_max: PORT_MAX,
        codec: ResizerCodec::pcmu(),
        force_create: true,
        ..RelayConfig::default()
    }
}

fn callee_flow() -> TransportInfo {
    TransportInfo::new(common::ENGINE_LOCAL.parse().unwrap(), CALLEE.parse().unwrap(), Transport::Udp)
}

fn relay_port(message: &SipMessage) -> u16 {
    Sdp::parse(message.body()).unwrap().media_port(MediaKind::Audio).unwrap()
}

struct Call {
    engine: Arc<B2bEngine>,
    network: Arc<MockNetwork>,
    /// Final response the caller received
    answer: SipMessage,
    /// INVITE as the callee received it
    forwarded: SipMessage,
}

async fn establish(call_id: &str) -> Call {
    let network = MockNetwork::new();
    network.peer(
        CALLEE,
        Peer::Answer(vec![100, 180, 200], Some(sdp("callee", "127.0.0.1", 47000))),
    );
    network.peer("127.0.0.1:5062", Peer::Answer(vec![200], None));
    let engine = engine(EngineConfig::default(), relay(), network.clone(), Arc::new(StaticResolver::new()));

    let responses = Responses::new();
    let offer = sdp("caller", "127.0.0.1", 46000);
    engine
        .handle_request(
            invite(call_id, &format!("sip:bob@{CALLEE}"), Some(offer.as_str())),
            caller_flow(),
            responses.clone(),
        )
        .unwrap()
        .await
        .unwrap();

    assert_eq!(responses.statuses(), vec![180, 200]);
    let answer = responses.last().unwrap();
    let forwarded = network.sent_with_method("INVITE").pop().unwrap().0;
    Call {
        engine,
        network,
        answer,
        forwarded,
    }
}

#[tokio::test]
#[serial]
async fn test_invite_is_bridged_through_the_relay() {
    println!("🧪 Testing INVITE bridging");
    let call = establish("flow-1").await;

    let contact = call.answer.header("contact").unwrap();
    assert!(contact.ends_with("-1@127.0.0.1:5060>"), "{contact}");
    assert_eq!(call.answer.top_via_branch().as_deref(), Some("z9hG4bKcaller1"));
    assert_eq!(call.answer.to_tag().as_deref(), Some("b2"));

    let leg2_contact = call.forwarded.header("contact").unwrap();
    assert!(leg2_contact.ends_with("-2@127.0.0.1:5080>"), "{leg2_contact}");
    assert_eq!(call.forwarded.header("max-forwards"), Some("69"));
    assert_eq!(call.forwarded.call_id(), Some("flow-1"));

    for port in [relay_port(&call.answer), relay_port(&call.forwarded)] {
        assert!((PORT_BASE..=PORT_MAX).contains(&port), "port {port} outside relay range");
    }
    assert_eq!(call.engine.relay().session_count(), 1);
    assert!(call.engine.dialogs().has_dialog("flow-1"));
    assert_eq!(call.engine.transaction_count(), 0);
    println!("✅ Both legs see the relay");
}

#[tokio::test]
#[serial]
async fn test_ack_and_bye_follow_the_dialog() {
    println!("🧪 Testing ACK and BYE routing");
    let call = establish("flow-2").await;
    let to = call.answer.header("to").unwrap().to_string();

    let mut ack = SipMessage::new_request("ACK", uri_of(call.answer.header("contact").unwrap()));
    ack.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bKack1");
    ack.add_header("Max-Forwards", "70");
    ack.add_header("From", "<sip:alice@example.org>;tag=a1");
    ack.add_header("To", to.clone());
    ack.add_header("Call-ID", "flow-2");
    ack.add_header("CSeq", "1 ACK");
    call.engine
        .handle_request(ack, caller_flow(), Responses::new())
        .unwrap()
        .await
        .unwrap();

    let (sent_ack, route) = call.network.sent_with_method("ACK").pop().unwrap();
    assert_eq!(route.target.to_string(), CALLEE);
    assert_eq!(sent_ack.request_uri(), Some("sip:bob@127.0.0.1:5070"));
    assert_eq!(sent_ack.top_via_branch(), call.forwarded.top_via_branch());
    assert_eq!(sent_ack.header("cseq"), Some("1 ACK"));

    let mut bye = SipMessage::new_request("BYE", uri_of(call.forwarded.header("contact").unwrap()));
    bye.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKbye1");
    bye.add_header("Max-Forwards", "70");
    bye.add_header("From", to);
    bye.add_header("To", "<sip:alice@example.org>;tag=a1");
    bye.add_header("Call-ID", "flow-2");
    bye.add_header("CSeq", "1 BYE");
    let responses = Responses::new();
    call.engine
        .handle_request(bye, callee_flow(), responses.clone())
        .unwrap()
        .await
        .unwrap();

    assert_eq!(responses.statuses(), vec![200]);
    let (sent_bye, route) = call.network.sent_with_method("BYE").pop().unwrap();
    assert_eq!(route.target.to_string(), "127.0.0.1:5062");
    assert_eq!(route.local.to_string(), "127.0.0.1:5060");
    assert_eq!(sent_bye.request_uri(), Some("sip:alice@127.0.0.1:5062"));
    assert_eq!(sent_bye.top_via_branch().as_deref(), Some("z9hG4bKbye1"));
    assert_eq!(sent_bye.from_tag().as_deref(), Some("b2"));

    assert_eq!(call.engine.relay().session_count(), 0);
    assert!(!call.engine.dialogs().has_dialog("flow-2"));
    println!("✅ Call torn down");
}

#[tokio::test]
#[serial]
async fn test_retransmitted_invite_is_absorbed() {
    let network = MockNetwork::new();
    let engine = engine(EngineConfig::default(), relay(), network.clone(), Arc::new(StaticResolver::new()));

    let first = engine.handle_request(
        invite("flow-3", "sip:bob@192.0.2.44:5060", None),
        caller_flow(),
        Responses::new(),
    );
    let second = engine.handle_request(
        invite("flow-3", "sip:bob@192.0.2.44:5060", None),
        caller_flow(),
        Responses::new(),
    );
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(engine.transaction_count(), 1);
    first.unwrap().abort();
}
