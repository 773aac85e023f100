//! End-to-end tests for SDP driven relay sessions
//!
//! Drives the relay manager the way the signalling layer does and checks that
//! media actually flows through the allocated sockets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serial_test::serial;
use tokio::net::UdpSocket;
use tokio_test::assert_ok;

use sbc_media_core::{
    Interface, Leg, MediaKind, RelayConfig, RelayManager, RequestType, ResizerCodec, RtpPacket, Sdp, SdpAttributes,
    SignalingAddresses,
};

const PORT_BASE: u16 = 44000;
const PORT_MAX: u16 = 44999;

fn manager() -> Arc<RelayManager> {
    Arc::new(RelayManager::new(RelayConfig {
        port_base: PORT_BASE,
        port_max: PORT_MAX,
        codec: ResizerCodec::pcmu(),
        ..RelayConfig::default()
    }))
}

fn loopback() -> SignalingAddresses {
    let lo: IpAddr = "127.0.0.1".parse().unwrap();
    SignalingAddresses {
        sent_by: lo,
        packet_source: lo,
        packet_local_interface: Interface::new(lo),
        route: lo,
        route_local_interface: Interface::new(lo),
    }
}

fn sdp(origin: &str, ip: &str, port: u16) -> String {
    format!("v=0\r\no=- {origin} 1 IN IP4 {ip}\r\ns=call\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n")
}

fn forced() -> SdpAttributes {
    SdpAttributes {
        force_create: true,
        call_id: "call-1@example.com".to_string(),
        ..SdpAttributes::default()
    }
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for relayed media")
        .unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
#[serial]
async fn test_invite_offer_is_anchored_locally() {
    println!("🧪 Testing initial offer rewrite");
    let manager = manager();
    let before = manager.session_count();

    let mut offer = "v=0\r\no=caller 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\n".to_string();
    manager
        .handle_sdp("[CID=abc123] ", "abc123", &loopback(), RequestType::Invite, &mut offer, &forced())
        .unwrap();

    let rewritten = Sdp::parse(&offer).unwrap();
    let port = rewritten.media_port(MediaKind::Audio).unwrap();
    assert_eq!(port % 2, 0);
    assert!((PORT_BASE..=PORT_MAX).contains(&port));
    assert_eq!(rewritten.session_address(), Some("127.0.0.1".parse().unwrap()));
    assert_eq!(manager.session_count(), before + 1);

    // the same INVITE again finds the existing session
    let mut again = "v=0\r\no=caller 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\n".to_string();
    assert_ok!(manager.handle_sdp("[CID=abc123] ", "abc123", &loopback(), RequestType::Invite, &mut again, &forced()));
    assert_eq!(manager.session_count(), before + 1);

    manager.stop();
    println!("✅ Initial offer anchored on port {port}");
}

#[tokio::test]
#[serial]
async fn test_media_flows_after_answer() {
    let manager = manager();
    let addresses = loopback();

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let caller_port = caller.local_addr().unwrap().port();
    let callee_port = callee.local_addr().unwrap().port();

    // a private address other than the signalling source is relayed back to that source
    let mut offer = sdp("100", "127.0.0.2", caller_port);
    manager
        .handle_sdp("", "flow", &addresses, RequestType::Invite, &mut offer, &forced())
        .unwrap();
    let toward_leg2 = Sdp::parse(&offer).unwrap().media_port(MediaKind::Audio).unwrap();

    let mut answer = sdp("200", "127.0.0.1", callee_port);
    manager
        .handle_sdp("", "flow", &addresses, RequestType::InviteResponse, &mut answer, &forced())
        .unwrap();
    let toward_leg1 = Sdp::parse(&answer).unwrap().media_port(MediaKind::Audio).unwrap();
    assert_ne!(toward_leg1, toward_leg2);

    let packet = RtpPacket::new(0, 1, 160, 0xdead, &[0x7f; 160]);
    caller
        .send_to(packet.as_bytes(), SocketAddr::new("127.0.0.1".parse().unwrap(), toward_leg1))
        .await
        .unwrap();
    assert_eq!(recv(&callee).await, packet.as_bytes());

    let reply = RtpPacket::new(0, 9, 320, 0xbeef, &[0x11; 160]);
    callee
        .send_to(reply.as_bytes(), SocketAddr::new("127.0.0.1".parse().unwrap(), toward_leg2))
        .await
        .unwrap();
    assert_eq!(recv(&caller).await, reply.as_bytes());

    assert!(manager.remove_session("flow"));
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_resized_media_toward_leg2() {
    let manager = manager();
    let addresses = loopback();
    let attributes = SdpAttributes {
        resizer_samples_leg1: 20,
        resizer_samples_leg2: 40,
        ..SdpAttributes::default()
    };

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut offer = sdp("300", "127.0.0.2", caller.local_addr().unwrap().port());
    manager
        .handle_sdp("", "resize", &addresses, RequestType::Invite, &mut offer, &attributes)
        .unwrap();
    let mut answer = sdp("400", "127.0.0.1", callee.local_addr().unwrap().port());
    manager
        .handle_sdp("", "resize", &addresses, RequestType::InviteResponse, &mut answer, &attributes)
        .unwrap();

    let session = manager.find_session("resize").unwrap();
    let leg1 = session
        .lock()
        .tuple(MediaKind::Audio)
        .data_address(Leg::One)
        .unwrap()
        .local;

    // two 20 ms frames toward leg 2 come out as one 40 ms frame
    for seq in 0..2u16 {
        let frame = RtpPacket::new(0, 10 + seq, seq as u32 * 160, 1, &[seq as u8; 160]);
        caller.send_to(frame.as_bytes(), leg1).await.unwrap();
    }
    let combined = RtpPacket::parse(&recv(&callee).await).unwrap();
    assert_eq!(combined.payload_size(), 320);
    assert_eq!(combined.sequence_number(), 10);
    assert_eq!(&combined.payload()[..160], &[0u8; 160][..]);
    assert_eq!(&combined.payload()[160..], &[1u8; 160][..]);

    manager.stop();
}
