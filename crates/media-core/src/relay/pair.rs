//! Socket-pair relay
//!
//! Each leg has its own UDP socket and receive task. A packet arriving on one
//! leg is forwarded out of the other leg's socket to that leg's remote
//! endpoint, optionally through the destination leg's [`Resizer`] and with XOR
//! obfuscation removed or applied to match what each side speaks.
//!
//! Receive tasks hold only a weak reference to the pair, so a pair that has
//! been torn down while a datagram is in flight simply stops relaying.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Leg, LegAddress, PairKind};
use crate::config::ResizerCodec;
use crate::error::{MediaError, Result};
use crate::packet::{RTP_PACKET_BUFFER_SIZE, RtpPacket, validate_buffer};
use crate::resizer::{PacketSink, Resizer};
use crate::xor::XorCipher;

/// Lifecycle of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Closed,
    Open,
    Started,
}

/// Settings shared by every pair of a session
#[derive(Debug, Clone)]
pub struct PairOptions {
    /// Silence after which the pair reports itself inactive
    pub read_timeout: Duration,
    /// IP TOS byte applied to both sockets
    pub tos: u32,
    pub xor: XorCipher,
    /// Never apply or remove obfuscation (fax)
    pub xor_disabled: bool,
    /// Learn the remote endpoint from the first packet of each leg
    pub adjust_sender_from_source: bool,
    pub codec: ResizerCodec,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(300),
            tos: 0xb8,
            xor: XorCipher::default(),
            xor_disabled: false,
            adjust_sender_from_source: true,
            codec: ResizerCodec::default(),
        }
    }
}

/// Packet counters
#[derive(Debug, Default)]
pub struct PairStats {
    pub leg1_to_leg2: AtomicU64,
    pub leg2_to_leg1: AtomicU64,
    pub dropped: AtomicU64,
    pub send_errors: AtomicU64,
}

impl PairStats {
    pub fn relayed(&self, from: Leg) -> u64 {
        match from {
            Leg::One => self.leg1_to_leg2.load(Ordering::Relaxed),
            Leg::Two => self.leg2_to_leg1.load(Ordering::Relaxed),
        }
    }

    fn record(&self, from: Leg) {
        match from {
            Leg::One => self.leg1_to_leg2.fetch_add(1, Ordering::Relaxed),
            Leg::Two => self.leg2_to_leg1.fetch_add(1, Ordering::Relaxed),
        };
    }
}

#[derive(Debug)]
struct LegState {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    address: Mutex<Option<LegAddress>>,
    /// Where packets for this leg are sent
    remote: Mutex<Option<SocketAddr>>,
    /// Next packet received on this leg re-learns `remote`
    reset: AtomicBool,
    encrypted: AtomicBool,
    force_encrypted: AtomicBool,
    last_rx: Mutex<Instant>,
}

impl LegState {
    fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            address: Mutex::new(None),
            remote: Mutex::new(None),
            reset: AtomicBool::new(true),
            encrypted: AtomicBool::new(false),
            force_encrypted: AtomicBool::new(false),
            last_rx: Mutex::new(Instant::now()),
        }
    }

    fn is_encrypted(&self) -> bool {
        self.force_encrypted.load(Ordering::Relaxed) || self.encrypted.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct PairShared {
    kind: PairKind,
    label: String,
    options: PairOptions,
    verbose: AtomicBool,
    state: Mutex<PairState>,
    legs: [LegState; 2],
    /// Resizer for packets heading to leg 1 and leg 2 respectively
    resizers: [Resizer; 2],
    inactive: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    stats: PairStats,
}

/// Cloneable handle to a relay pair
#[derive(Debug, Clone)]
pub struct RelayPair {
    shared: Arc<PairShared>,
}

impl RelayPair {
    pub fn new(kind: PairKind, label: impl Into<String>, options: PairOptions) -> Self {
        let codec = options.codec;
        Self {
            shared: Arc::new(PairShared {
                kind,
                label: label.into(),
                options,
                verbose: AtomicBool::new(false),
                state: Mutex::new(PairState::Closed),
                legs: [LegState::new(), LegState::new()],
                resizers: [Resizer::new(1, codec), Resizer::new(2, codec)],
                inactive: AtomicBool::new(false),
                cancel: Mutex::new(None),
                stats: PairStats::default(),
            }),
        }
    }

    pub fn kind(&self) -> PairKind {
        self.shared.kind
    }

    pub fn state(&self) -> PairState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> &PairStats {
        &self.shared.stats
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.shared.verbose.store(verbose, Ordering::Relaxed);
        for resizer in &self.shared.resizers {
            resizer.set_verbose(verbose);
        }
    }

    /// Bind both legs.
    ///
    /// Any previous sockets are closed first. If either bind fails nothing
    /// stays bound and [`MediaError::BindError`] is returned.
    pub fn open(&self, leg1: LegAddress, leg2: LegAddress) -> Result<()> {
        self.stop();
        let tos = self.shared.options.tos;
        let socket1 = bind_udp_socket(leg1.local, tos)?;
        let socket2 = bind_udp_socket(leg2.local, tos)?;

        let leg1 = LegAddress {
            local: socket1.local_addr()?,
            external: leg1.external,
        };
        let leg2 = LegAddress {
            local: socket2.local_addr()?,
            external: leg2.external,
        };

        for (state, socket, address) in [
            (&self.shared.legs[0], socket1, leg1),
            (&self.shared.legs[1], socket2, leg2),
        ] {
            *state.socket.lock() = Some(Arc::new(socket));
            *state.address.lock() = Some(address);
            state.reset.store(true, Ordering::Relaxed);
        }
        *self.shared.state.lock() = PairState::Open;
        self.shared.inactive.store(false, Ordering::Relaxed);
        debug!(pair = %self.shared.label, leg1 = %leg1.local, leg2 = %leg2.local, "relay pair open");
        Ok(())
    }

    /// Start relaying.
    ///
    /// Calling this on a started pair only resets both legs so they re-learn
    /// their remote endpoints.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        match *state {
            PairState::Started => {
                drop(state);
                self.reset_leg(Leg::One);
                self.reset_leg(Leg::Two);
                return Ok(());
            }
            PairState::Closed => {
                return Err(MediaError::RelayUnavailable(format!(
                    "{}: cannot start a closed relay pair",
                    self.shared.label
                )));
            }
            PairState::Open => {}
        }

        let token = CancellationToken::new();
        for leg in [Leg::One, Leg::Two] {
            let socket = self.shared.legs[leg.index()].socket.lock().clone();
            let Some(socket) = socket else {
                return Err(MediaError::RelayUnavailable(format!(
                    "{}: leg {} has no socket",
                    self.shared.label,
                    leg.number()
                )));
            };
            *self.shared.legs[leg.index()].last_rx.lock() = Instant::now();
            tokio::spawn(receive_loop(
                Arc::downgrade(&self.shared),
                socket,
                leg,
                token.clone(),
            ));
        }
        *self.shared.cancel.lock() = Some(token);
        *state = PairState::Started;
        debug!(pair = %self.shared.label, "relay pair started");
        Ok(())
    }

    /// Make the next packet on `leg` re-learn the remote endpoint
    pub fn reset_leg(&self, leg: Leg) {
        self.shared.legs[leg.index()].reset.store(true, Ordering::Relaxed);
    }

    pub fn set_remote(&self, leg: Leg, remote: SocketAddr) {
        *self.shared.legs[leg.index()].remote.lock() = Some(remote);
    }

    pub fn remote(&self, leg: Leg) -> Option<SocketAddr> {
        *self.shared.legs[leg.index()].remote.lock()
    }

    pub fn local_address(&self, leg: Leg) -> Option<LegAddress> {
        *self.shared.legs[leg.index()].address.lock()
    }

    pub fn is_leg_encrypted(&self, leg: Leg) -> bool {
        self.shared.legs[leg.index()].is_encrypted()
    }

    /// Treat a leg as obfuscated regardless of what it sends
    pub fn force_leg_encryption(&self, leg: Leg, forced: bool) {
        self.shared.legs[leg.index()]
            .force_encrypted
            .store(forced, Ordering::Relaxed);
    }

    /// Resize packets heading to leg 1 / leg 2 to the given packetization (ms)
    pub fn set_resizer_samples(&self, leg1: u32, leg2: u32) {
        self.shared.resizers[0].set_samples(leg1);
        self.shared.resizers[1].set_samples(leg2);
    }

    pub fn resizer_samples(&self, leg: Leg) -> u32 {
        self.shared.resizers[leg.index()].samples()
    }

    /// True after a read error, or when either leg has been silent for longer
    /// than the read timeout while started.
    pub fn is_inactive(&self) -> bool {
        if self.shared.inactive.load(Ordering::Relaxed) {
            return true;
        }
        if self.state() != PairState::Started {
            return false;
        }
        let timeout = self.shared.options.read_timeout;
        self.shared
            .legs
            .iter()
            .any(|leg| leg.last_rx.lock().elapsed() > timeout)
    }

    /// Stop the receive tasks and pacing without releasing the sockets
    pub fn shutdown(&self) {
        if let Some(token) = self.shared.cancel.lock().take() {
            token.cancel();
        }
        for resizer in &self.shared.resizers {
            resizer.stop();
        }
        let mut state = self.shared.state.lock();
        if *state == PairState::Started {
            *state = PairState::Open;
        }
    }

    /// Release both sockets
    pub fn close(&self) {
        for leg in &self.shared.legs {
            leg.socket.lock().take();
            leg.remote.lock().take();
            leg.encrypted.store(false, Ordering::Relaxed);
        }
        *self.shared.state.lock() = PairState::Closed;
    }

    /// Full teardown; idempotent and callable from any thread
    pub fn stop(&self) {
        let was = self.state();
        self.shutdown();
        self.close();
        if was != PairState::Closed {
            info!(pair = %self.shared.label, "relay pair stopped");
        }
    }
}

impl PairShared {
    fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    fn on_datagram(self: &Arc<Self>, from: Leg, source: SocketAddr, buf: &mut [u8]) {
        if buf.len() < 2 {
            return;
        }
        let src = &self.legs[from.index()];
        let to = from.other();
        let dst = &self.legs[to.index()];

        self.inactive.store(false, Ordering::Relaxed);
        *src.last_rx.lock() = Instant::now();

        if self.options.adjust_sender_from_source && src.reset.swap(false, Ordering::Relaxed) {
            let mut remote = src.remote.lock();
            if *remote != Some(source) {
                debug!(pair = %self.label, leg = from.number(), %source, "learned sender endpoint");
            }
            *remote = Some(source);
        }

        let xor_enabled = !self.options.xor_disabled;
        src.encrypted
            .store(xor_enabled && !validate_buffer(buf), Ordering::Relaxed);

        let destination = *dst.remote.lock();
        let Some(destination) = destination.filter(|d| d.port() != 0) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            if self.verbose() {
                trace!(pair = %self.label, leg = to.number(), "no destination yet, dropping packet");
            }
            return;
        };

        let src_encrypted = xor_enabled && src.is_encrypted();
        let dst_encrypted = xor_enabled && dst.is_encrypted();
        let resizer = &self.resizers[to.index()];

        if self.kind == PairKind::Data && resizer.is_enabled() {
            if src_encrypted {
                self.options.xor.decrypt(buf);
            }
            let queued = RtpPacket::parse(buf)
                .map(|packet| resizer.enqueue(packet))
                .unwrap_or(false);
            if !queued {
                if dst_encrypted {
                    self.options.xor.encrypt(buf);
                }
                self.send(to, buf, destination);
                self.stats.record(from);
            }
            self.drain_resizers();
            return;
        }

        if src_encrypted != dst_encrypted {
            // decrypting and encrypting are the same operation
            self.options.xor.apply(buf);
        }
        if self.verbose() {
            trace!(pair = %self.label, from = from.number(), bytes = buf.len(), %destination, "relaying packet");
        }
        self.send(to, buf, destination);
        self.stats.record(from);
    }

    /// Push whatever the resizers have ready toward their legs
    fn drain_resizers(self: &Arc<Self>) {
        if self.kind != PairKind::Data {
            return;
        }
        for to in [Leg::One, Leg::Two] {
            let resizer = &self.resizers[to.index()];
            if !resizer.is_enabled() {
                continue;
            }
            let sink = self.sink_for(to);
            while let Some(packet) = resizer.dequeue(&sink) {
                self.send_packet(to, packet);
            }
        }
    }

    fn sink_for(self: &Arc<Self>, to: Leg) -> PacketSink {
        let weak: Weak<PairShared> = Arc::downgrade(self);
        Arc::new(move |packet: RtpPacket| {
            if let Some(shared) = weak.upgrade() {
                shared.send_packet(to, packet);
            }
        })
    }

    fn send_packet(&self, to: Leg, packet: RtpPacket) {
        let destination = *self.legs[to.index()].remote.lock();
        let Some(destination) = destination.filter(|d| d.port() != 0) else {
            return;
        };
        let mut buf = packet.as_bytes().to_vec();
        if !self.options.xor_disabled && self.legs[to.index()].is_encrypted() {
            self.options.xor.encrypt(&mut buf);
        }
        self.send(to, &buf, destination);
        self.stats.record(to.other());
    }

    /// Fire-and-forget send out of `to`'s socket
    fn send(&self, to: Leg, buf: &[u8], destination: SocketAddr) {
        let socket = self.legs[to.index()].socket.lock().clone();
        let Some(socket) = socket else {
            return;
        };
        if let Err(e) = socket.try_send_to(buf, destination) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            debug!(pair = %self.label, leg = to.number(), %destination, error = %e, "relay send failed");
        }
    }
}

async fn receive_loop(
    shared: Weak<PairShared>,
    socket: Arc<UdpSocket>,
    leg: Leg,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RTP_PACKET_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let Some(pair) = shared.upgrade() else {
            break;
        };
        match received {
            Ok((len, source)) => pair.on_datagram(leg, source, &mut buf[..len]),
            Err(e) => {
                warn!(pair = %pair.label, leg = leg.number(), error = %e, "relay read failed, marking inactive");
                pair.inactive.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// Bind a non-blocking UDP socket with the TOS byte set
pub(crate) fn bind_udp_socket(addr: SocketAddr, tos: u32) -> Result<UdpSocket> {
    let bind_err = |e: std::io::Error| MediaError::bind(addr, e);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    if addr.is_ipv4() {
        if let Err(e) = socket.set_tos(tos) {
            debug!(%addr, error = %e, "unable to set TOS on relay socket");
        }
    }
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn rtp(seq: u16) -> Vec<u8> {
        RtpPacket::new(0, seq, seq as u32 * 160, 99, &[0x55; 160])
            .as_bytes()
            .to_vec()
    }

    async fn open_pair(options: PairOptions) -> RelayPair {
        let pair = RelayPair::new(PairKind::Data, "test", options);
        pair.open(LegAddress::new(localhost(0)), LegAddress::new(localhost(0)))
            .unwrap();
        pair
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        buf.truncate(len);
        buf
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let pair = RelayPair::new(PairKind::Data, "t", PairOptions::default());
        assert_eq!(pair.state(), PairState::Closed);
        assert!(pair.start().is_err());
        pair.open(LegAddress::new(localhost(0)), LegAddress::new(localhost(0)))
            .unwrap();
        assert_eq!(pair.state(), PairState::Open);
        pair.start().unwrap();
        assert_eq!(pair.state(), PairState::Started);
        // restart only resets legs
        pair.start().unwrap();
        assert_eq!(pair.state(), PairState::Started);
        pair.stop();
        pair.stop();
        assert_eq!(pair.state(), PairState::Closed);
        assert!(pair.local_address(Leg::One).is_some());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = std::net::UdpSocket::bind(localhost(0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let pair = RelayPair::new(PairKind::Data, "t", PairOptions::default());
        let res = pair.open(LegAddress::new(localhost(0)), LegAddress::new(localhost(port)));
        assert!(matches!(res, Err(MediaError::BindError { .. })));
        assert_eq!(pair.state(), PairState::Closed);
    }

    #[tokio::test]
    async fn test_forwards_both_ways() {
        let pair = open_pair(PairOptions::default()).await;
        let a = UdpSocket::bind(localhost(0)).await.unwrap();
        let b = UdpSocket::bind(localhost(0)).await.unwrap();
        pair.set_remote(Leg::Two, b.local_addr().unwrap());
        pair.start().unwrap();

        let leg1 = pair.local_address(Leg::One).unwrap().local;
        let leg2 = pair.local_address(Leg::Two).unwrap().local;

        a.send_to(&rtp(1), leg1).await.unwrap();
        assert_eq!(recv(&b).await, rtp(1));

        // leg 1's endpoint was learned from the first packet
        b.send_to(&rtp(2), leg2).await.unwrap();
        assert_eq!(recv(&a).await, rtp(2));
        assert_eq!(pair.remote(Leg::One), Some(a.local_addr().unwrap()));
        assert_eq!(pair.stats().relayed(Leg::One), 1);
        assert_eq!(pair.stats().relayed(Leg::Two), 1);
        pair.stop();
    }

    #[tokio::test]
    async fn test_xor_toward_encrypted_leg() {
        let options = PairOptions::default();
        let cipher = options.xor;
        let pair = open_pair(options).await;
        let a = UdpSocket::bind(localhost(0)).await.unwrap();
        let b = UdpSocket::bind(localhost(0)).await.unwrap();
        pair.set_remote(Leg::Two, b.local_addr().unwrap());
        pair.force_leg_encryption(Leg::Two, true);
        pair.start().unwrap();

        let leg1 = pair.local_address(Leg::One).unwrap().local;
        a.send_to(&rtp(5), leg1).await.unwrap();
        let mut got = recv(&b).await;
        assert!(!validate_buffer(&got));
        cipher.decrypt(&mut got);
        assert_eq!(got, rtp(5));

        // obfuscated traffic from leg 2 arrives in clear on leg 1
        let leg2 = pair.local_address(Leg::Two).unwrap().local;
        let mut scrambled = rtp(6);
        cipher.encrypt(&mut scrambled);
        b.send_to(&scrambled, leg2).await.unwrap();
        assert_eq!(recv(&a).await, rtp(6));
        pair.stop();
    }

    #[tokio::test]
    async fn test_resizing_upsizes_toward_leg2() {
        let options = PairOptions {
            codec: ResizerCodec::pcmu(),
            ..Default::default()
        };
        let pair = open_pair(options).await;
        pair.set_resizer_samples(0, 40);
        let a = UdpSocket::bind(localhost(0)).await.unwrap();
        let b = UdpSocket::bind(localhost(0)).await.unwrap();
        pair.set_remote(Leg::Two, b.local_addr().unwrap());
        pair.start().unwrap();

        let leg1 = pair.local_address(Leg::One).unwrap().local;
        a.send_to(&rtp(10), leg1).await.unwrap();
        a.send_to(&rtp(11), leg1).await.unwrap();
        let got = RtpPacket::parse(&recv(&b).await).unwrap();
        assert_eq!(got.payload_size(), 320);
        assert_eq!(got.sequence_number(), 10);
        pair.stop();
    }

    #[tokio::test]
    async fn test_inactivity_after_read_timeout() {
        let options = PairOptions {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let pair = open_pair(options).await;
        pair.start().unwrap();
        assert!(!pair.is_inactive());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pair.is_inactive());
        pair.stop();
        assert!(!pair.is_inactive());
    }

    #[tokio::test]
    async fn test_no_destination_drops() {
        let pair = open_pair(PairOptions::default()).await;
        pair.start().unwrap();
        let a = UdpSocket::bind(localhost(0)).await.unwrap();
        let leg1 = pair.local_address(Leg::One).unwrap().local;
        a.send_to(&rtp(1), leg1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pair.stats().dropped.load(Ordering::Relaxed), 1);
        pair.stop();
    }
}
