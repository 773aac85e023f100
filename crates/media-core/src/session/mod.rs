//! Relay sessions
//!
//! A [`RelaySession`] anchors the media of one call. It keeps one
//! [`RelayTuple`] per media kind and walks the offer/answer exchange with the
//! state machine in [`state`], rewriting each SDP body so both peers send
//! their media through the local relay sockets.
//!
//! Leg numbering follows SDP rather than signalling: leg 1 is whoever made the
//! initial offer, identified by the session id of its `o=` line.

pub mod state;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{MediaError, Result};
use crate::ports::PortAllocator;
use crate::relay::{Interface, Leg, LegAddress, PairOptions, RelayTuple};
use crate::sdp::{MediaKind, Sdp, is_blackhole, is_private};
use crate::xor::XorCipher;

pub use state::{NegotiationState, RequestType, SdpAction, Transition, transition};

/// Per-call options handed down by the signalling layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdpAttributes {
    pub verbose: bool,
    /// Relay media even when the endpoints could reach each other
    pub force_create: bool,
    /// Treat both legs as XOR obfuscated
    pub force_pea_encryption: bool,
    pub call_id: String,
    pub from: String,
    pub to: String,
    /// Packetization (ms) for packets sent to leg 1; zero disables resizing
    pub resizer_samples_leg1: u32,
    pub resizer_samples_leg2: u32,
    /// Track the session in the per-route counters
    pub count_sessions: bool,
}

/// Where the SDP came from and where it is going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingAddresses {
    /// Via sent-by of the message
    pub sent_by: IpAddr,
    /// Source address of the packet carrying the SDP
    pub packet_source: IpAddr,
    /// Local interface the packet arrived on
    pub packet_local_interface: Interface,
    /// Next hop the message is routed to
    pub route: IpAddr,
    /// Local interface used toward `route`
    pub route_local_interface: Interface,
}

#[derive(Debug)]
struct MediaStream {
    kind: MediaKind,
    tuple: RelayTuple,
    /// A relay was offered for this stream
    offered: bool,
    /// Both legs of the relay are known
    negotiated: bool,
}

impl MediaStream {
    fn stop(&mut self) {
        self.tuple.stop();
        self.offered = false;
        self.negotiated = false;
    }
}

/// Values shared by the address rewrite of every media line of one body
struct Rewrite {
    has_session_address: bool,
    blackhole: bool,
    changed_session_address: bool,
}

impl Rewrite {
    fn new(sdp: &Sdp) -> Self {
        let session = sdp.session_address();
        Self {
            has_session_address: session.is_some(),
            blackhole: session.as_ref().is_some_and(is_blackhole),
            changed_session_address: false,
        }
    }

    /// Point the media description of `kind` at the local relay sockets
    fn apply(&mut self, sdp: &mut Sdp, kind: MediaKind, data: LegAddress, control: LegAddress) {
        let has_media_level = sdp.media_level_address(kind).is_some();
        let advertised = data.advertised_ip();
        if self.has_session_address {
            if !self.changed_session_address && !self.blackhole {
                sdp.set_session_address(advertised);
                self.changed_session_address = true;
            }
            if has_media_level {
                sdp.set_media_address(kind, advertised);
            }
        } else {
            sdp.set_media_address(kind, advertised);
        }
        if !self.blackhole {
            sdp.set_media_ports(kind, data.port(), control.port());
        }
    }
}

pub struct RelaySession {
    identifier: String,
    log_id: String,
    verbose: bool,
    state: NegotiationState,
    streams: Vec<MediaStream>,
    leg1_identifier: Option<String>,
    leg2_identifier: Option<String>,
    last_offer_leg: Option<Leg>,
    expecting_initial_answer: bool,
    last_sdp_in_ack: Option<String>,
    call_id: String,
    from: String,
    to: String,
    resizer_samples: (u32, u32),
    monitored_route: Option<String>,
    auth_deadline: Option<Instant>,
    auth_timeout: Duration,
    bind_retry: usize,
    ports: Arc<PortAllocator>,
    stopped: bool,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("identifier", &self.identifier)
            .field("state", &self.state)
            .field("call_id", &self.call_id)
            .finish()
    }
}

impl RelaySession {
    pub fn new(identifier: impl Into<String>, config: &RelayConfig, ports: Arc<PortAllocator>) -> Self {
        let identifier = identifier.into();
        let base = PairOptions {
            read_timeout: config.read_timeout,
            tos: config.tos(),
            xor: XorCipher::from_key_str(&config.xor_key),
            codec: config.codec,
            ..PairOptions::default()
        };
        let streams = MediaKind::ALL
            .iter()
            .map(|&kind| {
                let mut options = base.clone();
                options.xor_disabled = kind == MediaKind::Fax;
                MediaStream {
                    kind,
                    tuple: RelayTuple::new(&format!("{identifier}/{kind}"), options),
                    offered: false,
                    negotiated: false,
                }
            })
            .collect();

        Self {
            identifier,
            log_id: String::new(),
            verbose: false,
            state: NegotiationState::Idle,
            streams,
            leg1_identifier: None,
            leg2_identifier: None,
            last_offer_leg: None,
            expecting_initial_answer: false,
            last_sdp_in_ack: None,
            call_id: String::new(),
            from: String::new(),
            to: String::new(),
            resizer_samples: (0, 0),
            monitored_route: None,
            auth_deadline: None,
            auth_timeout: config.auth_timeout,
            bind_retry: config.bind_retry.max(1),
            ports,
            stopped: false,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Move to `state`; entering `OfferWaitingAuthentication` arms the auth timer
    pub fn set_state(&mut self, state: NegotiationState) {
        self.auth_deadline = if state == NegotiationState::OfferWaitingAuthentication {
            Some(Instant::now() + self.auth_timeout)
        } else {
            None
        };
        self.state = state;
    }

    pub fn is_auth_timeout(&self) -> bool {
        self.auth_deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn set_log_id(&mut self, log_id: impl Into<String>) {
        self.log_id = log_id.into();
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        for stream in &self.streams {
            stream.tuple.set_verbose(verbose);
        }
    }

    pub fn set_call_info(&mut self, call_id: &str, from: &str, to: &str) {
        self.call_id = call_id.to_string();
        self.from = from.to_string();
        self.to = to.to_string();
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn set_monitored_route(&mut self, route: impl Into<String>) {
        self.monitored_route = Some(route.into());
    }

    pub fn monitored_route(&self) -> Option<&str> {
        self.monitored_route.as_deref()
    }

    pub fn set_resizer_samples(&mut self, leg1: u32, leg2: u32) {
        self.resizer_samples = (leg1, leg2);
        self.stream(MediaKind::Audio).tuple.set_resizer_samples(leg1, leg2);
    }

    pub fn resizer_samples(&self) -> (u32, u32) {
        self.resizer_samples
    }

    pub fn last_sdp_in_ack(&self) -> Option<&str> {
        self.last_sdp_in_ack.as_deref()
    }

    pub fn tuple(&self, kind: MediaKind) -> &RelayTuple {
        &self.stream(kind).tuple
    }

    pub fn is_offered(&self, kind: MediaKind) -> bool {
        self.stream(kind).offered
    }

    pub fn is_negotiated(&self, kind: MediaKind) -> bool {
        self.stream(kind).negotiated
    }

    /// Liveness of the voice stream, falling back to video for video-only calls
    pub fn is_voice_inactive(&self) -> bool {
        let audio = &self.stream(MediaKind::Audio).tuple;
        if audio.is_open() {
            return audio.is_inactive();
        }
        let video = &self.stream(MediaKind::Video).tuple;
        video.is_open() && video.is_inactive()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop every relay; safe to call repeatedly
    pub fn stop(&mut self) {
        for stream in &mut self.streams {
            stream.stop();
        }
        self.auth_deadline = None;
        if !self.stopped {
            self.stopped = true;
            debug!(session_id = %self.identifier, "{}RTP: session stopped", self.log_id);
        }
    }

    fn stream(&self, kind: MediaKind) -> &MediaStream {
        &self.streams[Self::slot(kind)]
    }

    fn slot(kind: MediaKind) -> usize {
        match kind {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
            MediaKind::Fax => 2,
        }
    }

    fn any_offered(&self) -> bool {
        self.streams.iter().any(|s| s.offered)
    }

    /// Process an SDP body and rewrite it in place.
    ///
    /// Bodies the current state does not expect are left untouched, except
    /// for an ACK on a negotiated session, which is answered with the SDP
    /// rewritten for the first ACK that carried one.
    pub fn handle_sdp(
        &mut self,
        addresses: &SignalingAddresses,
        request_type: RequestType,
        sdp: &mut String,
        attributes: &SdpAttributes,
    ) -> Result<()> {
        let mut attributes = attributes.clone();
        self.stopped = false;

        if self.resizer_samples.0 == 0 && attributes.resizer_samples_leg1 > 0 {
            self.resizer_samples.0 = attributes.resizer_samples_leg1;
        }
        if self.resizer_samples.1 == 0 && attributes.resizer_samples_leg2 > 0 {
            self.resizer_samples.1 = attributes.resizer_samples_leg2;
        }
        if self.resizer_samples != (0, 0) {
            attributes.force_create = true;
            let mut body = Sdp::parse(sdp)?;
            if body.has_media(MediaKind::Audio) {
                body.remove_media_attribute(MediaKind::Audio, "ptime");
                *sdp = body.to_string();
            }
        }

        let Some(Transition { action, next }) = transition(self.state, request_type) else {
            if self.state == NegotiationState::Negotiated && request_type == RequestType::InviteAck {
                if let Some(previous) = &self.last_sdp_in_ack {
                    *sdp = previous.clone();
                }
            }
            warn!(
                session_id = %self.identifier,
                "{}RTP: Ignoring request type={} for state {}", self.log_id, request_type, self.state
            );
            return Ok(());
        };

        match action {
            SdpAction::InitialOffer => self.handle_initial_offer(addresses, sdp, &attributes)?,
            SdpAction::Offer => self.handle_offer(addresses, sdp, &attributes)?,
            SdpAction::ReOffer => {
                attributes.force_create = self.any_offered();
                self.handle_offer(addresses, sdp, &attributes)?;
            }
            SdpAction::Answer => {
                if self.expecting_initial_answer {
                    self.handle_initial_answer(sdp, &attributes)?;
                } else {
                    self.handle_answer(sdp)?;
                }
            }
        }

        match (self.state, request_type) {
            (NegotiationState::WaitingAnswerAckOrPrack, RequestType::InviteAck) => {
                self.last_sdp_in_ack = Some(sdp.clone());
            }
            (NegotiationState::Negotiated, RequestType::InviteResponse) => {
                self.last_sdp_in_ack = None;
            }
            _ => {}
        }

        info!(
            session_id = %self.identifier,
            "{}RTP: Changing state from {} to {}", self.log_id, self.state, next
        );
        self.set_state(next);
        Ok(())
    }

    /// Bind a fresh tuple for `kind`, walking the port window on failure
    fn open_stream(&self, kind: MediaKind, leg1: Interface, leg2: Interface) -> Result<()> {
        let tuple = &self.stream(kind).tuple;
        let mut last_error = None;
        for _ in 0..self.bind_retry {
            let leg1_port = self.ports.next_port_tuple();
            let leg2_port = self.ports.next_port_tuple();
            match tuple.open(leg1, leg1_port, leg2, leg2_port) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(session_id = %self.identifier, %kind, error = %e, "retrying relay bind");
                    last_error = Some(e);
                }
            }
        }
        Err(MediaError::RelayUnavailable(format!(
            "{}: no {} relay ports after {} attempts ({})",
            self.identifier,
            kind,
            self.bind_retry,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn handle_initial_offer(
        &mut self,
        addresses: &SignalingAddresses,
        sdp: &mut String,
        attributes: &SdpAttributes,
    ) -> Result<()> {
        for stream in &mut self.streams {
            stream.offered = false;
        }
        self.leg1_identifier = None;
        self.leg2_identifier = None;
        self.last_offer_leg = None;

        let force = attributes.force_create || attributes.force_pea_encryption;
        self.expecting_initial_answer = true;

        let mut offer = Sdp::parse(sdp)?;
        self.leg1_identifier = Some(offer.origin_session_id()?);
        let mut rewrite = Rewrite::new(&offer);

        for kind in MediaKind::ALL {
            if !offer.has_media(kind) {
                continue;
            }
            let media_address = offer
                .media_address(kind)
                .ok_or_else(|| MediaError::protocol("Unable to parse media address from SDP offer"))?;

            let create = if media_address == addresses.route_local_interface.ip {
                false
            } else {
                force || (is_private(&media_address) && media_address != addresses.packet_source)
            };
            if !create {
                continue;
            }

            self.open_stream(
                kind,
                addresses.packet_local_interface,
                addresses.route_local_interface,
            )?;

            let data_port = offer.media_port(kind).unwrap_or(0);
            let control_port = offer.control_port(kind).unwrap_or(0);
            let destination = if is_private(&media_address) {
                addresses.packet_source
            } else {
                media_address
            };

            let stream = &mut self.streams[Self::slot(kind)];
            stream.tuple.force_leg_encryption(Leg::One, attributes.force_pea_encryption);
            stream.tuple.set_destination(Leg::One, destination, data_port, control_port);

            let (Some(data), Some(control)) = (
                stream.tuple.data_address(Leg::Two),
                stream.tuple.control_address(Leg::Two),
            ) else {
                return Err(MediaError::RelayUnavailable(format!("{}: {} relay not bound", self.identifier, kind)));
            };
            rewrite.apply(&mut offer, kind, data, control);
            stream.offered = true;
        }

        if self.any_offered() {
            *sdp = offer.to_string();
        }
        Ok(())
    }

    fn handle_initial_answer(&mut self, sdp: &mut String, attributes: &SdpAttributes) -> Result<()> {
        self.expecting_initial_answer = false;

        let mut answer = Sdp::parse(sdp)?;
        self.leg2_identifier = Some(answer.origin_session_id()?);
        let mut rewrite = Rewrite::new(&answer);
        let samples = self.resizer_samples;

        for stream in &mut self.streams {
            if !stream.offered {
                continue;
            }
            let kind = stream.kind;
            if !answer.has_media(kind) {
                stream.tuple.stop();
                stream.negotiated = false;
                continue;
            }
            let media_address = answer
                .media_address(kind)
                .ok_or_else(|| MediaError::protocol("Unable to parse media address from SDP answer"))?;
            let data_port = answer.media_port(kind).unwrap_or(0);
            let control_port = answer.control_port(kind).unwrap_or(0);

            stream.tuple.set_destination(Leg::Two, media_address, data_port, control_port);
            stream.tuple.force_leg_encryption(Leg::Two, attributes.force_pea_encryption);
            stream.negotiated = true;
            stream.tuple.start()?;
            if kind == MediaKind::Audio && samples != (0, 0) {
                stream.tuple.set_resizer_samples(samples.0, samples.1);
            }

            let (Some(data), Some(control)) = (
                stream.tuple.data_address(Leg::One),
                stream.tuple.control_address(Leg::One),
            ) else {
                continue;
            };
            rewrite.apply(&mut answer, kind, data, control);
        }

        if self.any_offered() {
            *sdp = answer.to_string();
        }
        Ok(())
    }

    /// Leg whose `o=` session id matches, if any
    fn leg_of(&self, origin: &str) -> Option<Leg> {
        if self.leg1_identifier.as_deref() == Some(origin) {
            Some(Leg::One)
        } else if self.leg2_identifier.as_deref() == Some(origin) {
            Some(Leg::Two)
        } else {
            None
        }
    }

    fn restart_with_initial_offer(
        &mut self,
        addresses: &SignalingAddresses,
        sdp: &mut String,
        attributes: &SdpAttributes,
    ) -> Result<()> {
        for stream in &mut self.streams {
            stream.stop();
        }
        self.handle_initial_offer(addresses, sdp, attributes)
    }

    fn handle_offer(
        &mut self,
        addresses: &SignalingAddresses,
        sdp: &mut String,
        attributes: &SdpAttributes,
    ) -> Result<()> {
        let mut offer = Sdp::parse(sdp)?;
        let origin = offer.origin_session_id()?;

        // An unknown origin is a new SDP session: start over
        let Some(leg) = self.leg_of(&origin) else {
            return self.restart_with_initial_offer(addresses, sdp, attributes);
        };
        self.last_offer_leg = Some(leg);
        debug!(session_id = %self.identifier, leg = leg.number(), "{}RTP: processing session update (OFFER)", self.log_id);

        // Media that was never negotiated is being added
        if self.streams.iter().any(|s| offer.has_media(s.kind) && !s.negotiated) {
            return self.restart_with_initial_offer(addresses, sdp, attributes);
        }

        let mut rewrite = Rewrite::new(&offer);
        for stream in &mut self.streams {
            let kind = stream.kind;
            let present = offer.has_media(kind);
            if !present {
                if stream.negotiated {
                    stream.stop();
                }
                continue;
            }
            if !stream.negotiated {
                continue;
            }
            let media_address = offer
                .media_address(kind)
                .ok_or_else(|| MediaError::protocol("Unable to parse media address from SDP offer"))?;

            if !media_address.is_unspecified() {
                let data_port = offer.media_port(kind).unwrap_or(0);
                let control_port = offer.control_port(kind).unwrap_or(0);
                stream.tuple.set_destination(leg, media_address, data_port, control_port);
                stream.tuple.reset_leg(leg);
                let other = leg.other();
                if let (Some(data), Some(control)) =
                    (stream.tuple.data_address(other), stream.tuple.control_address(other))
                {
                    rewrite.apply(&mut offer, kind, data, control);
                }
            }
            stream.offered = true;
        }

        if self.any_offered() {
            *sdp = offer.to_string();
        }
        Ok(())
    }

    fn handle_answer(&mut self, sdp: &mut String) -> Result<()> {
        let mut answer = Sdp::parse(sdp)?;
        let origin = answer.origin_session_id()?;

        let leg = match (self.leg_of(&origin), self.last_offer_leg) {
            (Some(leg), _) => leg,
            (None, None) => return Err(MediaError::protocol("Illegal session-id change")),
            (None, Some(Leg::One)) => {
                self.leg2_identifier = Some(origin);
                Leg::Two
            }
            (None, Some(Leg::Two)) => {
                self.leg1_identifier = Some(origin);
                Leg::One
            }
        };
        self.last_offer_leg = None;
        debug!(session_id = %self.identifier, leg = leg.number(), "{}RTP: processing session update (ANSWER)", self.log_id);

        let mut rewrite = Rewrite::new(&answer);
        for stream in &mut self.streams {
            if !stream.offered {
                continue;
            }
            let kind = stream.kind;
            if !answer.has_media(kind) {
                stream.tuple.stop();
                stream.negotiated = false;
                continue;
            }
            let Some(media_address) = answer.media_address(kind) else {
                continue;
            };
            let data_port = answer.media_port(kind).unwrap_or(0);
            let control_port = answer.control_port(kind).unwrap_or(0);
            stream.tuple.set_destination(leg, media_address, data_port, control_port);
            stream.negotiated = true;
            stream.tuple.reset_leg(leg);

            let other = leg.other();
            if let (Some(data), Some(control)) = (stream.tuple.data_address(other), stream.tuple.control_address(other)) {
                rewrite.apply(&mut answer, kind, data, control);
            }
        }

        if self.any_offered() {
            *sdp = answer.to_string();
        }
        Ok(())
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        for stream in &self.streams {
            stream.tuple.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::PairState;

    fn config() -> RelayConfig {
        RelayConfig {
            port_base: 41000,
            port_max: 41999,
            ..RelayConfig::default()
        }
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

    fn body(origin: &str, ip: &str, port: u16) -> String {
        format!(
            "v=0\r\no=- {origin} 1 IN IP4 {ip}\r\ns=-\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\na=ptime:20\r\n"
        )
    }

    fn forced() -> SdpAttributes {
        SdpAttributes {
            force_create: true,
            ..SdpAttributes::default()
        }
    }

    fn session(identifier: &str) -> RelaySession {
        let cfg = config();
        let ports = Arc::new(PortAllocator::new(cfg.port_base, cfg.port_max));
        RelaySession::new(identifier, &cfg, ports)
    }

    #[tokio::test]
    async fn test_offer_answer_negotiates_audio() {
        let mut session = session("s1");
        let addresses = loopback();

        let mut offer = body("111", "192.168.1.10", 4000);
        session
            .handle_sdp(&addresses, RequestType::Invite, &mut offer, &forced())
            .unwrap();
        assert_eq!(session.state(), NegotiationState::WaitingAnswerResponse);
        assert!(session.is_offered(MediaKind::Audio));
        let rewritten = Sdp::parse(&offer).unwrap();
        let port = rewritten.media_port(MediaKind::Audio).unwrap();
        assert!(port % 2 == 0 && (41000..=41999).contains(&port));
        assert_eq!(rewritten.session_address(), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(
            session.tuple(MediaKind::Audio).data().remote(Leg::One),
            Some("127.0.0.1:4000".parse().unwrap())
        );

        let mut answer = body("222", "10.0.0.7", 5000);
        session
            .handle_sdp(&addresses, RequestType::InviteResponse, &mut answer, &forced())
            .unwrap();
        assert_eq!(session.state(), NegotiationState::Negotiated);
        assert!(session.is_negotiated(MediaKind::Audio));
        assert_eq!(session.tuple(MediaKind::Audio).data().state(), PairState::Started);
        assert_eq!(
            session.tuple(MediaKind::Audio).control().remote(Leg::Two),
            Some("10.0.0.7:5001".parse().unwrap())
        );
        session.stop();
        assert!(session.is_stopped());
    }

    #[tokio::test]
    async fn test_public_endpoints_are_not_relayed() {
        let mut session = session("s2");
        let mut offer = body("111", "198.51.100.20", 4000);
        let original = offer.clone();
        session
            .handle_sdp(&loopback(), RequestType::Invite, &mut offer, &SdpAttributes::default())
            .unwrap();
        assert_eq!(offer, original);
        assert!(!session.is_offered(MediaKind::Audio));
        assert_eq!(session.state(), NegotiationState::WaitingAnswerResponse);
    }

    #[tokio::test]
    async fn test_reinvite_reuses_relay() {
        let mut session = session("s3");
        let addresses = loopback();
        let mut offer = body("111", "192.168.1.10", 4000);
        session.handle_sdp(&addresses, RequestType::Invite, &mut offer, &forced()).unwrap();
        let first_port = Sdp::parse(&offer).unwrap().media_port(MediaKind::Audio);
        let mut answer = body("222", "10.0.0.7", 5000);
        session.handle_sdp(&addresses, RequestType::InviteResponse, &mut answer, &forced()).unwrap();

        // leg 2 re-offers with a new port
        let mut reoffer = body("222", "10.0.0.7", 6000);
        session.handle_sdp(&addresses, RequestType::Invite, &mut reoffer, &forced()).unwrap();
        assert_eq!(session.state(), NegotiationState::WaitingAnswerResponse);
        assert_eq!(
            session.tuple(MediaKind::Audio).data().remote(Leg::Two),
            Some("10.0.0.7:6000".parse().unwrap())
        );
        // presented to leg 1 with leg 1's local port
        let leg1_port = session.tuple(MediaKind::Audio).data_address(Leg::One).map(|a| a.port());
        assert_eq!(Sdp::parse(&reoffer).unwrap().media_port(MediaKind::Audio), leg1_port);

        let mut reanswer = body("111", "192.168.1.10", 4002);
        session.handle_sdp(&addresses, RequestType::InviteResponse, &mut reanswer, &forced()).unwrap();
        assert_eq!(session.state(), NegotiationState::Negotiated);
        assert_eq!(Sdp::parse(&reanswer).unwrap().media_port(MediaKind::Audio), first_port);
        session.stop();
    }

    #[tokio::test]
    async fn test_unexpected_request_is_ignored() {
        let mut session = session("s4");
        let mut sdp = body("111", "192.168.1.10", 4000);
        let original = sdp.clone();
        session
            .handle_sdp(&loopback(), RequestType::Update, &mut sdp, &forced())
            .unwrap();
        assert_eq!(sdp, original);
        assert_eq!(session.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_ack_sdp_is_remembered() {
        let mut session = session("s5");
        let addresses = loopback();
        let mut offer = body("111", "192.168.1.10", 4000);
        session.handle_sdp(&addresses, RequestType::InviteResponse, &mut offer, &forced()).unwrap();
        assert_eq!(session.state(), NegotiationState::WaitingAnswerAckOrPrack);

        let mut ack = body("222", "10.0.0.7", 5000);
        session.handle_sdp(&addresses, RequestType::InviteAck, &mut ack, &forced()).unwrap();
        assert_eq!(session.state(), NegotiationState::Negotiated);
        assert_eq!(session.last_sdp_in_ack(), Some(ack.as_str()));

        let mut retransmitted = body("222", "10.0.0.7", 5000);
        session
            .handle_sdp(&addresses, RequestType::InviteAck, &mut retransmitted, &forced())
            .unwrap();
        assert_eq!(retransmitted, ack);
        session.stop();
    }

    #[tokio::test]
    async fn test_resizing_strips_ptime_and_forces_relay() {
        let mut session = session("s6");
        let attributes = SdpAttributes {
            resizer_samples_leg1: 20,
            resizer_samples_leg2: 40,
            ..SdpAttributes::default()
        };
        let mut offer = body("111", "198.51.100.20", 4000);
        session
            .handle_sdp(&loopback(), RequestType::Invite, &mut offer, &attributes)
            .unwrap();
        assert!(!offer.contains("a=ptime"));
        assert!(session.is_offered(MediaKind::Audio));
        assert_eq!(session.resizer_samples(), (20, 40));
        session.stop();
    }

    #[tokio::test]
    async fn test_auth_state_arms_deadline() {
        let cfg = RelayConfig {
            auth_timeout: Duration::ZERO,
            ..config()
        };
        let ports = Arc::new(PortAllocator::new(cfg.port_base, cfg.port_max));
        let mut session = RelaySession::new("s7", &cfg, ports);
        assert!(!session.is_auth_timeout());
        session.set_state(NegotiationState::OfferWaitingAuthentication);
        assert!(session.is_auth_timeout());
        session.set_state(NegotiationState::Idle);
        assert!(!session.is_auth_timeout());
    }

    #[tokio::test]
    async fn test_bad_origin_is_rejected() {
        let mut session = session("s8");
        let mut sdp = "v=0\r\no=- 1\r\nc=IN IP4 192.168.1.1\r\nm=audio 4000 RTP/AVP 0\r\n".to_string();
        let err = session
            .handle_sdp(&loopback(), RequestType::Invite, &mut sdp, &forced())
            .unwrap_err();
        assert!(matches!(err, MediaError::ProtocolViolation(_)));
    }
}
