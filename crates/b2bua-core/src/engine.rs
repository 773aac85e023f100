//! Back-to-back user agent engine
//!
//! [`B2bEngine`] owns the state shared by all transactions: the dialog store,
//! the 2xx retransmission cache and the media relay. It is also the
//! [`TransactionHooks`] implementation every transaction runs with. Initial
//! requests are placed by a [`RoutePolicy`]; mid-dialog requests and ACKs
//! follow the dialog they belong to.
//!
//! ```text
//!  caller ──leg 1──▶ handle_request ──▶ B2bTransaction::run ──leg 2──▶ callee
//!                         │                    │
//!                         └── ACK ──▶ route_ack ┴── DialogStore / RelayManager
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sbc_infra_common::LogContext;
use sbc_media_core::{Interface, Leg, RelayManager, RequestType, SdpAttributes, SignalingAddresses};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::contact;
use crate::dialog::{DialogStore, RetransmitCache};
use crate::error::{B2bError, Result};
use crate::message::{DEFAULT_MAX_FORWARDS, SipMessage};
use crate::resolver::Resolver;
use crate::transaction::{
    self, B2bTransaction, ForwardTarget, RouteOutcome, TransactionContext, TransactionHooks, props,
};
use crate::transport::{ClientTransport, OutboundRoute, ServerResponder, Transport, TransportInfo};

/// Decides where initial requests go
#[async_trait]
pub trait RoutePolicy: Send + Sync {
    async fn route(&self, request: &mut SipMessage, tx: &B2bTransaction) -> Result<RouteOutcome>;
}

/// Sends every initial request toward the host of its request-URI
#[derive(Debug, Clone)]
pub struct RequestUriPolicy {
    local: SocketAddr,
    transport: Option<Transport>,
}

impl RequestUriPolicy {
    pub fn new(local: SocketAddr) -> Self {
        Self { local, transport: None }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }
}

#[async_trait]
impl RoutePolicy for RequestUriPolicy {
    async fn route(&self, _request: &mut SipMessage, _tx: &B2bTransaction) -> Result<RouteOutcome> {
        let mut forward = ForwardTarget::new(self.local, None);
        if let Some(transport) = self.transport {
            forward = forward.with_transport(transport);
        }
        Ok(RouteOutcome::Forward(forward))
    }
}

fn request_type(method: &str, response: bool) -> Option<RequestType> {
    match (method, response) {
        ("INVITE", false) => Some(RequestType::Invite),
        ("INVITE", true) => Some(RequestType::InviteResponse),
        ("UPDATE", false) => Some(RequestType::Update),
        ("UPDATE", true) => Some(RequestType::UpdateResponse),
        ("PRACK", false) => Some(RequestType::Prack),
        ("PRACK", true) => Some(RequestType::PrackResponse),
        _ => None,
    }
}

fn interface(local: SocketAddr, external: Option<IpAddr>) -> Interface {
    let interface = Interface::new(local.ip());
    match external {
        Some(external) => interface.with_external(external),
        None => interface,
    }
}

fn sdp_attributes(message: &SipMessage) -> SdpAttributes {
    SdpAttributes {
        call_id: message.call_id().unwrap_or_default().to_string(),
        from: message.header("from").unwrap_or_default().to_string(),
        to: message.header("to").unwrap_or_default().to_string(),
        ..SdpAttributes::default()
    }
}

pub struct B2bEngine {
    config: EngineConfig,
    relay: Arc<RelayManager>,
    dialogs: Arc<DialogStore>,
    retransmits: RetransmitCache,
    resolver: Arc<dyn Resolver>,
    client: Arc<dyn ClientTransport>,
    policy: Arc<dyn RoutePolicy>,
    transactions: DashMap<String, Arc<B2bTransaction>>,
    housekeeping: Mutex<Option<CancellationToken>>,
}

impl B2bEngine {
    pub fn new(
        config: EngineConfig,
        relay: Arc<RelayManager>,
        dialogs: Arc<DialogStore>,
        client: Arc<dyn ClientTransport>,
        resolver: Arc<dyn Resolver>,
        policy: Arc<dyn RoutePolicy>,
    ) -> Arc<Self> {
        let retransmits = RetransmitCache::new(config.retransmit_lifetime);
        Arc::new(Self {
            config,
            relay,
            dialogs,
            retransmits,
            resolver,
            client,
            policy,
            transactions: DashMap::new(),
            housekeeping: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dialogs(&self) -> &Arc<DialogStore> {
        &self.dialogs
    }

    pub fn relay(&self) -> &Arc<RelayManager> {
        &self.relay
    }

    pub fn retransmits(&self) -> &RetransmitCache {
        &self.retransmits
    }

    /// Transactions still running
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Reload dialogs saved by a previous run
    pub fn restore(&self) -> usize {
        self.dialogs.restore_from_store(self.config.store_restore_window)
    }

    fn context(self: &Arc<Self>) -> TransactionContext {
        TransactionContext {
            hooks: self.clone(),
            client: Arc::clone(&self.client),
            resolver: Arc::clone(&self.resolver),
            timers: self.config.timers(),
        }
    }

    /// Take an inbound request received on `server`.
    ///
    /// Returns the task handling it, or `None` for a retransmission of a
    /// request whose transaction is still running.
    pub fn handle_request(
        self: &Arc<Self>,
        request: SipMessage,
        server: TransportInfo,
        responder: Arc<dyn ServerResponder>,
    ) -> Option<JoinHandle<()>> {
        let span = LogContext::with_operation("b2bua", request.method().unwrap_or("UNKNOWN"))
            .with_field("call_id", request.call_id().unwrap_or("-"))
            .span(Level::INFO);

        if request.is_method("ACK") {
            let engine = Arc::clone(self);
            return Some(tokio::spawn(
                async move { engine.handle_ack(request, server).await }.instrument(span),
            ));
        }

        let tx = Arc::new(B2bTransaction::new(request, server, responder));
        match self.transactions.entry(tx.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("{}Retransmission of running transaction {}", tx.log_id(), tx.id());
                return None;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&tx));
            }
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        tx.on_release(move |id| {
            if let Some(engine) = weak.upgrade() {
                engine.transactions.remove(id);
            }
        });

        let ctx = self.context();
        Some(tokio::spawn(tx.run(ctx).instrument(span)))
    }

    async fn handle_ack(&self, mut request: SipMessage, server: TransportInfo) {
        let user_agent = self.config.user_agent.as_deref();
        let route = match self
            .dialogs
            .route_ack(
                &mut request,
                &self.retransmits,
                self.resolver.as_ref(),
                self.client.as_ref(),
                user_agent,
            )
            .await
        {
            Ok(route) => route,
            Err(e) => {
                warn!("Dropping ACK: {}", e);
                return;
            }
        };

        if route.has_sdp {
            let log_id = LogContext::new("b2bua")
                .with_field("CID", request.call_id().unwrap_or("-"))
                .log_id();
            let addresses = SignalingAddresses {
                sent_by: server.remote.ip(),
                packet_source: server.remote.ip(),
                packet_local_interface: interface(server.local, server.external),
                route: route.target.ip(),
                route_local_interface: interface(route.local, self.client.external_address(&route.local)),
            };
            let mut sdp = request.body().to_string();
            match self.relay.handle_sdp(
                &log_id,
                &route.session_id,
                &addresses,
                RequestType::InviteAck,
                &mut sdp,
                &sdp_attributes(&request),
            ) {
                Ok(()) => {
                    request.set_body(sdp.clone());
                    let call_id = request.call_id().unwrap_or_default().to_string();
                    let target_leg = route.target_leg;
                    let updated = self
                        .dialogs
                        .modify(&call_id, &route.session_id, |dialog| dialog.leg_mut(target_leg).local_sdp = sdp);
                    if let Some(dialog) = updated {
                        self.dialogs.persist(&dialog);
                    }
                }
                Err(e) => error!("{}Unable to relay media of ACK: {}", log_id, e),
            }
        }

        let outbound = OutboundRoute {
            local: route.local,
            target: route.target,
            transport: route.transport,
            transport_id: route.transport_id,
            xor: route.xor,
        };
        if let Err(e) = self.client.send_request(&request, &outbound).await {
            warn!(target = %route.target, "Unable to send ACK: {}", e);
        }
    }

    /// Drop the media relay and dialog record of a session
    fn teardown(&self, call_id: &str, session_id: &str) {
        if self.relay.remove_session(session_id) {
            debug!(session_id, "Removed relay session");
        }
        self.dialogs.remove_dialog(call_id, session_id);
    }

    pub fn start_housekeeping(self: &Arc<Self>) {
        let mut slot = self.housekeeping.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.housekeeping_interval.max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let dialogs = engine.dialogs.purge_expired();
                let responses = engine.retransmits.purge_expired();
                if dialogs + responses > 0 {
                    debug!(dialogs, responses, "housekeeping purged expired entries");
                }
            }
        });
        *slot = Some(cancel);
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.housekeeping.lock().take() {
            cancel.cancel();
        }
    }

    fn session_id(tx: &B2bTransaction) -> Option<String> {
        tx.property(props::SESSION_ID)
    }
}

impl Drop for B2bEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl TransactionHooks for B2bEngine {
    async fn on_transaction_created(&self, tx: &B2bTransaction) -> Option<SipMessage> {
        if tx.server_request().max_forwards() == Some(0) {
            let (status, reason) = B2bError::MaxForwardsExceeded.sip_status();
            return Some(tx.server_request().create_response(status, reason));
        }
        None
    }

    async fn on_route(&self, request: &mut SipMessage, tx: &B2bTransaction) -> Result<RouteOutcome> {
        if tx.is_mid_dialog() {
            return Ok(self
                .dialogs
                .route_mid_dialog(
                    request,
                    tx,
                    self.resolver.as_ref(),
                    self.client.as_ref(),
                    self.config.user_agent.as_deref(),
                )
                .await);
        }

        if let Some(replaces) = request.header("replaces").map(str::to_string) {
            match self.dialogs.find_replaces_target(&replaces) {
                Some((leg, _)) => info!("{}Replaces matches leg {}", tx.log_id(), leg.number()),
                None => {
                    return Err(B2bError::NoDialogExists(replaces));
                }
            }
        }

        tx.set_property(props::SESSION_ID, Uuid::new_v4().simple().to_string());
        tx.set_property(props::LEG_INDEX, Leg::One.number().to_string());
        self.policy.route(request, tx).await
    }

    async fn on_process_request_body(&self, request: &mut SipMessage, tx: &B2bTransaction) -> Option<SipMessage> {
        if !request.has_sdp() || tx.property(props::NO_RTP_PROXY).as_deref() == Some("1") {
            return None;
        }
        let request_type = request_type(request.method()?, false)?;
        let session_id = Self::session_id(tx)?;
        let (Some(local), Some(target)) = (tx.local_address(), tx.target_address()) else {
            return None;
        };

        let server = tx.server_transport();
        let addresses = SignalingAddresses {
            sent_by: tx.server_request().top_via_sent_by().unwrap_or(server.remote.ip()),
            packet_source: server.remote.ip(),
            packet_local_interface: interface(server.local, server.external),
            route: target.ip(),
            route_local_interface: interface(local, self.client.external_address(&local)),
        };

        let mut sdp = request.body().to_string();
        match self.relay.handle_sdp(
            tx.log_id(),
            &session_id,
            &addresses,
            request_type,
            &mut sdp,
            &sdp_attributes(request),
        ) {
            Ok(()) => {
                request.set_body(sdp);
                None
            }
            Err(e) => {
                error!("{}Unable to relay media: {}", tx.log_id(), e);
                if !tx.is_mid_dialog() {
                    if let Some(call_id) = request.call_id() {
                        self.teardown(call_id, &session_id);
                    }
                }
                let (status, reason) = B2bError::from(e).sip_status();
                Some(tx.server_request().create_response(status, reason))
            }
        }
    }

    async fn on_process_outbound(&self, request: &mut SipMessage, tx: &B2bTransaction) {
        let max_forwards = request.max_forwards().unwrap_or(DEFAULT_MAX_FORWARDS);
        request.set_header("Max-Forwards", max_forwards.saturating_sub(1).to_string());

        if tx.is_mid_dialog() {
            return;
        }
        let (Some(local), Some(session_id)) = (tx.local_address(), Self::session_id(tx)) else {
            return;
        };
        let advertised = SocketAddr::new(
            self.client.external_address(&local).unwrap_or(local.ip()),
            local.port(),
        );

        for name in ["via", "route", "record-route"] {
            request.remove_header(name);
        }
        let branch = format!("z9hG4bK{}", Uuid::new_v4().simple());
        request.prepend_header("Via", contact::construct_via(tx.target_transport(), advertised, &branch));

        if request.has_header("contact") {
            let contact = contact::session_contact(&session_id, Leg::Two, advertised);
            request.set_header("Contact", contact.clone());
            tx.set_property(props::LEG2_CONTACT, contact);
        }
        if let Some(agent) = &self.config.user_agent {
            request.set_header("User-Agent", agent.clone());
        }
    }

    async fn reformat_response(&self, response: &SipMessage, tx: &B2bTransaction) -> Option<SipMessage> {
        if let Some(session_id) = Self::session_id(tx) {
            if tx.is_mid_dialog() {
                self.dialogs.on_update_mid_call_uac_state(response, tx, &session_id);
            } else {
                self.dialogs.on_update_initial_uac_state(response, tx, &session_id);
            }
        }
        if response.is_2xx() && tx.server_request().is_method("INVITE") {
            self.retransmits.insert(response);
        }
        Some(transaction::reformat(tx.server_request(), response))
    }

    async fn on_process_response_body(&self, response: &mut SipMessage, tx: &B2bTransaction) {
        if !response.has_sdp() || tx.property(props::NO_RTP_PROXY).as_deref() == Some("1") {
            return;
        }
        let Some(request_type) = tx.server_request().method().and_then(|m| request_type(m, true)) else {
            return;
        };
        let (Some(session_id), Some(client)) = (Self::session_id(tx), tx.client_transport()) else {
            return;
        };

        let server = tx.server_transport();
        let external = client.external.or_else(|| self.client.external_address(&client.local));
        let addresses = SignalingAddresses {
            sent_by: client.remote.ip(),
            packet_source: client.remote.ip(),
            packet_local_interface: interface(client.local, external),
            route: server.remote.ip(),
            route_local_interface: interface(server.local, server.external),
        };

        let mut sdp = response.body().to_string();
        match self.relay.handle_sdp(
            tx.log_id(),
            &session_id,
            &addresses,
            request_type,
            &mut sdp,
            &sdp_attributes(response),
        ) {
            Ok(()) => response.set_body(sdp),
            Err(e) => {
                error!("{}Unable to relay media of response: {}", tx.log_id(), e);
                let (status, reason) = B2bError::from(e).sip_status();
                *response = tx.server_request().create_response(status, reason);
                if !tx.is_mid_dialog() {
                    self.teardown(tx.server_request().call_id().unwrap_or_default(), &session_id);
                }
            }
        }
    }

    async fn on_process_response_outbound(&self, response: &mut SipMessage, tx: &B2bTransaction) {
        let Some(session_id) = Self::session_id(tx) else {
            return;
        };
        if tx.is_mid_dialog() {
            self.dialogs.on_update_mid_call_uas_state(response, tx, &session_id);
        } else {
            self.dialogs.on_update_initial_uas_state(response, tx, &session_id);
        }

        if tx.server_request().is_method("BYE") && !response.is_1xx() {
            info!("{}Session {} ended", tx.log_id(), session_id);
            self.teardown(tx.server_request().call_id().unwrap_or_default(), &session_id);
        }
    }

    async fn on_transaction_error(
        &self,
        tx: &B2bTransaction,
        error: Option<&B2bError>,
        response: Option<&SipMessage>,
    ) {
        let request = tx.server_request();
        match (error, response) {
            (Some(e), _) => warn!("{}Transaction failed: {}", tx.log_id(), e),
            (None, Some(r)) => debug!("{}Error response {}", tx.log_id(), r.status().unwrap_or(0)),
            (None, None) => {}
        }
        let ends_session = (request.is_method("INVITE") && !tx.is_mid_dialog()) || request.is_method("BYE");
        if !ends_session {
            return;
        }
        if let Some(session_id) = Self::session_id(tx) {
            self.teardown(request.call_id().unwrap_or_default(), &session_id);
        }
    }
}
