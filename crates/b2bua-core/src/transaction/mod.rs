//! Back-to-back transactions
//!
//! A [`B2bTransaction`] pairs one server transaction (the inbound request) with
//! the client transaction the agent sends in its place. It runs as a single
//! task: route, process the body, send, then relay responses back in arrival
//! order until a final response or a failure ends it.
//!
//! ```text
//! Idle ──send──▶ RequestSent ──response──▶ ResponseReceived ──final──▶ Terminated
//!                    │  ▲
//!                    └──┘ failover: new branch, next candidate
//! ```
//!
//! Failover only applies to initial requests. A transport error, a silent
//! candidate or a 5xx final response moves to the next candidate of the same
//! transport while the budget allows. The server side never sees more than one
//! final response.

pub mod failover;
pub mod hooks;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sbc_infra_common::LogContext;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::B2bError;
use crate::message::{SipMessage, SipUri};
use crate::resolver::{Resolver, resolve_target};
use crate::transport::{ClientTransport, OutboundRoute, ServerResponder, Transport, TransportInfo};

pub use failover::{FailoverCursor, next_branch};
pub use hooks::{ForwardTarget, RouteOutcome, TransactionHooks};

/// Well-known property keys
pub mod props {
    pub const TARGET_ADDRESS: &str = "target-address";
    pub const TARGET_TRANSPORT: &str = "target-transport";
    pub const TARGET_PORT: &str = "target-port";
    pub const LOCAL_ADDRESS: &str = "local-address";
    pub const XOR: &str = "xor";
    pub const PEER_XOR: &str = "peer-xor";
    pub const LEG_INDEX: &str = "leg-index";
    pub const SESSION_ID: &str = "session-id";
    pub const LEG_IDENTIFIER: &str = "leg-identifier";
    pub const NO_RTP_PROXY: &str = "no-rtp-proxy";
    pub const LEG2_CONTACT: &str = "leg2-contact";
    pub const LEG2_RR: &str = "leg2-rr";
    pub const RESPONSE_TARGET: &str = "response-target";
    pub const RESPONSE_INTERFACE: &str = "response-interface";
    pub const INVOKE_LOCAL_HANDLER: &str = "invoke-local-handler";
    pub const GENERATE_LOCAL_RESPONSE: &str = "generate-local-response";
    pub const TRANSPORT_ID: &str = "transport-id";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    RequestSent,
    ResponseReceived,
    Terminated,
}

/// Timers and budget applied to client requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTimers {
    /// Wait for the first response from one candidate
    pub attempt_timeout: Duration,
    /// Wait for the final response once anything was received
    pub final_response_timeout: Duration,
    pub max_failover: usize,
}

impl Default for TransactionTimers {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(8),
            final_response_timeout: Duration::from_secs(180),
            max_failover: 3,
        }
    }
}

/// What a transaction needs from its owner
#[derive(Clone)]
pub struct TransactionContext {
    pub hooks: Arc<dyn TransactionHooks>,
    pub client: Arc<dyn ClientTransport>,
    pub resolver: Arc<dyn Resolver>,
    pub timers: TransactionTimers,
}

type ReleaseCallback = Box<dyn FnOnce(&str) + Send>;

enum AttemptFailure {
    Transport(B2bError),
    Timeout,
    ServerError(SipMessage),
}

enum AttemptOutcome {
    Completed,
    Failed(AttemptFailure),
}

/// Response for the server side built from a client response
///
/// The dialog identifying headers come from the server request, the To tag and
/// everything else from the client response. Record-Route stays on its leg.
pub fn reformat(server_request: &SipMessage, response: &SipMessage) -> SipMessage {
    let status = response.status().unwrap_or(500);
    let mut reformatted = server_request.create_response(status, response.reason().unwrap_or(""));
    if let Some(to) = response.header("to") {
        reformatted.set_header("To", to);
    }
    for header in response.headers() {
        match header.name.to_ascii_lowercase().as_str() {
            "via" | "v" | "from" | "f" | "to" | "t" | "call-id" | "i" | "cseq" | "record-route"
            | "content-length" | "l" => {}
            _ => reformatted.add_header(&header.name, header.value.clone()),
        }
    }
    reformatted.set_body(response.body());
    reformatted
}

pub struct B2bTransaction {
    id: String,
    log_id: String,
    server_request: SipMessage,
    server: TransportInfo,
    responder: Arc<dyn ServerResponder>,
    mid_dialog: bool,
    client_request: Mutex<Option<SipMessage>>,
    client: Mutex<Option<TransportInfo>>,
    properties: RwLock<HashMap<String, String>>,
    state: Mutex<TransactionState>,
    sent_local_response: AtomicBool,
    released: AtomicBool,
    on_release: Mutex<Option<ReleaseCallback>>,
}

impl std::fmt::Debug for B2bTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2bTransaction")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("mid_dialog", &self.mid_dialog)
            .finish()
    }
}

impl B2bTransaction {
    pub fn new(request: SipMessage, server: TransportInfo, responder: Arc<dyn ServerResponder>) -> Self {
        let method = request.method().unwrap_or("UNKNOWN").to_string();
        let id = match request.top_via_branch() {
            Some(branch) => format!("{branch}-{method}"),
            None => format!("{}-{method}", Uuid::new_v4().simple()),
        };
        let log_id = LogContext::new("b2bua")
            .with_field("CID", request.call_id().unwrap_or("-"))
            .log_id();
        let mid_dialog = request.is_mid_dialog();
        Self {
            id,
            log_id,
            server_request: request,
            server,
            responder,
            mid_dialog,
            client_request: Mutex::new(None),
            client: Mutex::new(None),
            properties: RwLock::new(HashMap::new()),
            state: Mutex::new(TransactionState::Idle),
            sent_local_response: AtomicBool::new(false),
            released: AtomicBool::new(false),
            on_release: Mutex::new(None),
        }
    }

    /// Run `callback` with the transaction id when the transaction ends
    pub fn on_release(&self, callback: impl FnOnce(&str) + Send + 'static) {
        *self.on_release.lock() = Some(Box::new(callback));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn server_request(&self) -> &SipMessage {
        &self.server_request
    }

    pub fn server_transport(&self) -> &TransportInfo {
        &self.server
    }

    /// The request as last sent toward the next hop
    pub fn client_request(&self) -> Option<SipMessage> {
        self.client_request.lock().clone()
    }

    pub fn client_transport(&self) -> Option<TransportInfo> {
        self.client.lock().clone()
    }

    pub fn is_mid_dialog(&self) -> bool {
        self.mid_dialog
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn set_property(&self, key: &str, value: impl Into<String>) {
        if key.is_empty() {
            return;
        }
        self.properties.write().insert(key.to_string(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.read().get(key).cloned()
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.read().contains_key(key)
    }

    fn flag(&self, key: &str) -> bool {
        self.property(key).as_deref() == Some("1")
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Terminate and notify the owner. Only the first call has an effect.
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(TransactionState::Terminated);
        debug!("{}B2B Transaction TERMINATED - {}", self.log_id, self.id);
        if let Some(callback) = self.on_release.lock().take() {
            callback(&self.id);
        }
    }

    async fn respond(&self, response: &SipMessage) {
        if let Err(e) = self.responder.send_response(response).await {
            error!("{}Unable to send response: {}", self.log_id, e);
        }
    }

    async fn respond_with(&self, status: u16, reason: &str) {
        let response = self.server_request.create_response(status, reason);
        self.respond(&response).await;
    }

    /// Run the transaction to completion
    pub async fn run(self: Arc<Self>, ctx: TransactionContext) {
        info!("{}B2B Transaction CREATED - {}", self.log_id, self.id);
        self.execute(&ctx).await;
        self.release();
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let hooks = &ctx.hooks;

        if let Some(response) = hooks.on_transaction_created(self).await {
            self.respond(&response).await;
            return;
        }

        if let Some(challenge) = hooks.on_authenticate(self).await {
            self.respond(&challenge).await;
            return;
        }

        let mut request = self.server_request.clone();
        let forward = match hooks.on_route(&mut request, self).await {
            Ok(RouteOutcome::Forward(forward)) => forward,
            Ok(RouteOutcome::Respond(response)) => {
                if response.is_response() {
                    self.respond(&response).await;
                }
                return;
            }
            Err(e) => {
                warn!("{}{}", self.log_id, e);
                let (status, reason) = e.sip_status();
                self.respond_with(status, reason).await;
                return;
            }
        };

        if self.flag(props::INVOKE_LOCAL_HANDLER) {
            let response = match hooks.on_invoke_local_handler(self).await {
                Some(response) => response,
                None => self.server_request.create_response(500, "No local handler specified"),
            };
            self.respond(&response).await;
            return;
        }

        let local = forward.local;
        if local.ip().is_unspecified() || (!local.ip().is_loopback() && !ctx.client.is_local_interface(&local)) {
            error!(
                "{}Invalid Local-Interface returned by on_route - {}",
                self.log_id, local
            );
            self.respond_with(500, "Unable to determine local interface").await;
            return;
        }

        let (target, transport, candidates) = match forward.target {
            Some(target) => {
                let transport = forward.transport.unwrap_or_default();
                (target, transport, vec![target])
            }
            None => {
                let uri = match request.request_uri().map(SipUri::parse) {
                    Some(Ok(uri)) => uri,
                    _ => {
                        self.respond_with(400, "Bad Request URI").await;
                        return;
                    }
                };
                match resolve_target(ctx.resolver.as_ref(), &uri, forward.transport).await {
                    Ok(resolved) => (resolved.target, resolved.transport, resolved.candidates),
                    Err(e) => {
                        warn!("{}Unable to resolve {}: {}", self.log_id, uri, e);
                        let (status, reason) = e.sip_status();
                        self.respond_with(status, reason).await;
                        return;
                    }
                }
            }
        };

        if target.ip().is_unspecified() || target.port() == 0 {
            error!("{}Invalid Outbound-Target returned by on_route", self.log_id);
            self.respond_with(500, "Internal Server Error").await;
            return;
        }

        if !self.has_property(props::TARGET_TRANSPORT) {
            self.set_property(props::TARGET_TRANSPORT, transport.as_str());
        }

        if self.flag(props::GENERATE_LOCAL_RESPONSE) {
            if let Some(mut response) = hooks.on_generate_local_response(self).await {
                hooks.on_process_response_outbound(&mut response, self).await;
                self.sent_local_response.store(true, Ordering::Release);
                self.respond(&response).await;
            }
        }

        self.set_property(props::TARGET_ADDRESS, target.to_string());
        self.set_property(props::LOCAL_ADDRESS, local.to_string());

        if !request.body().is_empty() {
            let server_xor = if self.server.xor { "1" } else { "0" };
            self.set_property(props::PEER_XOR, server_xor);
            if let Some(response) = hooks.on_process_request_body(&mut request, self).await {
                if response.is_response() {
                    self.respond(&response).await;
                }
                return;
            }
        }

        hooks.on_process_outbound(&mut request, self).await;

        let xor = self.flag(props::XOR);
        let transport_id = forward.transport_id.clone();
        let mut cursor = FailoverCursor::new(candidates, ctx.timers.max_failover);
        let mut next = Some(target);

        while let Some(target) = next.take() {
            let route = OutboundRoute {
                local,
                target,
                transport,
                transport_id: transport_id.clone(),
                xor,
            };
            *self.client_request.lock() = Some(request.clone());
            let can_failover = !self.mid_dialog && cursor.has_next();

            let failure = match self.attempt(&request, &route, can_failover, ctx).await {
                AttemptOutcome::Completed => return,
                AttemptOutcome::Failed(failure) => failure,
            };

            if can_failover {
                if let Some(candidate) = cursor.advance() {
                    let old = request.top_via_branch().unwrap_or_default();
                    let branch = next_branch(&old);
                    if let Err(e) = request.set_top_via_branch(&branch) {
                        warn!("{}Unable to rewrite Via branch: {}", self.log_id, e);
                    }
                    info!(
                        "{}Failover from {} to {} (attempt {})",
                        self.log_id,
                        target,
                        candidate,
                        cursor.attempts()
                    );
                    self.set_property(props::TARGET_ADDRESS, candidate.to_string());
                    next = Some(candidate);
                    continue;
                }
            }

            self.fail(failure, cursor.attempts(), ctx).await;
        }
    }

    /// Report a failure that no further candidate can absorb
    async fn fail(&self, failure: AttemptFailure, attempts: usize, ctx: &TransactionContext) {
        match failure {
            AttemptFailure::ServerError(response) => self.handle_response(response, ctx).await,
            AttemptFailure::Timeout => {
                let error = B2bError::transport("request timed out");
                ctx.hooks.on_transaction_error(self, Some(&error), None).await;
                if attempts > 1 {
                    self.respond_with(480, "All Routes Exhausted").await;
                } else {
                    self.respond_with(408, "Request Timeout").await;
                }
            }
            AttemptFailure::Transport(error) => {
                ctx.hooks.on_transaction_error(self, Some(&error), None).await;
                if attempts > 1 {
                    self.respond_with(480, "All Routes Exhausted").await;
                } else {
                    let (status, reason) = error.sip_status();
                    self.respond_with(status, reason).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &SipMessage,
        route: &OutboundRoute,
        can_failover: bool,
        ctx: &TransactionContext,
    ) -> AttemptOutcome {
        debug!("{}Sending {} to {}", self.log_id, request.method().unwrap_or("?"), route.target);
        let mut flow = match ctx.client.send_request(request, route).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!("{}Unable to send request to {}: {}", self.log_id, route.target, e);
                return AttemptOutcome::Failed(AttemptFailure::Transport(e));
            }
        };
        *self.client.lock() = Some(flow.info.clone());
        self.set_state(TransactionState::RequestSent);

        let started = Instant::now();
        let attempt_deadline = started + ctx.timers.attempt_timeout;
        let final_deadline = started + ctx.timers.final_response_timeout;
        let mut received = false;

        loop {
            let deadline = if received { final_deadline } else { attempt_deadline };
            let response = match tokio::time::timeout_at(deadline, flow.responses.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) if !received => {
                    return AttemptOutcome::Failed(AttemptFailure::Transport(B2bError::transport(
                        "connection closed before any response",
                    )));
                }
                Ok(None) => {
                    warn!("{}Connection closed before the final response", self.log_id);
                    let error = B2bError::transport("connection closed");
                    ctx.hooks.on_transaction_error(self, Some(&error), None).await;
                    self.respond_with(503, "Service Unavailable").await;
                    return AttemptOutcome::Completed;
                }
                Err(_) if !received => {
                    warn!("{}No response from {}", self.log_id, route.target);
                    return AttemptOutcome::Failed(AttemptFailure::Timeout);
                }
                Err(_) => {
                    warn!("{}No final response from {}", self.log_id, route.target);
                    let error = B2bError::transport("final response timed out");
                    ctx.hooks.on_transaction_error(self, Some(&error), None).await;
                    self.respond_with(408, "Request Timeout").await;
                    return AttemptOutcome::Completed;
                }
            };

            self.set_state(TransactionState::ResponseReceived);
            if response.is_5xx() && can_failover {
                debug!(
                    "{}{} from {}, trying next candidate",
                    self.log_id,
                    response.status().unwrap_or(0),
                    route.target
                );
                return AttemptOutcome::Failed(AttemptFailure::ServerError(response));
            }

            received = true;
            let is_final = !response.is_1xx();
            self.handle_response(response, ctx).await;
            if is_final {
                return AttemptOutcome::Completed;
            }
        }
    }

    /// Relay one client response to the server side
    async fn handle_response(&self, response: SipMessage, ctx: &TransactionContext) {
        let hooks = &ctx.hooks;
        hooks.on_process_response_inbound(&response, self).await;

        if self.sent_local_response.load(Ordering::Acquire) {
            return;
        }

        if response.is_error_response() {
            hooks.on_transaction_error(self, None, Some(&response)).await;
            if let Some(mut reformatted) = hooks.reformat_response(&response, self).await {
                hooks.on_process_response_outbound(&mut reformatted, self).await;
                self.respond(&reformatted).await;
            }
        } else if response.is_1xx() {
            if response.is_trying() {
                return;
            }
            if let Some(mut reformatted) = hooks.reformat_response(&response, self).await {
                if !reformatted.body().is_empty() {
                    hooks.on_process_response_body(&mut reformatted, self).await;
                }
                hooks.on_process_response_outbound(&mut reformatted, self).await;
                self.respond(&reformatted).await;
            }
        } else if response.is_2xx() {
            self.set_property(props::RESPONSE_TARGET, self.server.remote.to_string());
            self.set_property(props::RESPONSE_INTERFACE, self.server.local.to_string());
            if let Some(mut reformatted) = hooks.reformat_response(&response, self).await {
                if !reformatted.body().is_empty() {
                    hooks.on_process_response_body(&mut reformatted, self).await;
                }
                hooks.on_process_response_outbound(&mut reformatted, self).await;
                self.respond(&reformatted).await;
            }
        }
    }

    /// Local interface the client request leaves from
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.property(props::LOCAL_ADDRESS).and_then(|v| v.parse().ok())
    }

    /// Next hop of the client request
    pub fn target_address(&self) -> Option<SocketAddr> {
        self.property(props::TARGET_ADDRESS).and_then(|v| v.parse().ok())
    }

    pub fn target_transport(&self) -> Transport {
        self.property(props::TARGET_TRANSPORT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}
