//! Extension points called while a transaction runs

use std::net::SocketAddr;

use async_trait::async_trait;

use super::B2bTransaction;
use crate::error::{B2bError, Result};
use crate::message::SipMessage;
use crate::transport::Transport;

/// Where a routed request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Local interface the request leaves from
    pub local: SocketAddr,
    /// Next hop; `None` resolves the request-URI
    pub target: Option<SocketAddr>,
    pub transport: Option<Transport>,
    /// Existing connection to reuse
    pub transport_id: Option<String>,
}

impl ForwardTarget {
    pub fn new(local: SocketAddr, target: Option<SocketAddr>) -> Self {
        Self {
            local,
            target,
            transport: None,
            transport_id: None,
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// Result of routing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Forward(ForwardTarget),
    /// Answer the request locally with this response
    Respond(SipMessage),
}

/// Callbacks driving a [`B2bTransaction`].
///
/// Only routing is mandatory. A callback returning a response ends the
/// transaction with that response.
#[async_trait]
pub trait TransactionHooks: Send + Sync {
    async fn on_transaction_created(&self, _tx: &B2bTransaction) -> Option<SipMessage> {
        None
    }

    /// Challenge the request, e.g. with a 407
    async fn on_authenticate(&self, _tx: &B2bTransaction) -> Option<SipMessage> {
        None
    }

    async fn on_route(&self, request: &mut SipMessage, tx: &B2bTransaction) -> Result<RouteOutcome>;

    async fn on_process_request_body(&self, _request: &mut SipMessage, _tx: &B2bTransaction) -> Option<SipMessage> {
        None
    }

    /// Last change to the client request before it is sent
    async fn on_process_outbound(&self, _request: &mut SipMessage, _tx: &B2bTransaction) {}

    async fn on_process_response_inbound(&self, _response: &SipMessage, _tx: &B2bTransaction) {}

    /// Turn a client response into the response for the server side
    async fn reformat_response(&self, response: &SipMessage, tx: &B2bTransaction) -> Option<SipMessage> {
        Some(super::reformat(tx.server_request(), response))
    }

    async fn on_process_response_body(&self, _response: &mut SipMessage, _tx: &B2bTransaction) {}

    async fn on_process_response_outbound(&self, _response: &mut SipMessage, _tx: &B2bTransaction) {}

    /// Called once the transaction fails, with the error or the final error
    /// response that caused it
    async fn on_transaction_error(
        &self,
        _tx: &B2bTransaction,
        _error: Option<&B2bError>,
        _response: Option<&SipMessage>,
    ) {
    }

    async fn on_invoke_local_handler(&self, _tx: &B2bTransaction) -> Option<SipMessage> {
        None
    }

    async fn on_generate_local_response(&self, _tx: &B2bTransaction) -> Option<SipMessage> {
        None
    }
}
