//! Capture of leg state from responses
//!
//! The UAC updates run on the response received from the next hop, the UAS
//! updates on the response about to go back to the caller. For an initial
//! request the UAC update creates the record and the UAS update completes it;
//! the UAS side therefore finds nothing to update when the UAC update did not
//! run first.

use sbc_media_core::Leg;
use tracing::{debug, error};

use super::store::DialogStore;
use crate::contact;
use crate::message::SipMessage;
use crate::transaction::{B2bTransaction, props};

fn sdp_of(message: &SipMessage) -> Option<String> {
    message.has_sdp().then(|| message.body().to_string())
}

fn leg_index(tx: &B2bTransaction) -> Option<Leg> {
    match tx.property(props::LEG_INDEX)?.as_str() {
        "1" => Some(Leg::One),
        "2" => Some(Leg::Two),
        _ => None,
    }
}

impl DialogStore {
    /// Response to an initial request, on its way back to the caller.
    ///
    /// Installs the session contact for leg 1 and records the leg once the
    /// response establishes a dialog. Error responses drop the session.
    pub fn on_update_initial_uas_state(&self, response: &mut SipMessage, tx: &B2bTransaction, session_id: &str) {
        if !response.is_3xx() {
            response.remove_header("contact");
        }
        if response.is_trying() {
            return;
        }

        if !response.is_3xx() {
            contact::transform(response, session_id, Leg::One, tx.server_transport().advertised());
        }

        if response.is_mid_dialog() && (response.is_2xx() || response.is_1xx()) {
            let Some(matched) = self.find_dialog(response, Some(session_id)) else {
                return;
            };
            let request = tx.server_request();
            let server = tx.server_transport();
            let no_rtp_proxy = tx.property(props::NO_RTP_PROXY).as_deref() == Some("1");
            let call_id = response.call_id().unwrap_or_default().to_string();
            let response = &*response;

            let updated = self.modify(&call_id, &matched.session_id, |dialog| {
                let leg1 = &mut dialog.leg1;
                leg1.call_id = call_id.clone();
                leg1.from = response.header("to").unwrap_or_default().to_string();
                leg1.to = response.header("from").unwrap_or_default().to_string();
                leg1.remote_contact = request.header("contact").unwrap_or_default().to_string();
                leg1.local_contact = response.header("contact").unwrap_or_default().to_string();
                leg1.remote_ip = server.remote.to_string();
                leg1.transport_id = server.id.clone();
                leg1.target_transport = server.transport.as_str().to_string();
                if let Some(sdp) = sdp_of(response) {
                    leg1.local_sdp = sdp;
                }
                if let Some(sdp) = sdp_of(request) {
                    leg1.remote_sdp = sdp;
                }
                let record_routes = response.header_list("record-route");
                if !record_routes.is_empty() {
                    leg1.route_set = record_routes.into_iter().rev().collect();
                }
                leg1.xor_encrypted = server.xor;
                leg1.no_rtp_proxy = no_rtp_proxy;
            });
            let Some(mut dialog) = updated else {
                return;
            };
            dialog.session_id = session_id.to_string();

            debug!("{}Saving leg 1 of session {}", tx.log_id(), session_id);
            self.persist(&dialog);
        } else if response.is_error_response() {
            if let Some(call_id) = response.call_id() {
                self.remove_dialog(call_id, session_id);
            }
        }
    }

    /// Response from the callee to an initial request
    pub fn on_update_initial_uac_state(&self, response: &SipMessage, tx: &B2bTransaction, session_id: &str) {
        if response.is_trying() || !response.is_mid_dialog() || !(response.is_2xx() || response.is_1xx()) {
            return;
        }
        let Some(local_contact) = tx.property(props::LEG2_CONTACT) else {
            error!("{}Unable to save dialog state for leg 2 - missing contact", tx.log_id());
            return;
        };
        let Some(client) = tx.client_transport() else {
            error!("{}Unable to save dialog state for leg 2 - no client transport", tx.log_id());
            return;
        };

        let call_id = response.call_id().unwrap_or_default().to_string();
        let client_sdp = tx.client_request().as_ref().and_then(sdp_of);
        let local_record_route = tx.property(props::LEG2_RR).unwrap_or_default();
        let no_rtp_proxy = tx.property(props::NO_RTP_PROXY).as_deref() == Some("1");

        let dialog = self.upsert(&call_id, session_id, |dialog| {
            let leg2 = &mut dialog.leg2;
            leg2.call_id = call_id.clone();
            leg2.from = response.header("from").unwrap_or_default().to_string();
            leg2.to = response.header("to").unwrap_or_default().to_string();
            leg2.remote_contact = response.header("contact").unwrap_or_default().to_string();
            leg2.local_cseq = response.cseq().map(|(number, _)| number).unwrap_or_default();
            leg2.local_contact = local_contact;
            leg2.local_record_route = local_record_route;
            leg2.remote_ip = client.remote.to_string();
            leg2.transport_id = client.id.clone();
            leg2.target_transport = client.transport.as_str().to_string();
            if let Some(sdp) = sdp_of(response) {
                leg2.remote_sdp = sdp;
            }
            if let Some(sdp) = client_sdp {
                leg2.local_sdp = sdp;
            }
            leg2.no_rtp_proxy = no_rtp_proxy;
            let record_routes = response.header_list("record-route");
            if !record_routes.is_empty() {
                leg2.route_set = record_routes;
            }
            leg2.xor_encrypted = client.xor;
        });

        debug!("{}Saving leg 2 of session {}", tx.log_id(), session_id);
        self.persist(&dialog);
    }

    /// Response to a mid-dialog request, on its way back to the sender
    pub fn on_update_mid_call_uas_state(&self, response: &mut SipMessage, tx: &B2bTransaction, session_id: &str) {
        response.remove_header("contact");
        if response.is_trying() {
            return;
        }
        let Some(sender) = leg_index(tx) else {
            error!("{}Mid-dialog response without a leg index", tx.log_id());
            return;
        };
        contact::transform(response, session_id, sender, tx.server_transport().advertised());

        if !response.is_2xx() {
            return;
        }
        let Some(matched) = self.find_dialog(response, Some(session_id)) else {
            return;
        };
        let request = tx.server_request();
        let server = tx.server_transport();
        let call_id = response.call_id().unwrap_or_default().to_string();
        let response = &*response;
        let updated = self.modify(&call_id, &matched.session_id, |dialog| {
            let leg = dialog.leg_mut(sender);
            leg.remote_contact = request.header("contact").unwrap_or_default().to_string();
            leg.remote_ip = server.remote.to_string();
            leg.transport_id = server.id.clone();
            if let Some(sdp) = sdp_of(response) {
                leg.local_sdp = sdp;
            }
            if let Some(sdp) = sdp_of(request) {
                leg.remote_sdp = sdp;
            }
        });
        if let Some(dialog) = updated {
            self.persist(&dialog);
        }
    }

    /// Response from the far leg to a forwarded mid-dialog request.
    ///
    /// A 2xx refreshes the CSeq used toward the far leg and its SDP view.
    pub fn on_update_mid_call_uac_state(&self, response: &SipMessage, tx: &B2bTransaction, session_id: &str) {
        if !response.is_2xx() {
            return;
        }
        let Some(sender) = leg_index(tx) else {
            error!("{}Mid-dialog response without a leg index", tx.log_id());
            return;
        };
        let Some(matched) = self.find_dialog(response, Some(session_id)) else {
            return;
        };
        let call_id = response.call_id().unwrap_or_default().to_string();
        let client_sdp = tx.client_request().as_ref().and_then(sdp_of);
        let updated = self.modify(&call_id, &matched.session_id, |dialog| {
            let far = dialog.leg_mut(sender.other());
            if let Some((number, _)) = response.cseq() {
                far.local_cseq = number;
            }
            if let Some(sdp) = sdp_of(response) {
                far.remote_sdp = sdp;
            }
            if let Some(sdp) = client_sdp {
                far.local_sdp = sdp;
            }
        });
        if let Some(dialog) = updated {
            self.persist(&dialog);
        }
    }
}
