use std::fmt;

use serde::{Deserialize, Serialize};

/// SIP event that carried the SDP body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Invite,
    InviteResponse,
    InviteAck,
    Update,
    UpdateResponse,
    Prack,
    PrackResponse,
}

impl RequestType {
    /// Only these may create a relay session
    pub fn creates_session(self) -> bool {
        matches!(self, RequestType::Invite | RequestType::InviteResponse)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Invite => "INVITE",
            RequestType::InviteResponse => "INVITE_RESPONSE",
            RequestType::InviteAck => "INVITE_ACK",
            RequestType::Update => "UPDATE",
            RequestType::UpdateResponse => "UPDATE_RESPONSE",
            RequestType::Prack => "PRACK",
            RequestType::PrackResponse => "PRACK_RESPONSE",
        };
        f.write_str(name)
    }
}

/// Offer/answer progress of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    #[default]
    Idle,
    WaitingAnswerResponse,
    WaitingAnswerAckOrPrack,
    OfferWaitingAuthentication,
    AnswerRequiredAuthentication,
    WaitingUpdateAnswer,
    WaitingPrackAnswer,
    Negotiated,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "IDLE",
            NegotiationState::WaitingAnswerResponse => "INVITE_WAITING_ANSWER_RESPONSE",
            NegotiationState::WaitingAnswerAckOrPrack => "INVITE_WAITING_ANSWER_ACK_OR_PRACK",
            NegotiationState::OfferWaitingAuthentication => "OFFER_WAITING_AUTHENTICATION",
            NegotiationState::AnswerRequiredAuthentication => "ANSWER_REQUIRED_AUTHENTICATION",
            NegotiationState::WaitingUpdateAnswer => "UPDATE_WAITING_ANSWER",
            NegotiationState::WaitingPrackAnswer => "PRACK_WAITING_ANSWER",
            NegotiationState::Negotiated => "NEGOTIATED",
        };
        f.write_str(name)
    }
}

/// What the session does with the SDP body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpAction {
    /// Fresh offer: allocate relays and rewrite toward leg 2
    InitialOffer,
    /// Offer on an existing session
    Offer,
    /// Offer on a negotiated session; proxying is forced if it was before
    ReOffer,
    /// Answer to the outstanding offer
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: SdpAction,
    pub next: NegotiationState,
}

impl Transition {
    const fn new(action: SdpAction, next: NegotiationState) -> Self {
        Self { action, next }
    }
}

/// Transition table of the negotiation state machine.
///
/// `None` means the body is ignored and the state is left unchanged.
pub fn transition(state: NegotiationState, request: RequestType) -> Option<Transition> {
    use NegotiationState as S;
    use RequestType as R;
    use SdpAction as A;

    let t = match (state, request) {
        (S::Idle, R::Invite) => Transition::new(A::InitialOffer, S::WaitingAnswerResponse),
        (S::Idle, R::InviteResponse) => Transition::new(A::InitialOffer, S::WaitingAnswerAckOrPrack),

        (S::WaitingAnswerResponse, R::InviteResponse) => Transition::new(A::Answer, S::Negotiated),

        (S::WaitingAnswerAckOrPrack, R::InviteAck | R::Prack) => Transition::new(A::Answer, S::Negotiated),

        (S::OfferWaitingAuthentication, R::Invite) => {
            Transition::new(A::Offer, S::AnswerRequiredAuthentication)
        }
        (S::AnswerRequiredAuthentication, R::InviteResponse) => Transition::new(A::Answer, S::Negotiated),

        (S::WaitingUpdateAnswer, R::UpdateResponse) => Transition::new(A::Answer, S::Negotiated),
        (S::WaitingPrackAnswer, R::PrackResponse) => Transition::new(A::Answer, S::Negotiated),

        (S::Negotiated, R::Invite) => Transition::new(A::ReOffer, S::WaitingAnswerResponse),
        (S::Negotiated, R::InviteResponse) => Transition::new(A::ReOffer, S::WaitingAnswerAckOrPrack),
        (S::Negotiated, R::Update) => Transition::new(A::ReOffer, S::WaitingUpdateAnswer),
        (S::Negotiated, R::Prack) => Transition::new(A::ReOffer, S::WaitingPrackAnswer),

        _ => return None,
    };
    Some(t)
}
