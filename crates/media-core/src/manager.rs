//! Relay session registry
//!
//! [`RelayManager`] owns every [`RelaySession`], the port allocator and the
//! housekeeping sweep that collects sessions whose media went quiet. The map
//! lock is only held to look up or insert a session; SDP processing runs under
//! the session's own lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{MediaError, Result};
use crate::ports::PortAllocator;
use crate::session::{NegotiationState, RelaySession, RequestType, SdpAttributes, SignalingAddresses};

/// Shared handle to a session
pub type SessionHandle = Arc<Mutex<RelaySession>>;

pub struct RelayManager {
    config: RelayConfig,
    ports: Arc<PortAllocator>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    route_counters: DashMap<String, usize>,
    housekeeping: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for RelayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager")
            .field("sessions", &self.session_count())
            .field("port_base", &self.ports.base())
            .field("port_max", &self.ports.max())
            .finish()
    }
}

impl RelayManager {
    pub fn new(config: RelayConfig) -> Self {
        let ports = Arc::new(PortAllocator::new(config.port_base, config.port_max));
        Self {
            config,
            ports,
            sessions: Mutex::new(HashMap::new()),
            route_counters: DashMap::new(),
            housekeeping: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Next even data port; the odd port above it carries control
    pub fn next_port_tuple(&self) -> u16 {
        self.ports.next_port_tuple()
    }

    /// Process an SDP body for `session_id`, rewriting it in place.
    ///
    /// INVITE and INVITE responses create the session when needed; any other
    /// request type needs an existing one. Must be called from within a Tokio
    /// runtime since negotiated relays spawn their receive tasks.
    pub fn handle_sdp(
        &self,
        log_id: &str,
        session_id: &str,
        addresses: &SignalingAddresses,
        request_type: RequestType,
        sdp: &mut String,
        attributes: &SdpAttributes,
    ) -> Result<()> {
        debug!(
            session_id,
            sent_by = %addresses.sent_by,
            remote_src = %addresses.packet_source,
            local_src = %addresses.packet_local_interface.ip,
            target_local_src = %addresses.route_local_interface.ip,
            target = %addresses.route,
            %request_type,
            "{}Handling SDP", log_id
        );

        let (handle, created) = if request_type.creates_session() {
            self.find_or_create(session_id, addresses, attributes)?
        } else {
            let handle = self
                .find_session(session_id)
                .ok_or_else(|| MediaError::session_not_found(session_id))?;
            (handle, false)
        };

        let result = {
            let mut session = handle.lock();
            session.set_log_id(log_id);
            session.set_verbose(attributes.verbose);
            let mut attributes = attributes.clone();
            attributes.force_create |= self.config.force_create;
            session.handle_sdp(addresses, request_type, sdp, &attributes)
        };

        // a session born from a rejected offer has nothing to relay
        if result.is_err() && created {
            let mut sessions = self.sessions.lock();
            let same = sessions.get(session_id).is_some_and(|s| Arc::ptr_eq(s, &handle));
            if same {
                sessions.remove(session_id);
            }
            drop(sessions);
            if same {
                self.retire(&handle);
                debug!(session_id, "dropped relay session of a rejected offer");
            }
        }
        result
    }

    /// Returns the handle and whether this call inserted it
    fn find_or_create(
        &self,
        session_id: &str,
        addresses: &SignalingAddresses,
        attributes: &SdpAttributes,
    ) -> Result<(SessionHandle, bool)> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(session_id) {
            let existing = Arc::clone(existing);
            drop(sessions);
            if !attributes.call_id.is_empty() {
                existing
                    .lock()
                    .set_call_info(&attributes.call_id, &attributes.from, &attributes.to);
            }
            return Ok((existing, false));
        }

        if sessions.len() >= self.config.session_max {
            error!(session_id, max = self.config.session_max, "RTP Proxy Session Max Reached");
            return Err(MediaError::TooManySessions {
                max: self.config.session_max,
            });
        }

        let mut session = RelaySession::new(session_id, &self.config, Arc::clone(&self.ports));
        if !attributes.call_id.is_empty() {
            session.set_call_info(&attributes.call_id, &attributes.from, &attributes.to);
        }
        if attributes.count_sessions || self.config.count_sessions {
            let route = addresses.route.to_string();
            *self.route_counters.entry(route.clone()).or_insert(0) += 1;
            session.set_monitored_route(route);
        }
        if attributes.resizer_samples_leg1 > 0 && attributes.resizer_samples_leg2 > 0 {
            warn!(
                session_id,
                "RTP: Will be resizing packets to {}/{} ms samples",
                attributes.resizer_samples_leg1,
                attributes.resizer_samples_leg2
            );
            session.set_resizer_samples(attributes.resizer_samples_leg1, attributes.resizer_samples_leg2);
        }

        let handle = Arc::new(Mutex::new(session));
        sessions.insert(session_id.to_string(), Arc::clone(&handle));
        Ok((handle, true))
    }

    pub fn find_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Stop and forget a session; unknown ids are ignored
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id);
        match removed {
            Some(session) => {
                self.retire(&session);
                info!(session_id, "relay session removed");
                true
            }
            None => false,
        }
    }

    pub fn change_session_state(&self, session_id: &str, state: NegotiationState) {
        if let Some(session) = self.find_session(session_id) {
            session.lock().set_state(state);
        }
    }

    /// Sessions started against `route` while route counting was on
    pub fn route_session_count(&self, route: &str) -> usize {
        self.route_counters.get(route).map(|c| *c).unwrap_or(0)
    }

    fn retire(&self, session: &SessionHandle) {
        let mut session = session.lock();
        session.stop();
        if let Some(route) = session.monitored_route() {
            if let Some(mut count) = self.route_counters.get_mut(route) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// One housekeeping pass; returns the ids that were collected
    pub fn collect_inactive_sessions(&self) -> Vec<String> {
        let snapshot: Vec<(String, SessionHandle)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();

        // session locks are taken with the map lock released
        let inactive: Vec<(String, SessionHandle)> = snapshot
            .into_iter()
            .filter(|(_, s)| {
                let s = s.lock();
                s.is_voice_inactive() || s.is_auth_timeout()
            })
            .collect();
        if inactive.is_empty() {
            return Vec::new();
        }

        let expired: Vec<(String, SessionHandle)> = {
            let mut sessions = self.sessions.lock();
            inactive
                .into_iter()
                .filter(|(id, handle)| {
                    let same = sessions.get(id).is_some_and(|s| Arc::ptr_eq(s, handle));
                    if same {
                        sessions.remove(id);
                    }
                    same
                })
                .collect()
        };

        let mut collected = Vec::with_capacity(expired.len());
        for (id, session) in expired {
            self.retire(&session);
            info!(session_id = %id, "collected inactive relay session");
            collected.push(id);
        }
        collected
    }

    /// Run the sweep every `housekeeping_interval` until [`Self::stop`]
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
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let collected = manager.collect_inactive_sessions();
                if !collected.is_empty() {
                    debug!(count = collected.len(), "housekeeping collected sessions");
                }
            }
        });
        *slot = Some(cancel);
    }

    /// Stop housekeeping and every session
    pub fn stop(&self) {
        if let Some(token) = self.housekeeping.lock().take() {
            token.cancel();
        }
        let sessions: Vec<SessionHandle> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.retire(session);
        }
    }
}

impl Drop for RelayManager {
    fn drop(&mut self) {
        if let Some(token) = self.housekeeping.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Interface;
    use std::net::IpAddr;
    use std::time::Duration;

    fn manager(max: usize) -> RelayManager {
        RelayManager::new(RelayConfig {
            port_base: 42000,
            port_max: 42999,
            session_max: max,
            ..RelayConfig::default()
        })
    }

    fn addresses() -> SignalingAddresses {
        let lo: IpAddr = "127.0.0.1".parse().unwrap();
        SignalingAddresses {
            sent_by: lo,
            packet_source: lo,
            packet_local_interface: Interface::new(lo),
            route: "127.0.0.2".parse().unwrap(),
            route_local_interface: Interface::new(lo),
        }
    }

    fn offer() -> String {
        "v=0\r\no=- 7 7 IN IP4 10.1.1.1\r\ns=-\r\nc=IN IP4 10.1.1.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\n".to_string()
    }

    #[tokio::test]
    async fn test_update_requires_session() {
        let manager = manager(10);
        let mut sdp = offer();
        let err = manager
            .handle_sdp("", "nope", &addresses(), RequestType::Update, &mut sdp, &SdpAttributes::default())
            .unwrap_err();
        assert!(matches!(err, MediaError::SessionNotFound(_)));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_ceiling() {
        let manager = manager(1);
        let mut sdp = offer();
        manager
            .handle_sdp("", "a", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap();
        let mut sdp = offer();
        let err = manager
            .handle_sdp("", "b", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap_err();
        assert!(matches!(err, MediaError::TooManySessions { max: 1 }));
        assert!(err.is_allocation_failure());
        manager.stop();
    }

    #[tokio::test]
    async fn test_route_counters_follow_sessions() {
        let manager = manager(10);
        let attributes = SdpAttributes {
            count_sessions: true,
            ..SdpAttributes::default()
        };
        for id in ["r1", "r2"] {
            let mut sdp = offer();
            manager
                .handle_sdp("", id, &addresses(), RequestType::Invite, &mut sdp, &attributes)
                .unwrap();
        }
        assert_eq!(manager.route_session_count("127.0.0.2"), 2);
        assert!(manager.remove_session("r1"));
        assert!(!manager.remove_session("r1"));
        assert_eq!(manager.route_session_count("127.0.0.2"), 1);
        manager.stop();
        assert_eq!(manager.route_session_count("127.0.0.2"), 0);
    }

    #[tokio::test]
    async fn test_auth_timeout_is_collected() {
        let manager = RelayManager::new(RelayConfig {
            port_base: 42000,
            port_max: 42999,
            auth_timeout: Duration::ZERO,
            ..RelayConfig::default()
        });
        let mut sdp = offer();
        manager
            .handle_sdp("", "auth", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap();
        assert!(manager.collect_inactive_sessions().is_empty());

        manager.change_session_state("auth", NegotiationState::OfferWaitingAuthentication);
        assert_eq!(manager.collect_inactive_sessions(), vec!["auth".to_string()]);
        assert!(!manager.has_session("auth"));
    }

    #[tokio::test]
    async fn test_rejected_offer_frees_its_slot() {
        let manager = manager(1);
        let mut broken = "v=0\r\ns=-\r\nc=IN IP4 10.1.1.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\n".to_string();
        let err = manager
            .handle_sdp("", "bad", &addresses(), RequestType::Invite, &mut broken, &SdpAttributes::default())
            .unwrap_err();
        assert!(matches!(err, MediaError::ProtocolViolation(_)));
        assert_eq!(manager.session_count(), 0);

        let mut sdp = offer();
        manager
            .handle_sdp("", "good", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap();
        assert!(manager.has_session("good"));
        manager.stop();
    }

    #[tokio::test]
    async fn test_rejected_reoffer_keeps_session() {
        let manager = manager(10);
        let mut sdp = offer();
        manager
            .handle_sdp("", "keep", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap();
        let mut broken = "v=0\r\ns=-\r\n".to_string();
        assert!(manager
            .handle_sdp("", "keep", &addresses(), RequestType::InviteResponse, &mut broken, &SdpAttributes::default())
            .is_err());
        assert!(manager.has_session("keep"));
        manager.stop();
    }

    #[tokio::test]
    async fn test_sweep_does_not_hold_map_lock_on_busy_session() {
        let manager = Arc::new(RelayManager::new(RelayConfig {
            port_base: 42000,
            port_max: 42999,
            auth_timeout: Duration::ZERO,
            ..RelayConfig::default()
        }));
        let mut sdp = offer();
        manager
            .handle_sdp("", "busy", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap();
        manager.change_session_state("busy", NegotiationState::OfferWaitingAuthentication);

        let busy = manager.find_session("busy").unwrap();
        let guard = busy.lock();
        let sweeper = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.collect_inactive_sessions())
        };
        std::thread::sleep(Duration::from_millis(50));
        // lookups proceed while the sweep waits on the session
        assert!(manager.has_session("busy"));
        assert_eq!(manager.session_count(), 1);
        drop(guard);

        assert_eq!(sweeper.join().unwrap(), vec!["busy".to_string()]);
        assert!(!manager.has_session("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_task_sweeps() {
        let manager = Arc::new(RelayManager::new(RelayConfig {
            port_base: 42000,
            port_max: 42999,
            auth_timeout: Duration::ZERO,
            housekeeping_interval: Duration::from_secs(5),
            ..RelayConfig::default()
        }));
        let mut sdp = offer();
        manager
            .handle_sdp("", "hk", &addresses(), RequestType::Invite, &mut sdp, &SdpAttributes::default())
            .unwrap();
        manager.change_session_state("hk", NegotiationState::OfferWaitingAuthentication);
        manager.start_housekeeping();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(manager.session_count(), 0);
        manager.stop();
    }
}
