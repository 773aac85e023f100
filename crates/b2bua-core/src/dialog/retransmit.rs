//! 2xx retransmission cache
//!
//! ACKs for 2xx responses are end-to-end requests that the agent has to
//! forward itself. The Via branch it needs comes from the 2xx that answered the
//! forwarded INVITE, which is kept here for a short while.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::message::SipMessage;

/// `call-id;from-tag;to-tag;cseq-number` of a message
pub fn cache_key(message: &SipMessage) -> Option<String> {
    let call_id = message.call_id()?;
    let from_tag = message.from_tag().unwrap_or_default();
    let to_tag = message.to_tag().unwrap_or_default();
    let (cseq, _) = message.cseq()?;
    Some(format!("{};{};{};{}", call_id, from_tag, to_tag, cseq))
}

pub struct RetransmitCache {
    entries: Mutex<HashMap<String, (SipMessage, Instant)>>,
    lifetime: Duration,
}

impl RetransmitCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    /// Remember a 2xx, returning the key it was filed under
    pub fn insert(&self, response: &SipMessage) -> Option<String> {
        let key = cache_key(response)?;
        self.entries
            .lock()
            .insert(key.clone(), (response.clone(), Instant::now() + self.lifetime));
        Some(key)
    }

    pub fn get(&self, key: &str) -> Option<SipMessage> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((response, _)) => Some(response.clone()),
            None => None,
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop expired responses, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expiry)| *expiry > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
