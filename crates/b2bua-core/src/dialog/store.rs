//! Call-ID keyed dialog cache
//!
//! Records for one Call-ID live together; a B2B agent that forks or receives
//! a replacing INVITE on the same Call-ID ends up with several. Requests that
//! name their session through the session contact are matched directly. For
//! peers that drop that convention the store falls back to comparing From/To
//! tags against the first and last record of the Call-ID, which is ambiguous
//! once more than two sessions share a Call-ID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sbc_media_core::Leg;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::persistence::{DialogPersistence, InMemoryStore};
use super::{DialogData, LegInfo};
use crate::contact;
use crate::message::{SipMessage, param_of, tag_of};

struct CallEntry {
    dialogs: Vec<DialogData>,
    expires: Instant,
}

/// A dialog matched to a mid-dialog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogMatch {
    pub session_id: String,
    /// Leg the request came from
    pub sender: Leg,
    /// Leg the request is forwarded to
    pub target: Leg,
    pub dialog: DialogData,
}

fn tag(value: &str) -> String {
    tag_of(value).unwrap_or_default()
}

pub struct DialogStore {
    calls: Mutex<HashMap<String, CallEntry>>,
    lifetime: Duration,
    persistence: Arc<dyn DialogPersistence>,
}

impl DialogStore {
    pub fn new(lifetime: Duration, persistence: Arc<dyn DialogPersistence>) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            lifetime,
            persistence,
        }
    }

    pub fn with_memory_store(lifetime: Duration) -> Self {
        Self::new(lifetime, Arc::new(InMemoryStore::new()))
    }

    pub fn persistence(&self) -> &Arc<dyn DialogPersistence> {
        &self.persistence
    }

    /// Run `f` on the live records of `call_id`, dropping them when expired
    fn with_call<R>(&self, call_id: &str, f: impl FnOnce(&mut Vec<DialogData>) -> R) -> Option<R> {
        let mut calls = self.calls.lock();
        if calls.get(call_id).is_some_and(|entry| entry.expires <= Instant::now()) {
            debug!(call_id, "Dialog cache entry expired");
            calls.remove(call_id);
            return None;
        }
        let entry = calls.get_mut(call_id)?;
        let result = f(&mut entry.dialogs);
        if entry.dialogs.is_empty() {
            calls.remove(call_id);
        }
        Some(result)
    }

    pub fn has_dialog(&self, call_id: &str) -> bool {
        self.with_call(call_id, |_| ()).is_some()
    }

    /// Number of sessions across all Call-IDs
    pub fn len(&self) -> usize {
        self.calls.lock().values().map(|entry| entry.dialogs.len()).sum()
    }

    /// File `dialog` under `call_id`, replacing a record of the same session
    pub fn add_dialog(&self, call_id: &str, dialog: DialogData) {
        let mut calls = self.calls.lock();
        let expires = Instant::now() + self.lifetime;
        let entry = calls.entry(call_id.to_string()).or_insert_with(|| CallEntry {
            dialogs: Vec::new(),
            expires,
        });
        entry.expires = expires;
        debug!(session_id = %dialog.session_id, call_id, "Added new dialog");
        match entry.dialogs.iter_mut().find(|d| d.session_id == dialog.session_id) {
            Some(existing) => *existing = dialog,
            None => entry.dialogs.push(dialog),
        }
    }

    /// Read-modify-write one session under the store lock.
    ///
    /// Returns the record as left by `f`, or `None` when the session is not
    /// cached. Callers persist the returned record.
    pub fn modify(&self, call_id: &str, session_id: &str, f: impl FnOnce(&mut DialogData)) -> Option<DialogData> {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        if calls.get(call_id).is_some_and(|entry| entry.expires <= now) {
            debug!(call_id, "Dialog cache entry expired");
            calls.remove(call_id);
            return None;
        }
        let entry = calls.get_mut(call_id)?;
        let dialog = entry.dialogs.iter_mut().find(|d| d.session_id == session_id)?;
        f(dialog);
        let updated = dialog.clone();
        entry.expires = now + self.lifetime;
        Some(updated)
    }

    /// Like [`Self::modify`], filing a fresh record when the session is new
    pub fn upsert(&self, call_id: &str, session_id: &str, f: impl FnOnce(&mut DialogData)) -> DialogData {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        if calls.get(call_id).is_some_and(|entry| entry.expires <= now) {
            calls.remove(call_id);
        }
        let entry = calls.entry(call_id.to_string()).or_insert_with(|| CallEntry {
            dialogs: Vec::new(),
            expires: now,
        });
        entry.expires = now + self.lifetime;
        let position = match entry.dialogs.iter().position(|d| d.session_id == session_id) {
            Some(position) => position,
            None => {
                debug!(session_id, call_id, "Added new dialog");
                entry.dialogs.push(DialogData::new(session_id));
                entry.dialogs.len() - 1
            }
        };
        let dialog = &mut entry.dialogs[position];
        f(dialog);
        dialog.clone()
    }

    pub fn remove_dialog(&self, call_id: &str, session_id: &str) {
        self.with_call(call_id, |dialogs| dialogs.retain(|d| d.session_id != session_id));
        if let Err(e) = self.persistence.remove_session(session_id) {
            error!(session_id, error = %e, "Unable to remove stored dialog");
        }
    }

    /// Write a record through to the backend
    pub fn persist(&self, dialog: &DialogData) {
        let mut dialog = dialog.clone();
        dialog.session_age = Utc::now();
        if let Err(e) = self.persistence.persist(&dialog) {
            error!(session_id = %dialog.session_id, error = %e, "Unable to persist dialog");
        }
    }

    /// Direct lookup of one session
    pub fn find_session(&self, call_id: &str, session_id: &str) -> Option<DialogData> {
        self.with_call(call_id, |dialogs| dialogs.iter().find(|d| d.session_id == session_id).cloned())
            .flatten()
    }

    /// Find the dialog a message belongs to.
    ///
    /// With a single session on the Call-ID that session is the answer. With
    /// several, a supplied `session_id` must match a record whose leg To tag
    /// equals the message To tag. Without one the tag heuristic runs against
    /// the first and last records only.
    pub fn find_dialog(&self, message: &SipMessage, session_id: Option<&str>) -> Option<DialogData> {
        let Some(call_id) = message.call_id() else {
            error!("Unable to determine Call-ID while calling find_dialog.");
            return None;
        };
        let from_tag = message.from_tag().unwrap_or_default();
        let to_tag = message.to_tag().unwrap_or_default();
        debug!(call_id, session_id = session_id.unwrap_or(""), "Finding dialog");

        let found = self.with_call(call_id, |dialogs| {
            if dialogs.len() == 1 {
                let dialog = &dialogs[0];
                return match session_id {
                    Some(id) if dialog.session_id != id => None,
                    _ => Some(dialog.clone()),
                };
            }

            if let Some(id) = session_id {
                let matched = dialogs.iter().find(|d| {
                    d.session_id == id && (to_tag == tag(&d.leg1.to) || to_tag == tag(&d.leg2.to))
                });
                if matched.is_none() {
                    warn!(call_id, session_id = id, "Multiple sessions exist for Call-ID but none of them matches");
                }
                return matched.cloned();
            }

            // the hard way
            let wanted = if message.is_request() { &to_tag } else { &from_tag };
            let first = dialogs.first()?;
            if &tag(&first.leg1.from) == wanted {
                return Some(first.clone());
            }
            let last = dialogs.last()?;
            if &tag(&last.leg2.from) == wanted {
                return Some(last.clone());
            }
            None
        });

        let found = found.flatten();
        if found.is_none() {
            warn!(call_id, "No dialog exists for Call-ID");
        }
        found
    }

    /// Find the dialog of a mid-dialog request along with its direction
    pub fn find_dialog_with_legs(&self, request: &mut SipMessage) -> Option<DialogMatch> {
        match contact::session_info(request) {
            Some(info) => {
                let dialog = self.find_dialog(request, Some(&info.session_id))?;
                Some(DialogMatch {
                    session_id: info.session_id,
                    sender: info.leg,
                    target: info.leg.other(),
                    dialog,
                })
            }
            None => {
                debug!(
                    uri = request.request_uri().unwrap_or(""),
                    "Unable to determine session information from request-uri"
                );
                let dialog = self.find_dialog(request, None)?;
                let from_tag = request.from_tag().unwrap_or_default();
                let sender = if tag(&dialog.leg1.to) == from_tag {
                    Leg::One
                } else if tag(&dialog.leg2.to) == from_tag {
                    Leg::Two
                } else {
                    warn!(session_id = %dialog.session_id, "Unable to determine dialog leg");
                    return None;
                };
                Some(DialogMatch {
                    session_id: dialog.session_id.clone(),
                    sender,
                    target: sender.other(),
                    dialog,
                })
            }
        }
    }

    /// Leg a `Replaces` header value points at
    ///
    /// The header is `call-id;to-tag=..;from-tag=..` as seen by the sender of
    /// the replacing INVITE.
    pub fn find_replaces_target(&self, replaces: &str) -> Option<(Leg, LegInfo)> {
        let call_id = replaces.split(';').next().unwrap_or("").trim();
        if call_id.is_empty() {
            error!("Unable to determine Call-ID while calling find_replaces_target.");
            return None;
        }
        let params = &replaces[call_id.len()..];
        let to_tag = param_of(params, "to-tag").unwrap_or_default();
        let from_tag = param_of(params, "from-tag").unwrap_or_default();

        let found = self
            .with_call(call_id, |dialogs| {
                dialogs.iter().find_map(|d| {
                    if tag(&d.leg1.to) == to_tag && tag(&d.leg1.from) == from_tag {
                        Some((Leg::One, d.leg1.clone()))
                    } else if tag(&d.leg2.to) == to_tag && tag(&d.leg2.from) == from_tag {
                        Some((Leg::Two, d.leg2.clone()))
                    } else {
                        None
                    }
                })
            })
            .flatten();

        match &found {
            Some((leg, _)) => info!(call_id, leg = leg.number(), "will be replacing leg"),
            None => info!(call_id, "did not find any replaces target"),
        }
        found
    }

    /// Reload records younger than `window` from the backend.
    ///
    /// Older records are removed from the backend. Returns how many were
    /// restored.
    pub fn restore_from_store(&self, window: Duration) -> usize {
        let dialogs = match self.persistence.get_all() {
            Ok(dialogs) => dialogs,
            Err(e) => {
                error!(error = %e, "Unable to read stored dialogs");
                return 0;
            }
        };
        let now = Utc::now();
        let mut restored = 0;
        for dialog in dialogs {
            let age = now.signed_duration_since(dialog.session_age);
            if age.num_milliseconds() < window.as_millis() as i64 {
                let call_id = dialog.call_id().to_string();
                self.add_dialog(&call_id, dialog);
                restored += 1;
            } else if let Err(e) = self.persistence.remove_session(&dialog.session_id) {
                error!(session_id = %dialog.session_id, error = %e, "Unable to remove stale dialog");
            }
        }
        info!(restored, "Restored dialogs from store");
        restored
    }

    /// Drop expired Call-IDs, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        let before = calls.len();
        calls.retain(|_, entry| entry.expires > now);
        before - calls.len()
    }
}
