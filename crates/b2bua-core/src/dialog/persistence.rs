//! Dialog and registration storage backends
//!
//! The agent only needs a handful of operations from its store. Deployments
//! plug in their own key-value backend; [`InMemoryStore`] keeps JSON documents
//! in process and is the default.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use super::DialogData;
use crate::error::{B2bError, Result};

/// A registration binding relayed by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegData {
    pub key: String,
    pub aor: String,
    pub contact: String,
    pub packet_source: String,
    pub local_interface: String,
    pub transport_id: String,
    pub target_transport: String,
    pub expires: u32,
    pub xor_encrypted: bool,
}

pub trait DialogPersistence: Send + Sync {
    fn persist(&self, dialog: &DialogData) -> Result<()>;
    fn get_all(&self) -> Result<Vec<DialogData>>;
    fn remove_session(&self, session_id: &str) -> Result<()>;
    /// Remove every record filed under `call_id`
    fn remove_all(&self, call_id: &str) -> Result<()>;

    fn persist_reg(&self, reg: &RegData) -> Result<()>;
    fn get_reg(&self, key: &str) -> Result<Option<RegData>>;
    fn get_reg_by_prefix(&self, prefix: &str) -> Result<Vec<RegData>>;
    fn remove_reg(&self, key: &str) -> Result<()>;
    fn remove_all_reg(&self, prefix: &str) -> Result<()>;
    fn get_all_reg(&self) -> Result<Vec<RegData>>;
}

#[derive(Debug, Default)]
struct Storage {
    dialogs: HashMap<String, Value>,
    registry: BTreeMap<String, Value>,
}

/// Process local store keeping records as JSON values
#[derive(Debug, Default)]
pub struct InMemoryStore {
    storage: Mutex<Storage>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode<T: Serialize>(record: &T) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| B2bError::Persistence(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(record) => Some(record),
        Err(e) => {
            error!(error = %e, "Skipping unreadable stored record");
            None
        }
    }
}

impl DialogPersistence for InMemoryStore {
    fn persist(&self, dialog: &DialogData) -> Result<()> {
        let value = encode(dialog)?;
        self.storage.lock().dialogs.insert(dialog.session_id.clone(), value);
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<DialogData>> {
        Ok(self.storage.lock().dialogs.values().filter_map(decode).collect())
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        self.storage.lock().dialogs.remove(session_id);
        Ok(())
    }

    fn remove_all(&self, call_id: &str) -> Result<()> {
        let mut storage = self.storage.lock();
        storage.dialogs.retain(|_, value| {
            decode::<DialogData>(value).is_none_or(|dialog| dialog.call_id() != call_id)
        });
        Ok(())
    }

    fn persist_reg(&self, reg: &RegData) -> Result<()> {
        if reg.key.is_empty() || reg.aor.is_empty() || reg.contact.is_empty() {
            error!("Invalid registration record.");
            return Err(B2bError::Persistence("invalid registration record".into()));
        }
        info!(key = %reg.key, aor = %reg.aor, binding = %reg.contact, "Persisting registration");
        let value = encode(reg)?;
        self.storage.lock().registry.insert(reg.key.clone(), value);
        Ok(())
    }

    fn get_reg(&self, key: &str) -> Result<Option<RegData>> {
        Ok(self.storage.lock().registry.get(key).and_then(decode))
    }

    fn get_reg_by_prefix(&self, prefix: &str) -> Result<Vec<RegData>> {
        let storage = self.storage.lock();
        Ok(storage
            .registry
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(_, value)| decode(value))
            .collect())
    }

    fn remove_reg(&self, key: &str) -> Result<()> {
        self.storage.lock().registry.remove(key);
        Ok(())
    }

    fn remove_all_reg(&self, prefix: &str) -> Result<()> {
        self.storage.lock().registry.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    fn get_all_reg(&self) -> Result<Vec<RegData>> {
        Ok(self.storage.lock().registry.values().filter_map(decode).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog(session_id: &str, call_id: &str) -> DialogData {
        let mut dialog = DialogData::new(session_id);
        dialog.leg1.call_id = call_id.to_string();
        dialog
    }

    fn reg(key: &str) -> RegData {
        RegData {
            key: key.to_string(),
            aor: "sip:alice@example.com".into(),
            contact: "<sip:alice@10.0.0.1>".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dialog_records() {
        let store = InMemoryStore::new();
        store.persist(&dialog("s1", "c1")).unwrap();
        store.persist(&dialog("s2", "c1")).unwrap();
        store.persist(&dialog("s3", "c2")).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 3);

        store.remove_all("c1").unwrap();
        let remaining = store.get_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "s3");

        store.remove_session("s3").unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_registrations() {
        let store = InMemoryStore::new();
        store.persist_reg(&reg("reg-a-1")).unwrap();
        store.persist_reg(&reg("reg-a-2")).unwrap();
        store.persist_reg(&reg("reg-b-1")).unwrap();

        assert!(store.persist_reg(&RegData::default()).is_err());
        assert_eq!(store.get_reg("reg-a-1").unwrap().unwrap().aor, "sip:alice@example.com");
        assert!(store.get_reg("missing").unwrap().is_none());
        assert_eq!(store.get_reg_by_prefix("reg-a").unwrap().len(), 2);

        store.remove_all_reg("reg-a").unwrap();
        assert_eq!(store.get_all_reg().unwrap().len(), 1);
        store.remove_reg("reg-b-1").unwrap();
        assert!(store.get_all_reg().unwrap().is_empty());
    }
}
