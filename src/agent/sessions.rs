//! Persistent interpreter sessions
//!
//! Each conversation owns one state document in the user's persistent area,
//! written by the wrapped script after every execution and read back at the
//! start of the next one. Only values with a declared type survive between
//! rounds (see [`StateValue`]); modules, functions and arbitrary objects are
//! dropped. This is narrower than a full interpreter snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::storage::{sanitize_file_stem, PersistentArea, StorageError};

/// Schema version written by the session wrapper
pub const SESSION_STATE_VERSION: u32 = 1;

const STATE_SUFFIX: &str = ".state.json";

/// File name of the state document for a conversation
pub fn state_file_name(conversation_id: &str) -> String {
    format!("{}{}", sanitize_file_stem(conversation_id), STATE_SUFFIX)
}

/// A persisted variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Base64-encoded binary blob
    Bytes(String),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
    /// Tabular data (a DataFrame on the interpreter side)
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<StateValue>>,
    },
}

impl StateValue {
    /// Short type label used in logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::Text(_) => "text",
            StateValue::Bytes(_) => "bytes",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
            StateValue::Table { .. } => "table",
        }
    }

    /// Decode a `Bytes` value
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            StateValue::Bytes(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok(),
            _ => None,
        }
    }
}

/// Versioned table of named values for one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub conversation_id: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, StateValue>,
}

impl SessionState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            version: SESSION_STATE_VERSION,
            conversation_id: conversation_id.into(),
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
            values: BTreeMap::new(),
        }
    }

    /// Names of persisted variables, sorted
    pub fn variable_names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.values.get(name)
    }
}

/// Summary of a persisted session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub file: String,
    pub conversation_id: String,
    pub updated_at: Option<String>,
    pub variables: usize,
}

/// Reads session state documents out of a user's persistent area
pub struct SessionStore;

impl SessionStore {
    /// Load the state for `conversation_id`.
    ///
    /// A missing, unreadable, unparsable or unknown-version document is
    /// treated as "no prior state".
    pub async fn load(area: &dyn PersistentArea, conversation_id: &str) -> Option<SessionState> {
        let file = state_file_name(conversation_id);
        let bytes = match area.get(&file).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(file = %file, error = %e, "Failed to read session state");
                return None;
            }
        };
        parse_state(&bytes, &file)
    }

    /// List all sessions persisted in a user's area, newest first
    pub async fn list(area: &dyn PersistentArea) -> Result<Vec<SessionSummary>, StorageError> {
        let mut sessions = Vec::new();
        for file in area.list(&format!("*{}", STATE_SUFFIX)).await? {
            if let Some(bytes) = area.get(&file).await? {
                if let Some(state) = parse_state(&bytes, &file) {
                    sessions.push(SessionSummary {
                        file,
                        conversation_id: state.conversation_id,
                        updated_at: state.updated_at,
                        variables: state.values.len(),
                    });
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

fn parse_state(bytes: &[u8], file: &str) -> Option<SessionState> {
    match serde_json::from_slice::<SessionState>(bytes) {
        Ok(state) if state.version == SESSION_STATE_VERSION => Some(state),
        Ok(state) => {
            debug!(file = %file, version = state.version, "Ignoring session state with unknown version");
            None
        }
        Err(e) => {
            warn!(file = %file, error = %e, "Ignoring unparsable session state");
            None
        }
    }
}

/// In-process mutual exclusion per conversation identifier
///
/// Two requests for the same conversation would otherwise race on the same
/// state document (last writer wins). Separate processes are not covered.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder exists for `key`, then hold it until the
    /// guard is dropped
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody is holding or waiting on
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalVolumes;
    use crate::storage::VolumeProvider;
    use std::time::Duration;

    #[test]
    fn test_state_file_name_is_sanitized() {
        assert_eq!(state_file_name("conv-1"), "conv-1.state.json");
        assert_eq!(state_file_name("../etc/passwd"), "_2e_2e_2fetc_2fpasswd.state.json");
        assert_ne!(state_file_name("c.1"), state_file_name("c_1"));
    }

    #[test]
    fn test_state_value_wire_format() {
        let table = StateValue::Table {
            columns: vec!["a".into()],
            rows: vec![vec![StateValue::Int(1)]],
        };
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["type"], "table");
        assert_eq!(json["value"]["columns"][0], "a");
        assert_eq!(json["value"]["rows"][0][0]["type"], "int");
        assert_eq!(json["value"]["rows"][0][0]["value"], 1);
    }

    #[test]
    fn test_parse_document_written_by_wrapper() {
        let doc = r#"{
            "version": 1,
            "conversation_id": "c1",
            "updated_at": "2026-01-01T00:00:00+00:00",
            "values": {
                "x": {"type": "int", "value": 1},
                "name": {"type": "text", "value": "wine"},
                "blob": {"type": "bytes", "value": "aGk="},
                "cfg": {"type": "map", "value": {"lr": {"type": "float", "value": 0.5}}}
            }
        }"#;
        let state = parse_state(doc.as_bytes(), "c1.state.json").unwrap();
        assert_eq!(state.get("x"), Some(&StateValue::Int(1)));
        assert_eq!(state.get("blob").unwrap().as_bytes().unwrap(), b"hi");
        assert_eq!(state.get("cfg").unwrap().kind(), "map");
        assert_eq!(state.variable_names(), vec!["blob", "cfg", "name", "x"]);
    }

    #[test]
    fn test_unknown_version_is_absent() {
        let doc = r#"{"version": 99, "conversation_id": "c1", "values": {}}"#;
        assert!(parse_state(doc.as_bytes(), "c1.state.json").is_none());
        assert!(parse_state(b"not json", "c1.state.json").is_none());
    }

    #[tokio::test]
    async fn test_load_and_list_from_area() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = LocalVolumes::new(dir.path());
        let area = volumes.open("user-1").await.unwrap();

        assert!(SessionStore::load(area.as_ref(), "c1").await.is_none());

        let mut state = SessionState::new("c1");
        state.values.insert("x".into(), StateValue::Int(1));
        area.put(&state_file_name("c1"), serde_json::to_vec(&state).unwrap())
            .await
            .unwrap();
        area.put(&state_file_name("broken"), b"{".to_vec()).await.unwrap();

        let loaded = SessionStore::load(area.as_ref(), "c1").await.unwrap();
        assert_eq!(loaded.variable_names(), vec!["x"]);

        let sessions = SessionStore::list(area.as_ref()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].conversation_id, "c1");
        assert_eq!(sessions[0].variables, 1);
    }

    #[tokio::test]
    async fn test_conversation_locks_serialize_same_key() {
        let locks = Arc::new(ConversationLocks::new());
        let guard = locks.acquire("c1").await;

        let other = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("c1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!other.is_finished());

        // A different conversation is not blocked
        let _unrelated = locks.acquire("c2").await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_conversation_locks_prune_released_keys() {
        let locks = ConversationLocks::new();
        drop(locks.acquire("a").await);
        drop(locks.acquire("b").await);
        let _c = locks.acquire("c").await;
        assert_eq!(locks.len(), 1);
    }
}
