//! On-disk credential cache.
//!
//! One JSON file per identity, wrapped in a `{"_": <document>}` envelope.
//! Every read or parse failure degrades to "absent": a corrupt cache must
//! never crash the client, it simply forces a fresh token exchange.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Document field holding the identity key last seen in this cache.
pub const KEY_FIELD: &str = "key";
/// Document field holding the serialized request token.
pub const REQUEST_TOKEN_FIELD: &str = "requesttoken";
/// Document field holding the serialized access token.
pub const ACCESS_TOKEN_FIELD: &str = "accesstoken";

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "_")]
    document: Option<Value>,
}

/// Synchronous file-backed key/value store for one gear's credentials.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    path: PathBuf,
}

impl CredentialCache {
    /// Cache at the conventional per-key file name under `dir`.
    pub fn for_key(dir: &Path, gear_key: &str) -> Self {
        Self {
            path: dir.join(format!("microgear-{gear_key}.cache")),
        }
    }

    /// Cache pinned to an explicit file path.
    pub fn at_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Option<Map<String, Value>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let envelope: Envelope = serde_json::from_str(&raw).ok()?;
        match envelope.document? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn write_document(&self, document: Option<Map<String, Value>>) {
        let envelope = Envelope {
            document: document.map(Value::Object),
        };
        let serialized = match serde_json::to_string(&envelope) {
            Ok(s) => s,
            Err(err) => {
                debug!("failed to serialize credential cache: {err}");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, serialized) {
            debug!(path = %self.path.display(), "failed to write credential cache: {err}");
        }
    }

    /// Value stored under `key`, or `None` when absent, null, or unreadable.
    pub fn get(&self, key: &str) -> Option<Value> {
        let document = self.read_document()?;
        match document.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        }
    }

    /// Store `value` under `key`, replacing the whole document on disk.
    pub fn set(&self, key: &str, value: Value) {
        let mut document = self.read_document().unwrap_or_default();
        document.insert(key.to_string(), value);
        self.write_document(Some(document));
    }

    /// Null one field, or wipe the whole document when `key` is `None`.
    pub fn clear(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                let Some(mut document) = self.read_document() else {
                    return;
                };
                document.insert(key.to_string(), Value::Null);
                self.write_document(Some(document));
            }
            None => self.write_document(None),
        }
    }
}
