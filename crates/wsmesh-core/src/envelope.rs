//! Signed inner envelope for cross-node cluster traffic.
//!
//! Every cluster packet (`$innerP2P$`, `$innerGRP$`, `$innerALL$`,
//! `$innerRMC$`) carries one of these as its `message` field. The `word`
//! nonce is fresh per dispatch, and `sign = MD5(route ∥ word ∥ secret)`,
//! so a captured envelope cannot be replayed under a different route and a
//! peer without the shared secret cannot forge one.

use crate::error::{MeshError, MeshResult};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerEnvelope {
    /// Target identity: UID for P2P, group id for GRP, absent for ALL/RMC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// The logical application route to deliver to.
    pub route: String,
    /// The application payload.
    pub message: Value,
    /// Per-dispatch nonce.
    pub word: String,
    /// `hex(MD5(route ∥ word ∥ secret))`.
    pub sign: String,
}

fn signature(route: &str, word: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(route.as_bytes());
    hasher.update(word.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

impl InnerEnvelope {
    /// Build a signed envelope with a fresh nonce.
    pub fn seal(
        tid: Option<String>,
        route: impl Into<String>,
        message: Value,
        secret: &str,
    ) -> Self {
        let route = route.into();
        let word = Uuid::new_v4().to_string();
        let sign = signature(&route, &word, secret);
        Self {
            tid,
            route,
            message,
            word,
            sign,
        }
    }

    /// Check the signature against the shared secret.
    pub fn verify(&self, secret: &str) -> bool {
        self.sign == signature(&self.route, &self.word, secret)
    }

    /// Read an envelope out of a packet `message` field.
    pub fn from_value(value: Value) -> MeshResult<Self> {
        serde_json::from_value(value).map_err(|e| MeshError::Format(format!("inner envelope: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
