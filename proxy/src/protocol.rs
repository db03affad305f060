//! Stratum protocol message types, xmrig dialect.
//!
//! One JSON object per newline-terminated line. Requests carry `params`
//! either as an object (xmrig) or as an array whose first element is the
//! object (legacy stratum); [`StratumRequest::params`] normalises both.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

use rxeth_engine::U256;

#[derive(Debug, Clone, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// The two wire shapes request params arrive in.
#[derive(Debug)]
pub enum Params<'a> {
    Object(&'a Map<String, Value>),
    Array(&'a Vec<Value>),
    Missing,
}

impl StratumRequest {
    pub fn params(&self) -> Params<'_> {
        match &self.params {
            Value::Object(map) => Params::Object(map),
            Value::Array(items) => Params::Array(items),
            _ => Params::Missing,
        }
    }

    /// The parameter object, whether sent directly or wrapped in an array.
    pub fn params_object(&self) -> Option<&Map<String, Value>> {
        match self.params() {
            Params::Object(map) => Some(map),
            Params::Array(items) => items.first().and_then(|v| v.as_object()),
            Params::Missing => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Value,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(StratumError {
                code: -1,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

/// Job payload pushed to xmrig, both inside the login result and as the
/// params of a server-initiated `job` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub algo: String,
    /// RandomX epoch seed, 64 hex chars, no 0x prefix.
    pub seed_hash: String,
    pub height: u64,
    /// rx-eth-v1 blob, 86 hex chars.
    pub blob: String,
    /// Pool target, 8 hex chars, little-endian.
    pub target: String,
    pub clean_jobs: bool,
}

/// Server-pushed job notification (no id).
pub fn job_notification(job: &JobResponse) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "job",
        "params": job,
    })
}

/// A mining job as tracked by the broker. The blob here carries a zero
/// extra-nonce; each session gets its own blob and target rendered at push
/// time from its own state.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub blob: String,
    pub algo: String,
    pub height: u64,
    /// 0x-prefixed.
    pub seed_hash: String,
    /// 0x-prefixed seal hash from the work package.
    pub header_hash: String,
    /// Network difficulty decoded from the 256-bit work target.
    pub difficulty: U256,
    pub created_at: Instant,
}
