//! JSON-RPC client towards the chain node.
//!
//! Work and submission calls try the RandomX-specific method first and fall
//! back to the standard Ethereum method, so the proxy runs against both
//! patched and stock nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use rxeth_engine::WorkPackage;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method}: http request failed"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{method}: http status {status}"));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .with_context(|| format!("{method}: invalid json-rpc response"))?;
        if let Some(err) = parsed.error {
            return Err(anyhow!("{method}: rpc error {}: {}", err.code, err.message));
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("{method}: response missing result"))
    }

    /// Fetch the current work package, preferring `randomx_getWork`.
    pub async fn get_work(&self) -> Result<WorkPackage> {
        let result = match self.call("randomx_getWork", json!([])).await {
            Ok(value) => value,
            Err(_) => self.call("eth_getWork", json!([])).await?,
        };

        let fields: [String; 4] =
            serde_json::from_value(result).context("getWork: expected 4 hex strings")?;
        let [header_hash, seed_hash, target, block_number] = fields;
        Ok(WorkPackage {
            header_hash,
            seed_hash,
            target,
            block_number,
        })
    }

    /// Submit a solution; `true` means the node accepted it.
    pub async fn submit_work(
        &self,
        nonce_hex: &str,
        header_hash: &str,
        mix_digest: &str,
    ) -> Result<bool> {
        let params = json!([nonce_hex, header_hash, mix_digest]);
        let result = match self.call("randomx_submitWork", params.clone()).await {
            Ok(value) => value,
            Err(_) => self.call("eth_submitWork", params).await?,
        };
        serde_json::from_value(result).context("submitWork: expected bool")
    }

    /// Report aggregate hashrate under the proxy's id.
    pub async fn submit_hashrate(&self, rate: u64, id: &str) -> Result<()> {
        let params = json!([format!("{rate:#x}"), id]);
        self.call("eth_submitHashrate", params).await?;
        Ok(())
    }

    pub async fn block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex: String = serde_json::from_value(result).context("blockNumber: expected hex")?;
        let trimmed = hex.strip_prefix("0x").unwrap_or(&hex);
        u64::from_str_radix(trimmed, 16).context("blockNumber: invalid hex")
    }

    /// Startup probe; the proxy refuses to start without a reachable node.
    pub async fn check_connection(&self) -> Result<()> {
        self.block_number()
            .await
            .map(|_| ())
            .context("rpc connection check failed")
    }
}
