//! End-to-end stratum tests against a mock chain node.
//!
//! The mock speaks just enough JSON-RPC for the proxy (blockNumber, getWork,
//! submitWork) and records every submission so tests can assert on the exact
//! nonce/header/mix the chain would see.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use rxeth_proxy::config::{Opts, ProxyConfig};
use rxeth_proxy::server::StratumServer;

const HEADER_HASH: &str = "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
const SEED_HASH: &str = "0xabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcd";

#[derive(Default)]
struct MockChain {
    work: Mutex<[String; 4]>,
    submissions: Mutex<Vec<(String, String, String)>>,
}

impl MockChain {
    fn with_target(target: &str) -> Arc<Self> {
        let chain = Self::default();
        *chain.work.lock().unwrap() = [
            HEADER_HASH.to_string(),
            SEED_HASH.to_string(),
            target.to_string(),
            "0x1".to_string(),
        ];
        Arc::new(chain)
    }

    fn submissions(&self) -> Vec<(String, String, String)> {
        self.submissions.lock().unwrap().clone()
    }
}

async fn rpc_handler(State(chain): State<Arc<MockChain>>, Json(req): Json<Value>) -> Json<Value> {
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let method = req.get("method").and_then(Value::as_str).unwrap_or("");

    let result = match method {
        "eth_blockNumber" => json!("0x1"),
        "randomx_getWork" => json!(*chain.work.lock().unwrap()),
        "randomx_submitWork" => {
            let params = req["params"].as_array().cloned().unwrap_or_default();
            let mut field = params
                .into_iter()
                .map(|v| v.as_str().unwrap_or_default().to_string());
            let nonce = field.next().unwrap_or_default();
            let header = field.next().unwrap_or_default();
            let mix = field.next().unwrap_or_default();
            chain.submissions.lock().unwrap().push((nonce, header, mix));
            json!(true)
        }
        _ => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unknown method {method}")},
            }))
        }
    };

    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn start_mock_rpc(chain: Arc<MockChain>) -> SocketAddr {
    let router = Router::new().route("/", post(rpc_handler)).with_state(chain);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn start_proxy(rpc_addr: SocketAddr, extra_args: &[&str]) -> SocketAddr {
    let geth = format!("http://{rpc_addr}/");
    let mut args = vec!["rxeth-proxy", "--stratum", "127.0.0.1:0", "--geth", &geth];
    args.extend_from_slice(extra_args);
    let opts = Opts::parse_from(args);
    let cfg = ProxyConfig::from(&opts);
    let server = StratumServer::new(cfg);
    server.start().await.expect("proxy start")
}

struct MinerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MinerClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect stratum");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string().into_bytes();
        line.push(b'\n');
        self.writer.write_all(&line).await.expect("write request");
    }

    /// Next line as JSON, or `None` if the server closed the connection.
    async fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
            .expect("read line");
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(line.trim()).expect("parse response"))
    }

    async fn login(&mut self, address: &str, worker: &str) -> Value {
        self.send(json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "login",
            "params": {"login": address, "pass": worker, "agent": "xmrig/6.21.0"},
        }))
        .await;
        self.recv().await.expect("login response")
    }

    async fn submit(&mut self, session_id: &str, job_id: &str, nonce: &str, result: &str) -> Value {
        self.send(json!({
            "id": 2,
            "jsonrpc": "2.0",
            "method": "submit",
            "params": {"id": session_id, "job_id": job_id, "nonce": nonce, "result": result},
        }))
        .await;
        self.recv().await.expect("submit response")
    }
}

/// Extra nonce decoded from bytes 32..36 of the blob.
fn blob_extra_nonce(blob: &str) -> u32 {
    let bytes = hex::decode(&blob[64..72]).unwrap();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

async fn wait_for_submissions(chain: &Arc<MockChain>, count: usize) -> Vec<(String, String, String)> {
    for _ in 0..100 {
        let subs = chain.submissions();
        if subs.len() >= count {
            return subs;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {count} submissions, got {}",
        chain.submissions().len()
    );
}

/// All-ones target: network difficulty 1, so every pool-valid share is also
/// a block candidate and reaches the mock chain.
fn easy_target() -> String {
    format!("0x{}", "f".repeat(64))
}

#[tokio::test]
async fn login_delivers_rx_eth_v1_job() {
    let target = format!("0x00000000{}", "f".repeat(56));
    let chain = MockChain::with_target(&target);
    let rpc_addr = start_mock_rpc(chain).await;
    let proxy = start_proxy(rpc_addr, &["--diff", "1"]).await;

    let mut miner = MinerClient::connect(proxy).await;
    let response = miner.login("0xabc", "worker1").await;

    let result = &response["result"];
    assert_eq!(result["status"], "OK");
    assert!(result["extensions"]
        .as_array()
        .unwrap()
        .contains(&json!("keepalive")));
    assert!(response.get("error").is_none());

    let job = &result["job"];
    assert_eq!(job["algo"], "rx/0");
    assert_eq!(job["height"], 1);
    assert_eq!(job["seed_hash"], SEED_HASH.trim_start_matches("0x"));
    assert_eq!(job["clean_jobs"], true);
    // Initial difficulty 1 maps to the widest stratum target.
    assert_eq!(job["target"], "ffffffff");

    let blob = job["blob"].as_str().unwrap();
    assert_eq!(blob.len(), 86);
    assert_eq!(&blob[..64], HEADER_HASH.trim_start_matches("0x"));
    // bytes 36..39 constant zero, bytes 39..43 miner nonce placeholder
    assert_eq!(&blob[72..78], "000000");
    assert_eq!(&blob[78..86], "00000000");
}

#[tokio::test]
async fn submission_reaches_chain_with_combined_nonce() {
    let chain = MockChain::with_target(&easy_target());
    let rpc_addr = start_mock_rpc(Arc::clone(&chain)).await;
    let proxy = start_proxy(rpc_addr, &["--diff", "1"]).await;

    let mut miner = MinerClient::connect(proxy).await;
    let login = miner.login("0xabc", "worker1").await;
    let session_id = login["result"]["id"].as_str().unwrap().to_string();
    let job_id = login["result"]["job"]["job_id"].as_str().unwrap().to_string();
    let extra_nonce = blob_extra_nonce(login["result"]["job"]["blob"].as_str().unwrap());

    let result_hash = "deadbeef".repeat(8);
    let response = miner
        .submit(&session_id, &job_id, "78563412", &result_hash)
        .await;
    assert_eq!(response["result"]["status"], "OK", "got {response}");

    let submissions = wait_for_submissions(&chain, 1).await;
    let (nonce, header, mix) = &submissions[0];
    let expected_nonce64 = ((extra_nonce as u64) << 32) | 0x1234_5678;
    assert_eq!(nonce, &format!("{expected_nonce64:#018x}"));
    assert_eq!(header, HEADER_HASH);
    assert_eq!(mix, &format!("0x{result_hash}"));
}

#[tokio::test]
async fn concurrent_miners_submit_distinct_nonces() {
    let chain = MockChain::with_target(&easy_target());
    let rpc_addr = start_mock_rpc(Arc::clone(&chain)).await;
    let proxy = start_proxy(rpc_addr, &["--diff", "1"]).await;

    let mut handles = Vec::new();
    for idx in 0u32..4 {
        handles.push(tokio::spawn(async move {
            let mut miner = MinerClient::connect(proxy).await;
            let login = miner.login(&format!("0xminer{idx}"), "w").await;
            let session_id = login["result"]["id"].as_str().unwrap().to_string();
            let job_id = login["result"]["job"]["job_id"].as_str().unwrap().to_string();
            let extra = blob_extra_nonce(login["result"]["job"]["blob"].as_str().unwrap());

            let miner_nonce = idx + 1;
            let nonce_hex = hex::encode(miner_nonce.to_le_bytes());
            let response = miner
                .submit(&session_id, &job_id, &nonce_hex, &"deadbeef".repeat(8))
                .await;
            assert_eq!(response["result"]["status"], "OK", "got {response}");
            ((extra as u64) << 32) | miner_nonce as u64
        }));
    }

    let mut expected: Vec<u64> = Vec::new();
    for handle in handles {
        expected.push(handle.await.unwrap());
    }

    let submissions = wait_for_submissions(&chain, 4).await;
    let mut seen: Vec<u64> = submissions
        .iter()
        .map(|(nonce, header, _)| {
            assert_eq!(header, HEADER_HASH);
            u64::from_str_radix(nonce.trim_start_matches("0x"), 16).unwrap()
        })
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 4, "nonces must be distinct");

    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn invalid_streak_bans_and_closes() {
    let chain = MockChain::with_target(&easy_target());
    let rpc_addr = start_mock_rpc(Arc::clone(&chain)).await;
    let proxy = start_proxy(
        rpc_addr,
        &["--diff", "10000", "--max-invalid-streak", "3"],
    )
    .await;

    let mut miner = MinerClient::connect(proxy).await;
    let login = miner.login("0xabc", "w").await;
    let session_id = login["result"]["id"].as_str().unwrap().to_string();
    let job_id = login["result"]["job"]["job_id"].as_str().unwrap().to_string();

    // Big-endian 0x029000... has share difficulty ~100: below pool diff.
    let weak_result = format!("0290{}", "00".repeat(30));

    for nonce in ["01000000", "02000000", "03000000"] {
        let response = miner.submit(&session_id, &job_id, nonce, &weak_result).await;
        assert_eq!(
            response["error"]["message"], "Share difficulty too low",
            "got {response}"
        );
    }

    // Fourth attempt is refused as banned, then the server hangs up.
    let response = miner
        .submit(&session_id, &job_id, "04000000", &weak_result)
        .await;
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.starts_with("Banned:"), "got {message}");
    assert!(miner.recv().await.is_none(), "connection should be closed");

    assert!(chain.submissions().is_empty());
}

#[tokio::test]
async fn vardiff_retarget_pushes_new_job_target() {
    let chain = MockChain::with_target(&easy_target());
    let rpc_addr = start_mock_rpc(Arc::clone(&chain)).await;
    let proxy = start_proxy(
        rpc_addr,
        &[
            "--diff",
            "1",
            "--vardiff-window",
            "2",
            "--share-rate-limit",
            "0",
        ],
    )
    .await;

    let mut miner = MinerClient::connect(proxy).await;
    let login = miner.login("0xabc", "w").await;
    let session_id = login["result"]["id"].as_str().unwrap().to_string();
    let job_id = login["result"]["job"]["job_id"].as_str().unwrap().to_string();

    let first = miner
        .submit(&session_id, &job_id, "01000000", &"deadbeef".repeat(8))
        .await;
    assert_eq!(first["result"]["status"], "OK");

    // Second accepted share completes the vardiff window at a ridiculous
    // share rate, so the difficulty climbs to the floor clamp (1000) and
    // the proxy re-pushes the job with the new target immediately.
    let second = miner
        .submit(&session_id, &job_id, "02000000", &"deadbeef".repeat(8))
        .await;
    assert_eq!(second["result"]["status"], "OK");

    let push = miner.recv().await.expect("pushed job");
    assert_eq!(push["method"], "job");
    assert!(push.get("id").is_none());
    assert_eq!(push["params"]["job_id"], job_id.as_str());
    let expected_target = hex::encode((u32::MAX / 1000).to_le_bytes());
    assert_eq!(push["params"]["target"], expected_target.as_str());
}

#[tokio::test]
async fn keepalived_and_unknown_methods() {
    let chain = MockChain::with_target(&easy_target());
    let rpc_addr = start_mock_rpc(chain).await;
    let proxy = start_proxy(rpc_addr, &[]).await;

    let mut miner = MinerClient::connect(proxy).await;

    miner
        .send(json!({"id": 5, "jsonrpc": "2.0", "method": "keepalived", "params": {}}))
        .await;
    let response = miner.recv().await.unwrap();
    assert_eq!(response["result"]["status"], "KEEPALIVED");

    miner
        .send(json!({"id": 6, "jsonrpc": "2.0", "method": "mining.subscribe", "params": []}))
        .await;
    let response = miner.recv().await.unwrap();
    assert_eq!(
        response["error"]["message"],
        "Unknown method: mining.subscribe"
    );

    // Malformed JSON is logged and skipped; the connection stays up.
    miner.writer.write_all(b"not json at all\n").await.unwrap();
    miner
        .send(json!({"id": 7, "jsonrpc": "2.0", "method": "keepalived", "params": {}}))
        .await;
    let response = miner.recv().await.unwrap();
    assert_eq!(response["result"]["status"], "KEEPALIVED");
}

#[tokio::test]
async fn stale_job_id_is_rejected() {
    let chain = MockChain::with_target(&easy_target());
    let rpc_addr = start_mock_rpc(chain).await;
    let proxy = start_proxy(rpc_addr, &["--diff", "1"]).await;

    let mut miner = MinerClient::connect(proxy).await;
    let login = miner.login("0xabc", "w").await;
    let session_id = login["result"]["id"].as_str().unwrap().to_string();

    let response = miner
        .submit(&session_id, "no-such-job", "01000000", &"deadbeef".repeat(8))
        .await;
    assert_eq!(response["error"]["message"], "Stale share");
}
