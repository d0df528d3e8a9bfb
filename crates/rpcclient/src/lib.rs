//! Bitcoin JSON-RPC transport (§6 "Inbound: Bitcoin JSON-RPC client"). A
//! thin, configurable JSON-RPC-over-HTTP client: single and batch request
//! forms, id-matched batch responses, and typed wrappers for the methods
//! the rest of the system needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Default per-request timeout for RPC calls (§5 "Cancellation & timeouts").
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error (status {0}): {1}")]
    Http(u16, #[source] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(Value),
    #[error("invalid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("missing result field in response")]
    MissingResult,
    #[error("batch response is missing an entry for request id {0}")]
    BatchIdMissing(u64),
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => RpcError::Http(status.as_u16(), e),
            None => RpcError::Http(0, e),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
}

/// A thin wrapper over a shared `reqwest::Client` pointed at one Bitcoin
/// Core JSON-RPC endpoint. Cloning is cheap: `reqwest::Client` is itself an
/// `Arc` over its connection pool, so every clone shares the same
/// keep-alive pool (§4 "HTTP pools: one per origin").
#[derive(Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    next_id: std::sync::Arc<AtomicU64>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").field("url", &self.url).finish()
    }
}

struct Request {
    id: u64,
    method: &'static str,
    params: Value,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .expect("reqwest client configuration is valid");
        RpcClient {
            client,
            url: url.into(),
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_auth(url: impl Into<String>, user: &str, pass: &str) -> Self {
        use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
        use base64::Engine;

        let mut headers = HeaderMap::new();
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {auth}")).expect("auth header is valid ascii"),
        );
        let client = Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .default_headers(headers)
            .build()
            .expect("reqwest client configuration is valid");
        RpcClient {
            client,
            url: url.into(),
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one JSON-RPC request and return its raw `result` field.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id();
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let resp: Value = self.client.post(&self.url).json(&body).send().await?.json().await?;
        extract_result(&resp)
    }

    /// Deserialize the `result` of a single RPC call into `R`.
    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, RpcError> {
        let result = self.send_request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a JSON-RPC batch. Responses may come back reordered by the
    /// server; each result is matched to its request by `id` (§6).
    async fn call_batch_raw(&self, requests: Vec<Request>) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let body: Vec<Value> = requests
            .iter()
            .map(|r| json!({"jsonrpc": "2.0", "id": r.id, "method": r.method, "params": r.params}))
            .collect();
        let responses: Vec<Value> = self.client.post(&self.url).json(&body).send().await?.json().await?;

        let mut by_id: std::collections::HashMap<u64, Value> = std::collections::HashMap::new();
        for resp in responses {
            if let Some(id) = resp.get("id").and_then(Value::as_u64) {
                by_id.insert(id, resp);
            }
        }

        let mut out = Vec::with_capacity(requests.len());
        for req in &requests {
            match by_id.get(&req.id) {
                Some(resp) => out.push(extract_result(resp)),
                None => out.push(Err(RpcError::BatchIdMissing(req.id))),
            }
        }
        Ok(out)
    }

    // --- Typed wrappers (§6 "Required methods") -------------------------

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    /// Verbose block payload at `verbosity` (2 or 3 per §6).
    pub async fn get_block_verbose(&self, hash: &str, verbosity: u8) -> Result<Value, RpcError> {
        self.call("getblock", json!([hash, verbosity])).await
    }

    /// Raw hex serialization (`verbosity = 0`).
    pub async fn get_block_raw(&self, hash: &str) -> Result<String, RpcError> {
        self.call("getblock", json!([hash, 0])).await
    }

    pub async fn get_block_header(&self, hash: &str) -> Result<Value, RpcError> {
        self.call("getblockheader", json!([hash, true])).await
    }

    pub async fn get_raw_transaction_verbose(&self, txid: &str) -> Result<Value, RpcError> {
        self.call("getrawtransaction", json!([txid, true])).await
    }
}

fn extract_result(resp: &Value) -> Result<Value, RpcError> {
    if let Some(err) = resp.get("error") {
        if !err.is_null() {
            return Err(RpcError::Rpc(err.clone()));
        }
    }
    match resp.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(RpcError::MissingResult),
    }
}

/// A batch request: `(method, params)` pairs, dispatched as one HTTP POST.
pub struct BatchRequest<'a>(Vec<(&'static str, Value)>, std::marker::PhantomData<&'a ()>);

impl<'a> BatchRequest<'a> {
    pub fn new() -> Self {
        BatchRequest(Vec::new(), std::marker::PhantomData)
    }

    pub fn push(mut self, method: &'static str, params: Value) -> Self {
        self.0.push((method, params));
        self
    }
}

impl<'a> Default for BatchRequest<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub async fn call_batch(&self, batch: BatchRequest<'_>) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let requests = batch
            .0
            .into_iter()
            .map(|(method, params)| Request {
                id: self.next_id(),
                method,
                params,
            })
            .collect();
        self.call_batch_raw(requests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_call_extracts_result() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":123,"error":null}"#)
            .create_async()
            .await;
        let client = RpcClient::new(server.url());
        let count: u64 = client.call("getblockcount", json!([])).await.unwrap();
        assert_eq!(count, 123);
    }

    #[tokio::test]
    async fn rpc_error_payload_surfaces_as_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":null,"error":{"code":-5,"message":"not found"}}"#)
            .create_async()
            .await;
        let client = RpcClient::new(server.url());
        let err = client.send_request("getblock", json!(["bad"])).await.unwrap_err();
        assert!(matches!(err, RpcError::Rpc(_)));
    }

    #[tokio::test]
    async fn batch_matches_responses_by_id_even_when_reordered() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(
                r#"[{"jsonrpc":"2.0","id":2,"result":"hash2","error":null},
                    {"jsonrpc":"2.0","id":1,"result":"hash1","error":null}]"#,
            )
            .create_async()
            .await;
        let client = RpcClient::new(server.url());
        let batch = BatchRequest::new()
            .push("getblockhash", json!([1]))
            .push("getblockhash", json!([2]));
        let results = client.call_batch(batch).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &json!("hash1"));
        assert_eq!(results[1].as_ref().unwrap(), &json!("hash2"));
    }
}
