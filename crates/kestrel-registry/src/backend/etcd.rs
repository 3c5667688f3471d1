//! etcd v3 backend over the JSON gateway.
//!
//! Sessions are leases. Keys are written with the lease attached, so etcd
//! deletes them when the lease expires. The gateway encodes keys and values
//! as base64 and 64-bit integers as strings.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use kestrel_common::protocol::RegistryError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::{CoordinationBackend, KeyValue, SessionId, Subscription, WatchSink};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub struct EtcdBackend {
    client: HttpClient,
    endpoint: String,
    timeout: Duration,
}

impl EtcdBackend {
    /// Creates a backend talking to the gateway at `endpoint`
    /// (e.g. `http://127.0.0.1:2379`). No connection is made until the first call.
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, RegistryError> {
        let uri = format!("{}{}", self.endpoint, path);
        let payload = serde_json::to_vec(&body).map_err(|e| RegistryError::Codec(e.to_string()))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| RegistryError::Unavailable(format!("invalid etcd endpoint '{}': {}", uri, e)))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| RegistryError::Unavailable(format!("etcd request to {} failed: {}", uri, e)))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RegistryError::Unavailable(format!("reading etcd response: {}", e)))?
                .to_bytes();
            Ok::<_, RegistryError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RegistryError::Unavailable(format!("etcd request to {} timed out", uri)))??;

        if status != StatusCode::OK {
            let detail: GatewayError = serde_json::from_slice(&body).unwrap_or_default();
            return Err(classify_gateway_error(status, detail));
        }

        serde_json::from_slice(&body).map_err(|e| RegistryError::Codec(format!("etcd response from {}: {}", path, e)))
    }

    async fn put(&self, session: SessionId, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        let _: Value = self
            .post(
                "/v3/kv/put",
                json!({"key": encode(key.as_bytes()), "value": encode(value), "lease": session.to_string()}),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn open_session(&self, ttl: Duration) -> Result<SessionId, RegistryError> {
        let grant: LeaseGrant = self
            .post("/v3/lease/grant", json!({"TTL": ttl.as_secs().max(1).to_string()}))
            .await?;
        tracing::debug!(lease = grant.id, ttl = grant.ttl, "etcd lease granted");
        Ok(grant.id)
    }

    async fn keep_alive(&self, session: SessionId) -> Result<(), RegistryError> {
        let reply: KeepAliveReply = self
            .post("/v3/lease/keepalive", json!({"ID": session.to_string()}))
            .await?;
        // An expired lease comes back with TTL 0 (or omitted)
        match reply.result {
            Some(LeaseGrant { ttl, .. }) if ttl > 0 => Ok(()),
            _ => Err(RegistryError::NotFound(format!("lease {:x}", session))),
        }
    }

    async fn close_session(&self, session: SessionId) -> Result<(), RegistryError> {
        match self
            .post::<Value>("/v3/lease/revoke", json!({"ID": session.to_string()}))
            .await
        {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, session: SessionId, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        let encoded_key = encode(key.as_bytes());
        let txn: TxnReply = self
            .post(
                "/v3/kv/txn",
                json!({
                    "compare": [{
                        "key": encoded_key,
                        "target": "CREATE",
                        "result": "EQUAL",
                        "create_revision": "0",
                    }],
                    "success": [{
                        "request_put": {
                            "key": encoded_key,
                            "value": encode(value),
                            "lease": session.to_string(),
                        }
                    }],
                    "failure": [{
                        "request_range": {"key": encoded_key}
                    }],
                }),
            )
            .await?;

        if txn.succeeded {
            return Ok(());
        }

        let owner = txn
            .responses
            .into_iter()
            .filter_map(|op| op.response_range)
            .flat_map(|range| range.kvs)
            .next()
            .map(|kv| kv.lease);

        match owner {
            Some(lease) if lease == session => self.put(session, key, value).await,
            // Deleted between the compare and the range read
            None => self.put(session, key, value).await,
            Some(_) => Err(RegistryError::Conflict(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let _: Value = self
            .post("/v3/kv/deleterange", json!({"key": encode(key.as_bytes())}))
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let range: RangeReply = self
            .post(
                "/v3/kv/range",
                json!({
                    "key": encode(prefix.as_bytes()),
                    "range_end": encode(&prefix_range_end(prefix.as_bytes())),
                    "sort_order": "ASCEND",
                    "sort_target": "KEY",
                }),
            )
            .await?;

        let mut entries = range
            .kvs
            .into_iter()
            .map(|kv| {
                let key = String::from_utf8(decode(&kv.key)?)
                    .map_err(|e| RegistryError::Codec(format!("non-utf8 etcd key: {}", e)))?;
                Ok(KeyValue::new(key, decode(&kv.value)?))
            })
            .collect::<Result<Vec<_>, RegistryError>>()?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn subscribe(&self, _prefix: &str, _sink: WatchSink) -> Result<Subscription, RegistryError> {
        // The gateway's watch endpoint is a long-lived stream; polling the
        // range is enough for membership changes.
        Ok(Subscription::Poll)
    }
}

/// Smallest key greater than every key with `prefix`.
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xFF: range to the end of the keyspace
    vec![0]
}

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode(text: &str) -> Result<Vec<u8>, RegistryError> {
    STANDARD
        .decode(text)
        .map_err(|e| RegistryError::Codec(format!("invalid base64 from etcd: {}", e)))
}

fn classify_gateway_error(status: StatusCode, detail: GatewayError) -> RegistryError {
    let message = detail.message.or(detail.error).unwrap_or_else(|| status.to_string());
    // gRPC NOT_FOUND, e.g. "requested lease not found"
    if detail.code == 5 || message.contains("not found") {
        RegistryError::NotFound(message)
    } else {
        RegistryError::Unavailable(format!("etcd returned {}: {}", status, message))
    }
}

/// The gateway renders int64 fields as JSON strings; accept numbers too.
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: i32,
}

#[derive(Debug, Deserialize)]
struct LeaseGrant {
    #[serde(rename = "ID", deserialize_with = "int64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct KeepAliveReply {
    #[serde(default)]
    result: Option<LeaseGrant>,
}

#[derive(Debug, Deserialize)]
struct TxnReply {
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<TxnOp>,
}

#[derive(Debug, Deserialize)]
struct TxnOp {
    #[serde(default)]
    response_range: Option<RangeReply>,
}

#[derive(Debug, Default, Deserialize)]
struct RangeReply {
    #[serde(default)]
    kvs: Vec<EtcdKv>,
}

#[derive(Debug, Deserialize)]
struct EtcdKv {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "int64")]
    lease: i64,
}
