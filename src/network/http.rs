//! HTTP client for the node JSON command API
//!
//! Every call is a `POST` of `{"command": ..., ...}` to the provider URL.
//! Transient failures (timeouts, refused connections, 5xx) are retried with
//! exponential backoff; node-reported errors are not.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{Network, NodeSettings, TransactionsToApprove};
use crate::bundle::{Hash, Transaction};
use crate::error::{Error, Result};

const API_VERSION_HEADER: &str = "X-IOTA-API-Version";
const API_VERSION: &str = "1";

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    exception: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HashesResponse {
    hashes: Vec<Hash>,
}

#[derive(Debug, Deserialize)]
struct TrytesResponse {
    trytes: Vec<Transaction>,
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    /// Balances are sent as decimal strings
    balances: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConsistencyResponse {
    state: bool,
    #[serde(default)]
    info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatesResponse {
    states: Vec<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInfoResponse {
    latest_solid_subtangle_milestone: Hash,
}

#[derive(Debug, Deserialize)]
struct EmptyResponse {}

/// Node client over HTTP
///
/// Transactions cross the wire as JSON `Transaction` objects, both in
/// `getTrytes` responses and in `attachToTangle`, `storeTransactions` and
/// `broadcastTransactions` requests. A stock node expects raw tryte strings
/// there, so this client only talks to a node or proxy speaking the JSON form.
pub struct HttpNetwork {
    client: Client,
    settings: RwLock<NodeSettings>,
}

impl HttpNetwork {
    pub fn new(settings: NodeSettings) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            settings: RwLock::new(settings),
        })
    }

    pub fn settings(&self) -> Result<NodeSettings> {
        self.settings
            .read()
            .map(|settings| settings.clone())
            .map_err(|e| Error::Internal(format!("settings lock poisoned: {}", e)))
    }

    /// Run a command, retrying transient failures
    async fn command<R: DeserializeOwned>(&self, body: Value) -> Result<R> {
        let settings = self.settings()?;
        let name = body["command"].as_str().unwrap_or("unknown").to_string();

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_millis(2_000),
            max_elapsed_time: Some(Duration::from_millis(
                settings.timeout_ms * settings.max_retries.max(1) as u64,
            )),
            ..Default::default()
        };

        let mut attempts = 0u32;
        retry(backoff, || {
            attempts += 1;
            let attempt = attempts;
            let settings = &settings;
            let body = &body;
            let name = &name;
            async move {
                match self.command_once(settings, body).await {
                    Ok(response) => Ok(response),
                    Err(e) if e.is_retryable() && attempt < settings.max_retries.max(1) => {
                        warn!("Retryable node error on {} (attempt {}): {}", name, attempt, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        error!("Node command {} failed: {}", name, e);
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await
    }

    /// Single command attempt
    async fn command_once<R: DeserializeOwned>(&self, settings: &NodeSettings, body: &Value) -> Result<R> {
        let response = self
            .client
            .post(&settings.provider)
            .header(API_VERSION_HEADER, API_VERSION)
            .json(body)
            .timeout(Duration::from_millis(settings.timeout_ms))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RpcTimeout(settings.timeout_ms)
                } else {
                    Error::from(e)
                }
            })?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .ok()
                .and_then(|e| e.error.or(e.exception))
                .unwrap_or(text);

            // Server-side trouble is worth another try; rejected requests are not
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::Rpc(format!("node error {}: {}", status, message)));
            }
            return Err(Error::NodeRejected(format!("{}: {}", status, message)));
        }

        serde_json::from_str(&text)
            .map_err(|e| Error::Deserialization(format!("Failed to parse node response: {}", e)))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn find_transactions(&self, addresses: &[String]) -> Result<Vec<Hash>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let response: HashesResponse = self
            .command(json!({ "command": "findTransactions", "addresses": addresses }))
            .await?;
        debug!("Found {} transactions at {} addresses", response.hashes.len(), addresses.len());
        Ok(response.hashes)
    }

    async fn get_trytes(&self, hashes: &[Hash]) -> Result<Vec<Transaction>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let response: TrytesResponse = self
            .command(json!({ "command": "getTrytes", "hashes": hashes }))
            .await?;
        Ok(response.trytes)
    }

    async fn get_balances(&self, addresses: &[String]) -> Result<Vec<u64>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let threshold = self.settings()?.balance_threshold;
        let response: BalancesResponse = self
            .command(json!({
                "command": "getBalances",
                "addresses": addresses,
                "threshold": threshold,
            }))
            .await?;

        response
            .balances
            .iter()
            .map(|balance| {
                balance
                    .parse::<u64>()
                    .map_err(|_| Error::Deserialization(format!("illegal balance {}", balance)))
            })
            .collect()
    }

    async fn check_consistency(&self, tails: &[Hash]) -> Result<bool> {
        if tails.is_empty() {
            return Ok(true);
        }
        let response: ConsistencyResponse = self
            .command(json!({ "command": "checkConsistency", "tails": tails }))
            .await?;
        if !response.state {
            debug!("Inconsistent tails: {}", response.info.unwrap_or_default());
        }
        Ok(response.state)
    }

    async fn get_latest_inclusion(&self, hashes: &[Hash]) -> Result<Vec<bool>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let info: NodeInfoResponse = self.command(json!({ "command": "getNodeInfo" })).await?;
        let response: StatesResponse = self
            .command(json!({
                "command": "getInclusionStates",
                "transactions": hashes,
                "tips": [info.latest_solid_subtangle_milestone],
            }))
            .await?;
        Ok(response.states)
    }

    async fn get_transactions_to_approve(
        &self,
        depth: u32,
        reference: Option<&Hash>,
    ) -> Result<TransactionsToApprove> {
        let mut body = json!({ "command": "getTransactionsToApprove", "depth": depth });
        if let Some(reference) = reference {
            body["reference"] = json!(reference);
        }
        self.command(body).await
    }

    async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        min_weight_magnitude: u32,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>> {
        let response: TrytesResponse = self
            .command(json!({
                "command": "attachToTangle",
                "trunkTransaction": trunk,
                "branchTransaction": branch,
                "minWeightMagnitude": min_weight_magnitude,
                "trytes": transactions,
            }))
            .await?;
        Ok(response.trytes)
    }

    async fn store_and_broadcast(&self, transactions: &[Transaction]) -> Result<()> {
        let _: EmptyResponse = self
            .command(json!({ "command": "storeTransactions", "trytes": transactions }))
            .await?;
        let _: EmptyResponse = self
            .command(json!({ "command": "broadcastTransactions", "trytes": transactions }))
            .await?;
        Ok(())
    }

    async fn were_addresses_spent_from(&self, addresses: &[String]) -> Result<Vec<bool>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let response: StatesResponse = self
            .command(json!({ "command": "wereAddressesSpentFrom", "addresses": addresses }))
            .await?;
        Ok(response.states)
    }

    fn set_settings(&self, settings: NodeSettings) -> Result<()> {
        let mut current = self
            .settings
            .write()
            .map_err(|e| Error::Internal(format!("settings lock poisoned: {}", e)))?;
        debug!("Switching node provider to {}", settings.provider);
        *current = settings;
        Ok(())
    }
}
