//! Settlement Signer
//!
//! The signer is an adapter over an external payment facilitator: it takes
//! a chosen payment requirement, produces a signed on-chain payment, and
//! returns a receipt. The core never does cryptographic signing or chain
//! submission itself; anything implementing [`SettlementSigner`] slots in,
//! including the deterministic doubles in [`testing`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::PaymentRequirement;

/// Default deadline for a settlement round-trip.
pub const DEFAULT_SETTLE_TIMEOUT_SECS: u64 = 30;

/// Proof that a facilitator settled a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// Amount settled, in the smallest currency unit.
    pub amount: u64,
    /// On-chain transaction hash, if the facilitator reported one.
    pub tx_hash: Option<String>,
    /// Opaque proof-of-payment value the retried request carries in the
    /// `X-PAYMENT` header.
    pub proof: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("facilitator unreachable: {0}")]
    Network(String),

    #[error("facilitator rejected payment: {0}")]
    Rejected(String),

    #[error("settlement timed out after {0}ms")]
    Timeout(u64),

    #[error("signing key failure: {0}")]
    Key(String),
}

impl SettlementError {
    /// Whether an outer caller could reasonably try again later.
    /// Explicit rejections and key failures will not heal by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::Network(_) | SettlementError::Timeout(_))
    }
}

/// Capability interface for turning a payment requirement into a settled
/// payment. Implementations must be swappable without touching any other
/// component.
#[async_trait]
pub trait SettlementSigner: Send + Sync {
    /// Whether this signer can settle on the given network.
    fn supports_network(&self, network: &str) -> bool;

    /// Settle the requirement, returning within a bounded deadline.
    async fn settle(&self, requirement: &PaymentRequirement) -> Result<Receipt, SettlementError>;
}

/// Signer that delegates settlement to a remote facilitator service.
pub struct FacilitatorSigner {
    http: reqwest::Client,
    facilitator_url: String,
    api_key: Option<String>,
    networks: Vec<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SettleRequest<'a> {
    scheme: &'a str,
    network: &'a str,
    #[serde(rename = "maxAmountRequired")]
    max_amount_required: String,
    #[serde(rename = "payTo")]
    pay_to: &'a str,
    asset: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SettleResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    payment: Option<String>,
    #[serde(rename = "txHash", default)]
    tx_hash: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl FacilitatorSigner {
    pub fn new(facilitator_url: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            facilitator_url: facilitator_url.into(),
            api_key: None,
            networks: vec![network.into()],
            timeout: Duration::from_secs(DEFAULT_SETTLE_TIMEOUT_SECS),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Add another network this signer can settle on.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.networks.push(network.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call_facilitator(
        &self,
        requirement: &PaymentRequirement,
    ) -> Result<Receipt, SettlementError> {
        let url = format!("{}/settle", self.facilitator_url.trim_end_matches('/'));
        let payload = SettleRequest {
            scheme: &requirement.scheme,
            network: &requirement.network,
            max_amount_required: requirement.max_amount.to_string(),
            pay_to: &requirement.pay_to,
            asset: &requirement.asset,
            resource: requirement.resource.as_deref(),
        };

        let mut request = self.http.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SettlementError::Network(e.to_string()))?;

        let status = response.status();
        let body: SettleResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Network(format!("malformed facilitator reply: {}", e)))?;

        if !status.is_success() || !body.success {
            let reason = body
                .error
                .unwrap_or_else(|| format!("facilitator returned {}", status));
            warn!(network = %requirement.network, %reason, "Settlement rejected");
            return Err(SettlementError::Rejected(reason));
        }

        let proof = body.payment.ok_or_else(|| {
            SettlementError::Rejected("facilitator reply carried no payment proof".to_string())
        })?;

        info!(
            network = %requirement.network,
            amount = requirement.max_amount,
            tx_hash = body.tx_hash.as_deref().unwrap_or("-"),
            "Settlement confirmed"
        );

        Ok(Receipt {
            amount: requirement.max_amount,
            tx_hash: body.tx_hash,
            proof,
        })
    }
}

#[async_trait]
impl SettlementSigner for FacilitatorSigner {
    fn supports_network(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }

    async fn settle(&self, requirement: &PaymentRequirement) -> Result<Receipt, SettlementError> {
        debug!(
            network = %requirement.network,
            amount = requirement.max_amount,
            pay_to = %requirement.pay_to,
            "Submitting settlement to facilitator"
        );
        match tokio::time::timeout(self.timeout, self.call_facilitator(requirement)).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Deterministic signer doubles for tests and dry runs.
pub mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Signer that settles instantly with a synthetic receipt, or fails
    /// with a fixed error. Counts settle calls so tests can assert the
    /// signer was never invoked on a denied request.
    pub struct StaticSigner {
        network: String,
        tx_hash: Option<String>,
        failure: Option<fn() -> SettlementError>,
        calls: AtomicUsize,
    }

    impl StaticSigner {
        /// A signer that settles anything on `network`.
        pub fn settling_on(network: impl Into<String>) -> Self {
            Self {
                network: network.into(),
                tx_hash: Some("0xabc".to_string()),
                failure: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
            self.tx_hash = Some(tx_hash.into());
            self
        }

        /// A signer that fails every settlement with the given error.
        pub fn failing_on(network: impl Into<String>, failure: fn() -> SettlementError) -> Self {
            Self {
                network: network.into(),
                tx_hash: None,
                failure: Some(failure),
                calls: AtomicUsize::new(0),
            }
        }

        /// Number of times `settle` was invoked.
        pub fn settle_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SettlementSigner for StaticSigner {
        fn supports_network(&self, network: &str) -> bool {
            self.network == network
        }

        async fn settle(
            &self,
            requirement: &PaymentRequirement,
        ) -> Result<Receipt, SettlementError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            Ok(Receipt {
                amount: requirement.max_amount,
                tx_hash: self.tx_hash.clone(),
                proof: format!("synthetic:{}:{}", requirement.network, requirement.max_amount),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticSigner;
    use super::*;

    fn requirement(network: &str, amount: u64) -> PaymentRequirement {
        PaymentRequirement {
            scheme: "exact".to_string(),
            network: network.to_string(),
            pay_to: "0xabc123".to_string(),
            max_amount: amount,
            asset: "USDC".to_string(),
            resource: None,
            max_timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_facilitator_settle_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/settle")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(r#"{"success":true,"payment":"proof-xyz","txHash":"0xfeed"}"#)
            .create_async()
            .await;

        let signer = FacilitatorSigner::new(server.url(), "base").with_api_key("test-key");
        let receipt = signer.settle(&requirement("base", 10_000)).await.unwrap();

        assert_eq!(receipt.amount, 10_000);
        assert_eq!(receipt.proof, "proof-xyz");
        assert_eq!(receipt.tx_hash.as_deref(), Some("0xfeed"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_facilitator_rejection_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/settle")
            .with_status(400)
            .with_body(r#"{"success":false,"error":"insufficient funds"}"#)
            .create_async()
            .await;

        let signer = FacilitatorSigner::new(server.url(), "base");
        let err = signer.settle(&requirement("base", 10_000)).await.unwrap_err();

        assert!(matches!(err, SettlementError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_stalled_facilitator_hits_the_deadline() {
        // A facilitator that accepts the connection and then goes silent:
        // the settle call must resolve as Timeout, not hang.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _held_open = socket;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let signer = FacilitatorSigner::new(format!("http://{}", addr), "base")
            .with_timeout(Duration::from_millis(100));
        let err = signer.settle(&requirement("base", 1)).await.unwrap_err();

        assert!(matches!(err, SettlementError::Timeout(100)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_facilitator_is_retryable() {
        // Non-routable port: the connect failure maps to Network, which an
        // outer caller may retry later.
        let signer = FacilitatorSigner::new("http://127.0.0.1:1", "base")
            .with_timeout(Duration::from_millis(500));
        let err = signer.settle(&requirement("base", 1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_static_signer_counts_calls() {
        let signer = StaticSigner::settling_on("base");
        assert!(signer.supports_network("base"));
        assert!(!signer.supports_network("solana"));
        assert_eq!(signer.settle_calls(), 0);

        let receipt = signer.settle(&requirement("base", 42)).await.unwrap();
        assert_eq!(receipt.amount, 42);
        assert_eq!(signer.settle_calls(), 1);
    }
}
