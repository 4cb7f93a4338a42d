//! Agent Wallet
//!
//! The orchestrator that turns plain HTTP calls into pay-per-call ones.
//! On a 402 response it parses the payment requirements, checks the spend
//! policies, settles through the configured signer, records the
//! transaction, and retries the original request exactly once with proof
//! of payment attached. Callers never write payment-handling code.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery;
use crate::ledger::{PaymentBook, SpendSummary, Transaction};
use crate::policy::{evaluate, Policy, PolicyDescriptor};
use crate::protocol::{self, PaymentRequirement};
use crate::signer::{FacilitatorSigner, Receipt, SettlementSigner};
use crate::types::{AgentError, AgentResponse, AgentResult, PAYMENT_HEADER, PAYMENT_REQUIRED};

type PaymentHook = Box<dyn Fn(&Receipt, &str) + Send + Sync>;

struct WalletInner {
    name: String,
    chain: String,
    http: reqwest::Client,
    policies: Vec<Policy>,
    signer: Arc<dyn SettlementSigner>,
    on_payment: Option<PaymentHook>,
    /// Ledger and spend counters. Short critical sections only, so
    /// snapshots never block on an in-flight settlement.
    book: Mutex<PaymentBook>,
    /// Serializes evaluate → settle → commit per wallet. Held across the
    /// settlement await so no two requests can both pass a budget check
    /// that, combined, exceeds the cap.
    gate: tokio::sync::Mutex<()>,
}

/// Pay-per-call HTTP client for one logical agent.
///
/// Cheap to clone; clones share the same spend state and ledger.
#[derive(Clone)]
pub struct AgentWallet {
    inner: Arc<WalletInner>,
}

impl std::fmt::Debug for AgentWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentWallet")
            .field("name", &self.inner.name)
            .field("chain", &self.inner.chain)
            .finish_non_exhaustive()
    }
}

impl AgentWallet {
    pub fn builder() -> AgentWalletBuilder {
        AgentWalletBuilder::default()
    }

    /// Build a wallet from environment-driven configuration, settling
    /// through the configured facilitator.
    pub fn from_config(config: &Config) -> AgentResult<Self> {
        let mut signer = FacilitatorSigner::new(&config.facilitator.url, &config.agent.chain)
            .with_timeout(Duration::from_secs(config.facilitator.timeout_secs));
        if let Some(key) = &config.facilitator.api_key {
            signer = signer.with_api_key(key);
        }
        let mut builder = Self::builder()
            .name(&config.agent.name)
            .chain(&config.agent.chain)
            .signer(signer);
        for descriptor in &config.agent.policies {
            builder = builder.policy(descriptor.clone());
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn chain(&self) -> &str {
        &self.inner.chain
    }

    /// GET the given URL, paying transparently if the server asks.
    pub async fn get(&self, url: &str) -> AgentResult<AgentResponse> {
        self.fetch(self.inner.http.get(url)).await
    }

    /// POST a JSON body to the given URL, paying transparently if asked.
    pub async fn post_json<T: serde::Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> AgentResult<AgentResponse> {
        self.fetch(self.inner.http.post(url).json(body)).await
    }

    /// Issue a request, handling a 402 challenge along the way.
    ///
    /// The request must be cloneable (streaming bodies are not) since a
    /// paid request is re-issued once with the proof attached. The retried
    /// response is returned whatever its status: the client never loops
    /// past one retry, even against a server that double-charges.
    pub async fn fetch(&self, request: reqwest::RequestBuilder) -> AgentResult<AgentResponse> {
        let retry = request.try_clone().ok_or_else(|| {
            AgentError::Request("request body must be cloneable for payment retry".to_string())
        })?;

        let response = request.send().await?;
        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let discovery = discovery::extract(&headers);
        let body = response.bytes().await?;

        if status != PAYMENT_REQUIRED {
            return Ok(AgentResponse {
                status,
                headers,
                body,
                payment: None,
                discovery,
            });
        }

        debug!(agent = %self.inner.name, url = %url, "Received 402 challenge");
        let requirements = protocol::parse_requirements(&body);
        let Some(requirement) =
            protocol::select_requirement(&requirements, self.inner.signer.as_ref()).cloned()
        else {
            // Nothing we can pay: surface the raw challenge to the caller.
            warn!(url = %url, "402 carried no payable requirement, passing through");
            return Ok(AgentResponse {
                status,
                headers,
                body,
                payment: None,
                discovery,
            });
        };

        // Settlement runs in its own task: if the caller abandons this
        // future mid-settlement, the payment still resolves to a definite
        // outcome and is recorded before the wallet accepts the next
        // request through the gate.
        let inner = self.inner.clone();
        let settle_url = url.clone();
        let req = requirement.clone();
        let receipt = tokio::spawn(async move { inner.authorize_and_settle(req, settle_url).await })
            .await
            .map_err(|e| AgentError::Request(format!("settlement task aborted: {}", e)))??;

        let retried = retry
            .header(PAYMENT_HEADER, receipt.proof.clone())
            .send()
            .await?;
        let status = retried.status();
        if status == PAYMENT_REQUIRED {
            warn!(
                url = %url,
                "Server demanded payment again after settlement; refusing to pay twice"
            );
        }
        let headers = retried.headers().clone();
        let discovery = discovery::extract(&headers);
        let body = retried.bytes().await?;

        Ok(AgentResponse {
            status,
            headers,
            body,
            payment: Some(receipt),
            discovery,
        })
    }

    /// Read-only spend snapshot, safe to call at any time including while
    /// a settlement is in flight.
    pub fn spend_summary(&self) -> SpendSummary {
        self.inner.book().summarize(Utc::now())
    }

    /// Snapshot of the transaction ledger in insertion order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner.book().transactions()
    }
}

impl WalletInner {
    fn book(&self) -> std::sync::MutexGuard<'_, PaymentBook> {
        // The book is append-only; a poisoned lock leaves it readable.
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn authorize_and_settle(
        &self,
        requirement: PaymentRequirement,
        endpoint: Url,
    ) -> AgentResult<Receipt> {
        let _permit = self.gate.lock().await;

        let verdict = {
            let book = self.book();
            evaluate(
                &self.policies,
                requirement.max_amount,
                &endpoint,
                book.spend_state(),
                Utc::now(),
            )
        };
        if let Err(reason) = verdict {
            info!(agent = %self.name, url = %endpoint, %reason, "Payment denied by policy");
            return Err(AgentError::PolicyDenied(reason));
        }

        match self.signer.settle(&requirement).await {
            Ok(receipt) => {
                self.book().record_settlement(
                    endpoint.to_string(),
                    receipt.amount,
                    requirement.network.clone(),
                    receipt.tx_hash.clone(),
                    Utc::now(),
                );
                info!(
                    agent = %self.name,
                    url = %endpoint,
                    amount = receipt.amount,
                    network = %requirement.network,
                    "Payment settled"
                );
                if let Some(hook) = &self.on_payment {
                    // The settlement is already recorded; a panicking hook
                    // cannot roll it back and must not take the paid retry
                    // down with it.
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        hook(&receipt, endpoint.as_str())
                    }));
                    if outcome.is_err() {
                        warn!(agent = %self.name, url = %endpoint, "Payment hook panicked");
                    }
                }
                Ok(receipt)
            }
            Err(e) => {
                self.book().record_failure(
                    endpoint.to_string(),
                    requirement.max_amount,
                    requirement.network.clone(),
                    Utc::now(),
                );
                warn!(agent = %self.name, url = %endpoint, error = %e, "Settlement failed");
                Err(AgentError::Settlement(e))
            }
        }
    }
}

#[derive(Default)]
pub struct AgentWalletBuilder {
    name: Option<String>,
    chain: Option<String>,
    descriptors: Vec<PolicyDescriptor>,
    signer: Option<Arc<dyn SettlementSigner>>,
    on_payment: Option<PaymentHook>,
    http: Option<reqwest::Client>,
}

impl AgentWalletBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    /// Append a policy descriptor; order is evaluation order.
    pub fn policy(mut self, descriptor: PolicyDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn signer(mut self, signer: impl SettlementSigner + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    pub fn shared_signer(mut self, signer: Arc<dyn SettlementSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Hook invoked exactly once per successful settlement with the
    /// receipt and the requested URL. It runs after the transaction is
    /// recorded; nothing it does rolls the settlement back.
    pub fn on_payment<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Receipt, &str) + Send + Sync + 'static,
    {
        self.on_payment = Some(Box::new(hook));
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> AgentResult<AgentWallet> {
        let signer = self
            .signer
            .ok_or_else(|| AgentError::Config("a settlement signer is required".to_string()))?;

        let mut policies = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            policies.push(descriptor.build().map_err(AgentError::Config)?);
        }

        Ok(AgentWallet {
            inner: Arc::new(WalletInner {
                name: self.name.unwrap_or_else(|| "agent".to_string()),
                chain: self.chain.unwrap_or_else(|| "base".to_string()),
                http: self.http.unwrap_or_default(),
                policies,
                signer,
                on_payment: self.on_payment,
                book: Mutex::new(PaymentBook::new(Utc::now())),
                gate: tokio::sync::Mutex::new(()),
            }),
        })
    }
}
