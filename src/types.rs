// Shared types and the error taxonomy for the payment flow

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::discovery::DiscoveryBundle;
use crate::policy::DenialReason;
use crate::signer::{Receipt, SettlementError};

/// HTTP status that signals a payment requirement.
pub const PAYMENT_REQUIRED: StatusCode = StatusCode::PAYMENT_REQUIRED;

/// Header carrying proof of payment on the retried request.
pub const PAYMENT_HEADER: &str = "x-payment";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("payment denied by policy: {0}")]
    PolicyDenied(DenialReason),

    #[error("settlement failed: {0}")]
    Settlement(#[from] SettlementError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    Request(String),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Final response returned by [`AgentWallet::fetch`](crate::client::AgentWallet::fetch).
///
/// Owns the body bytes so a raw 402 challenge can be handed back unchanged
/// even after its body was read for requirement parsing. `payment` is `Some`
/// exactly when a settlement happened for this request, letting callers
/// distinguish "got the resource" from "got the resource after paying".
#[derive(Debug)]
pub struct AgentResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub payment: Option<Receipt>,
    pub discovery: DiscoveryBundle,
}

impl AgentResponse {
    pub fn is_payment_required(&self) -> bool {
        self.status == PAYMENT_REQUIRED
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> AgentResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AgentError::Request(format!("response body is not valid JSON: {}", e)))
    }

    /// Body as UTF-8 text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
