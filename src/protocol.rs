//! x402 Challenge Parsing
//!
//! Decodes the body of a 402 response into zero or more payment
//! requirements. A 402 body looks like:
//!
//! ```json
//! {
//!   "paymentRequirements": [{
//!     "scheme": "exact",
//!     "network": "base",
//!     "maxAmountRequired": "10000",
//!     "payTo": "0x3CB9...",
//!     "asset": "USDC"
//!   }]
//! }
//! ```
//!
//! `maxAmountRequired` is a decimal string in the smallest currency unit
//! (micro-USDC for USDC). Parsing is deliberately lossy: a missing or
//! malformed requirements field yields an empty list, never an error:
//! "no requirements" means "cannot pay, surface the raw 402 to the caller."

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::signer::SettlementSigner;

/// One payment offer from a 402 challenge. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequirement {
    /// Payment scheme identifier (e.g. "exact").
    pub scheme: String,
    /// Settlement network (e.g. "base", "base-sepolia").
    pub network: String,
    /// Recipient address on the settlement network.
    pub pay_to: String,
    /// Maximum amount, in the smallest currency unit.
    pub max_amount: u64,
    /// Asset identifier (e.g. "USDC" or a token contract address).
    pub asset: String,
    /// Resource path this requirement covers, if advertised.
    pub resource: Option<String>,
    /// Offer validity window in seconds, if advertised.
    pub max_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChallengeBody {
    #[serde(rename = "paymentRequirements", default)]
    payment_requirements: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RequirementWire {
    #[serde(default = "default_scheme")]
    scheme: String,
    network: String,
    #[serde(rename = "maxAmountRequired")]
    max_amount_required: AmountWire,
    #[serde(rename = "payTo")]
    pay_to: String,
    asset: String,
    #[serde(default)]
    resource: Option<String>,
    #[serde(rename = "maxTimeoutSeconds", default)]
    max_timeout_seconds: Option<u64>,
}

fn default_scheme() -> String {
    "exact".to_string()
}

/// Amount on the wire: a decimal string per the x402 spec, but some
/// servers send a bare integer.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountWire {
    Text(String),
    Number(u64),
}

impl AmountWire {
    fn parse(&self) -> Option<u64> {
        match self {
            AmountWire::Text(s) => s.trim().parse().ok(),
            AmountWire::Number(n) => Some(*n),
        }
    }
}

/// Parse a 402 response body into payment requirements.
///
/// Individually malformed entries are skipped with a warning; a body that
/// is not JSON or has no recognized requirements field yields an empty vec.
pub fn parse_requirements(body: &[u8]) -> Vec<PaymentRequirement> {
    let challenge: ChallengeBody = match serde_json::from_slice(body) {
        Ok(c) => c,
        Err(e) => {
            debug!("402 body is not a recognized challenge: {}", e);
            return Vec::new();
        }
    };

    challenge
        .payment_requirements
        .into_iter()
        .filter_map(|entry| {
            let wire: RequirementWire = match serde_json::from_value(entry) {
                Ok(w) => w,
                Err(e) => {
                    warn!("Skipping malformed payment requirement: {}", e);
                    return None;
                }
            };
            let Some(max_amount) = wire.max_amount_required.parse() else {
                warn!(
                    network = %wire.network,
                    "Skipping payment requirement with unparseable amount"
                );
                return None;
            };
            Some(PaymentRequirement {
                scheme: wire.scheme,
                network: wire.network,
                pay_to: wire.pay_to,
                max_amount,
                asset: wire.asset,
                resource: wire.resource,
                max_timeout_seconds: wire.max_timeout_seconds,
            })
        })
        .collect()
}

/// Select the requirement to pay: the first one whose network the signer
/// supports. `None` means the client behaves as if parsing yielded nothing.
pub fn select_requirement<'a>(
    requirements: &'a [PaymentRequirement],
    signer: &dyn SettlementSigner,
) -> Option<&'a PaymentRequirement> {
    requirements
        .iter()
        .find(|r| signer.supports_network(&r.network))
}
