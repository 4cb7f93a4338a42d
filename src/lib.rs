// Tollgate - Pay-per-call HTTP client for autonomous agents (x402)

pub mod config;
pub mod types;
pub mod protocol;   // 402 challenge parsing and requirement selection
pub mod policy;     // Spend policies (budget, vendor ACL, rate limit)
pub mod signer;     // Settlement signer adapter over the facilitator
pub mod ledger;     // Append-only transaction ledger and spend bookkeeping
pub mod discovery;  // Related-tool discovery header decoding
pub mod client;     // AgentWallet orchestrator

// Re-exports for convenience
pub use client::{AgentWallet, AgentWalletBuilder};
pub use config::Config;
pub use discovery::{DiscoveredTool, DiscoveryBundle};
pub use ledger::{SpendSummary, Transaction, TxStatus};
pub use policy::{DenialReason, Policy, PolicyDescriptor};
pub use protocol::PaymentRequirement;
pub use signer::{FacilitatorSigner, Receipt, SettlementError, SettlementSigner};
pub use types::{AgentError, AgentResponse, AgentResult};
