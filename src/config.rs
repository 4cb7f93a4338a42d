use anyhow::Result;
use serde::Deserialize;
use std::env;

use crate::policy::PolicyDescriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub facilitator: FacilitatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Settlement network the wallet pays on (e.g. "base", "base-sepolia").
    pub chain: String,
    pub policies: Vec<PolicyDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacilitatorConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let policies: Vec<PolicyDescriptor> = match env::var("AGENT_POLICIES") {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| anyhow::anyhow!("AGENT_POLICIES is not a valid policy list: {}", e))?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            agent: AgentConfig {
                name: env::var("AGENT_NAME").unwrap_or_else(|_| "agent".to_string()),
                chain: env::var("AGENT_CHAIN").unwrap_or_else(|_| "base".to_string()),
                policies,
            },
            facilitator: FacilitatorConfig {
                url: env::var("FACILITATOR_URL")
                    .unwrap_or_else(|_| "https://pay.tollgate.dev".to_string()),
                api_key: env::var("FACILITATOR_API_KEY").ok(),
                timeout_secs: env::var("FACILITATOR_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
            },
        })
    }
}
