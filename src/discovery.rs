//! Tool Discovery
//!
//! Paid marketplaces piggyback a discovery header on their responses so an
//! agent that hit one endpoint can find related ones. The header value is
//! base64 of a JSON document:
//!
//! ```json
//! {"related_tools": [{"name": "weather", "price": "0.005", "description": "..."}]}
//! ```
//!
//! Decoding is strictly best-effort: an absent or malformed header yields
//! an empty bundle and never blocks the request or payment flow.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Response header advertising related paid endpoints.
pub const DISCOVERY_HEADER: &str = "x-payment-discovery";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredTool {
    pub name: String,
    /// Price in whole currency units, as advertised (display value).
    pub price: String,
    pub description: String,
}

/// Ephemeral, read-only list of advertised tools. Never persisted and
/// never feeds back into the payment flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryBundle {
    #[serde(default)]
    pub related_tools: Vec<DiscoveredTool>,
}

impl DiscoveryBundle {
    pub fn is_empty(&self) -> bool {
        self.related_tools.is_empty()
    }
}

/// Decode the discovery header from a response, if present.
pub fn extract(headers: &HeaderMap) -> DiscoveryBundle {
    let Some(value) = headers.get(DISCOVERY_HEADER) else {
        return DiscoveryBundle::default();
    };
    let Ok(text) = value.to_str() else {
        debug!("Discovery header is not valid ASCII, ignoring");
        return DiscoveryBundle::default();
    };
    let Ok(raw) = BASE64.decode(text) else {
        debug!("Discovery header is not valid base64, ignoring");
        return DiscoveryBundle::default();
    };
    match serde_json::from_slice(&raw) {
        Ok(bundle) => bundle,
        Err(e) => {
            debug!("Discovery header carried malformed JSON: {}", e);
            DiscoveryBundle::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(DISCOVERY_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extract_related_tools() {
        let doc = r#"{"related_tools":[
            {"name":"weather","price":"0.005","description":"Current conditions"},
            {"name":"dns","price":"0.001","description":"DNS lookup"}
        ]}"#;
        let bundle = extract(&headers_with(&BASE64.encode(doc)));
        assert_eq!(bundle.related_tools.len(), 2);
        assert_eq!(bundle.related_tools[0].name, "weather");
        assert_eq!(bundle.related_tools[1].price, "0.001");
    }

    #[test]
    fn test_absent_header_yields_empty() {
        assert!(extract(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_invalid_base64_yields_empty() {
        assert!(extract(&headers_with("%%%not-base64%%%")).is_empty());
    }

    #[test]
    fn test_malformed_json_yields_empty() {
        let bundle = extract(&headers_with(&BASE64.encode("{not json")));
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_unexpected_shape_yields_empty() {
        let bundle = extract(&headers_with(&BASE64.encode(r#"{"tools":[1,2,3]}"#)));
        assert!(bundle.is_empty());
    }
}
