//! NIP-11 relay information document

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// `limitation` object of a NIP-11 document. Zero means "not advertised".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayLimitation {
    pub max_message_length: u64,
    pub max_subscriptions: u64,
    pub max_filters: u64,
    pub max_limit: u64,
    pub max_subid_length: u64,
    pub max_event_tags: u64,
    pub max_content_length: u64,
    pub min_pow_difficulty: u64,
    pub auth_required: bool,
    pub payment_required: bool,
    pub restricted_writes: bool,
    pub created_at_lower_limit: u64,
    pub created_at_upper_limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<RelayLimitation>,
}

impl RelayInformation {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Internal(format!("nip11 document: {e}")))
    }

    pub fn supports(&self, nip: u32) -> bool {
        self.supported_nips.contains(&nip)
    }

    /// Limits, or the all-zero "unlimited" value
    pub fn limits(&self) -> RelayLimitation {
        self.limitation.clone().unwrap_or_default()
    }
}

/// HTTP(S) origin serving the NIP-11 document for a relay URL.
pub fn info_url(relay_url: &str) -> Result<Url> {
    let mut url = Url::parse(relay_url)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::InvalidUrl(relay_url.to_string()))?;
    Ok(url)
}

/// GET the relay's NIP-11 document with `Accept: application/nostr+json`.
pub async fn fetch_relay_info(relay_url: &str, timeout: Duration) -> Result<RelayInformation> {
    let url = info_url(relay_url)?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))?;
    let resp = client
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "application/nostr+json")
        .send()
        .await
        .map_err(|e| Error::ConnectionFailed(format!("nip11 {url}: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::ConnectionFailed(format!("nip11 {url}: {status}")));
    }
    let info = resp
        .json::<RelayInformation>()
        .await
        .map_err(|e| Error::Internal(format!("nip11 {url}: {e}")))?;
    tracing::debug!(url = %relay_url, name = ?info.name, nips = ?info.supported_nips, "relay info");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_urls_map_to_http_origins() {
        assert_eq!(
            info_url("wss://relay.example/").unwrap().as_str(),
            "https://relay.example/"
        );
        assert_eq!(
            info_url("ws://127.0.0.1:7777").unwrap().as_str(),
            "http://127.0.0.1:7777/"
        );
        assert!(matches!(
            info_url("ftp://relay.example"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn missing_fields_default_to_unlimited() {
        let info = RelayInformation::from_json(
            r#"{"name":"r","supported_nips":[1,11,42],"limitation":{"auth_required":true}}"#,
        )
        .unwrap();
        assert!(info.supports(42));
        assert!(!info.supports(45));
        let limits = info.limits();
        assert!(limits.auth_required);
        assert_eq!(limits.max_subscriptions, 0);
        assert_eq!(RelayInformation::default().limits(), RelayLimitation::default());
    }

    #[tokio::test]
    async fn fetch_sends_nostr_accept_header() {
        let stub = pika_test_utils::spawn_nip11_stub(
            "200 OK",
            r#"{"name":"stub","software":"pika","limitation":{"max_subscriptions":2}}"#,
        );
        let info = fetch_relay_info(&stub.relay_url, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.name.as_deref(), Some("stub"));
        assert_eq!(info.limits().max_subscriptions, 2);

        let req = stub.request(Duration::from_secs(1)).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.header("accept"), Some("application/nostr+json"));
    }

    #[tokio::test]
    async fn http_errors_are_connection_failures() {
        let stub = pika_test_utils::spawn_nip11_stub("503 Service Unavailable", "{}");
        let err = fetch_relay_info(&stub.http_url, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }
}
