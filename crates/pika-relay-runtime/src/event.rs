//! Nostr event value type
//!
//! The runtime moves events around without interpreting them, so [`Event`]
//! is a plain serde struct mirroring the NIP-01 JSON object. Id and
//! signature checks are delegated to the `nostr` crate.

use std::time::{SystemTime, UNIX_EPOCH};

use nostr::JsonUtil;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// NIP-42 client authentication kind
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// NIP-01 event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Parse a NIP-01 event object
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidEvent(e.to_string()))
    }

    pub fn as_json(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Values of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().is_some_and(|n| n == name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// Hex-encoded NIP-01 id computed from the event body
    pub fn compute_id(&self) -> String {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Checks field encodings without touching cryptography.
    pub fn check_shape(&self) -> Result<()> {
        check_hex(&self.id, 64, "id")?;
        check_hex(&self.pubkey, 64, "pubkey")?;
        check_hex(&self.sig, 128, "sig")?;
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidEvent("empty tag".to_string()));
        }
        Ok(())
    }

    /// Full check: shape, then id hash and Schnorr signature in one pass
    /// through `nostr`.
    pub fn verify(&self) -> Result<()> {
        self.check_shape()?;
        let parsed = nostr::Event::from_json(self.as_json())
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        parsed
            .verify()
            .map_err(|e| Error::InvalidEvent(format!("{} does not verify: {e}", self.id)))
    }
}

/// Unsigned event body handed to an [`EventSigner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    /// NIP-42 AUTH body for `relay_url` answering `challenge`.
    pub fn client_auth(relay_url: &str, challenge: &str) -> Self {
        Self {
            created_at: unix_now(),
            kind: KIND_CLIENT_AUTH,
            tags: vec![
                vec!["relay".to_string(), relay_url.to_string()],
                vec!["challenge".to_string(), challenge.to_string()],
            ],
            content: String::new(),
        }
    }
}

/// Turns templates into signed events.
pub trait EventSigner: Send + Sync {
    fn sign(&self, template: EventTemplate) -> Result<Event>;
}

impl<F> EventSigner for F
where
    F: Fn(EventTemplate) -> Result<Event> + Send + Sync,
{
    fn sign(&self, template: EventTemplate) -> Result<Event> {
        self(template)
    }
}

impl EventSigner for nostr::Keys {
    fn sign(&self, template: EventTemplate) -> Result<Event> {
        let tags = template
            .tags
            .into_iter()
            .map(|t| nostr::Tag::parse(t).map_err(|e| Error::InvalidEvent(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let signed = nostr::EventBuilder::new(nostr::Kind::from(template.kind), template.content)
            .tags(tags)
            .custom_created_at(nostr::Timestamp::from(template.created_at))
            .sign_with_keys(self)
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        Event::from_json(&signed.as_json())
    }
}

pub(crate) fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let body = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    hex::encode(Sha256::digest(body.to_string().as_bytes()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_hex(value: &str, len: usize, field: &str) -> Result<()> {
    if value.len() != len || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidEvent(format!(
            "{field} must be {len} hex chars"
        )));
    }
    Ok(())
}
