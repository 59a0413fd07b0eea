use nostr::{EventBuilder, JsonUtil, Keys, Kind, Tag, Timestamp};

/// Base timestamp for fixture events; `created_at` is offset from it so
/// ordering is stable across runs.
const EPOCH: u64 = 1_700_000_000;

/// A throwaway identity that signs fixture events.
#[derive(Debug, Clone)]
pub struct Author {
    keys: Keys,
}

impl Default for Author {
    fn default() -> Self {
        Self::new()
    }
}

impl Author {
    pub fn new() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    /// Hex public key
    pub fn pubkey(&self) -> String {
        self.keys.public_key().to_hex()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// NIP-01 JSON of a signed event created `offset` seconds after the
    /// fixture epoch.
    pub fn event(&self, kind: u16, content: &str, offset: u64) -> String {
        self.event_with_tags(kind, content, offset, &[])
    }

    /// Like [`Author::event`] with extra tags, each given as its fields.
    pub fn event_with_tags(&self, kind: u16, content: &str, offset: u64, tags: &[&[&str]]) -> String {
        let tags = tags
            .iter()
            .map(|fields| Tag::parse(fields.iter().copied()).expect("fixture tag"));
        EventBuilder::new(Kind::from(kind), content)
            .tags(tags)
            .custom_created_at(Timestamp::from(EPOCH + offset))
            .sign_with_keys(&self.keys)
            .expect("sign fixture event")
            .as_json()
    }

    /// `n` kind-1 notes with increasing `created_at`.
    pub fn notes(&self, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| self.event(1, &format!("note {i}"), i as u64))
            .collect()
    }
}

/// Rewrites the content of a signed event so its id and signature no
/// longer verify.
pub fn tampered(event_json: &str) -> String {
    let mut value: serde_json::Value = serde_json::from_str(event_json).expect("fixture json");
    value["content"] = serde_json::Value::String("tampered".to_string());
    value.to_string()
}
