//! Process-wide map of shared relays, keyed by normalized URL.
//!
//! Entries are weak; a relay leaves the map when its last handle drops.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use super::RelayInner;

static RELAYS: LazyLock<Mutex<HashMap<String, Weak<RelayInner>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns the live relay for `url` or inserts the one `create` builds.
/// Lookup and insert happen under one lock.
pub(super) fn get_or_insert_with<F>(url: &str, create: F) -> Arc<RelayInner>
where
    F: FnOnce() -> Arc<RelayInner>,
{
    let mut relays = RELAYS.lock();
    if let Some(existing) = relays.get(url).and_then(Weak::upgrade) {
        return existing;
    }
    let inner = create();
    relays.insert(url.to_string(), Arc::downgrade(&inner));
    inner
}

/// Drops the entry for `url` if it still points at `dying`.
pub(super) fn remove(url: &str, dying: *const RelayInner) {
    let mut relays = RELAYS.lock();
    if relays.get(url).is_some_and(|w| w.as_ptr() == dying) {
        relays.remove(url);
    }
}

/// Live shared relays
pub fn shared_count() -> usize {
    RELAYS
        .lock()
        .values()
        .filter(|w| w.strong_count() > 0)
        .count()
}

/// Whether a shared relay for `url` is alive
pub fn is_shared(url: &str) -> bool {
    RELAYS
        .lock()
        .get(url)
        .is_some_and(|w| w.strong_count() > 0)
}
