use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// How long a proxied object stays in process memory. Clients hold it far
/// longer via Cache-Control; this bound only limits resident memory.
const ENTRY_TTL_SECONDS: i64 = 3600;

/// Upper bound on resident entries; inserts beyond it are dropped.
const MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
pub struct CachedObject {
    pub content_type: Option<String>,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

/// Edge cache for the public download proxy, keyed by object path only
/// (query strings never participate). Range responses are never stored.
pub struct EdgeCache {
    entries: DashMap<String, CachedObject>,
}

impl EdgeCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedObject> {
        let entry = self.entries.get(key)?;
        if Utc::now() - entry.stored_at > Duration::seconds(ENTRY_TTL_SECONDS) {
            return None;
        }
        Some(entry.clone())
    }

    pub fn insert(&self, key: String, content_type: Option<String>, body: Bytes) {
        if self.entries.len() >= MAX_ENTRIES && !self.entries.contains_key(&key) {
            tracing::debug!(key, "edge cache full, skipping insert");
            return;
        }
        self.entries.insert(
            key,
            CachedObject {
                content_type,
                body,
                stored_at: Utc::now(),
            },
        );
    }

    /// Periodic cleanup of aged entries, run from the background worker.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, v| now - v.stored_at <= Duration::seconds(ENTRY_TTL_SECONDS));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EdgeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = EdgeCache::new();
        cache.insert(
            "gemini/2024/01/02/x.png".to_string(),
            Some("image/png".to_string()),
            Bytes::from_static(b"png-bytes"),
        );

        let hit = cache.get("gemini/2024/01/02/x.png").unwrap();
        assert_eq!(hit.body.as_ref(), b"png-bytes");
        assert_eq!(hit.content_type.as_deref(), Some("image/png"));
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn test_aged_entries_expire() {
        let cache = EdgeCache::new();
        cache.insert("k".to_string(), None, Bytes::from_static(b"v"));
        cache
            .entries
            .get_mut("k")
            .unwrap()
            .stored_at = Utc::now() - Duration::seconds(ENTRY_TTL_SECONDS + 1);

        assert!(cache.get("k").is_none());
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }
}
