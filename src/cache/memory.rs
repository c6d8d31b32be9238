use crate::cache::{Cache, CacheError};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Number of resident entries inspected when choosing an eviction victim.
const EVICTION_SAMPLE: usize = 5;

/// Access counters are reset once they track this many keys per slot.
const COUNTERS_PER_ENTRY: usize = 10;

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
    hits: AtomicU32,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-process cache bounded by entry count.
///
/// Admission is frequency based: once the cache is full a new key only
/// displaces a sampled resident entry when it has been requested at least as
/// often as that entry has been read. A zero effective TTL means the entry
/// never expires.
pub struct MemoryCache<T> {
    entries: DashMap<String, Entry<T>>,
    frequencies: DashMap<String, u32>,
    default_ttl: Duration,
    max_entries: usize,
}

impl<T> MemoryCache<T> {
    pub fn new(default_ttl_secs: i64, max_entries: i64) -> Result<Self, CacheError> {
        if default_ttl_secs < 0 {
            return Err(CacheError::InvalidTtl);
        }
        if max_entries <= 0 {
            return Err(CacheError::InvalidMaxSize);
        }
        let max_entries = usize::try_from(max_entries).map_err(|_| CacheError::InvalidMaxSize)?;

        Ok(Self {
            entries: DashMap::new(),
            frequencies: DashMap::new(),
            default_ttl: Duration::from_secs(default_ttl_secs.unsigned_abs()),
            max_entries,
        })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record_access(&self, key: &str) {
        if self.frequencies.len() >= self.max_entries.saturating_mul(COUNTERS_PER_ENTRY) {
            self.frequencies.clear();
        }
        let mut count = self.frequencies.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
    }

    fn frequency(&self, key: &str) -> u32 {
        self.frequencies.get(key).map(|count| *count).unwrap_or(0)
    }

    fn purge_expired(&self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn admit(&self, key: &str, now: Instant) -> bool {
        if self.entries.contains_key(key) || self.entries.len() < self.max_entries {
            return true;
        }

        self.purge_expired(now);
        if self.entries.len() < self.max_entries {
            return true;
        }

        let victim = self
            .entries
            .iter()
            .take(EVICTION_SAMPLE)
            .map(|entry| (entry.key().clone(), entry.hits.load(Ordering::Relaxed)))
            .min_by_key(|(_, hits)| *hits);

        match victim {
            Some((victim_key, hits)) if self.frequency(key) >= hits => {
                trace!("evicting cache entry {} ({} hits)", victim_key, hits);
                self.entries.remove(&victim_key);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl<T> Cache<T> for MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        self.record_access(key);
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Err(CacheError::NotFound)
    }

    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let now = Instant::now();

        if !self.admit(key, now) {
            debug!("cache admission rejected for key {}", key);
            return Err(CacheError::AddFailed);
        }

        let expires_at = if ttl.is_zero() { None } else { Some(now + ttl) };
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                hits: AtomicU32::new(0),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}
