//! Provider reachability cache.
//!
//! Capability checks for remote tiers are cheap only if they do not probe
//! the provider on every query. [`ProviderHealth`] remembers the last
//! probe result per provider for a short TTL; a failed call invalidates
//! the entry immediately by recording the provider as unreachable.
//!
//! One instance is created at startup and owned by the pipeline; tiers
//! receive a shared handle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    reachable: bool,
    checked_at: Instant,
}

#[derive(Debug)]
pub struct ProviderHealth {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProviderHealth {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached reachability, or `None` if never checked or expired.
    pub fn cached(&self, provider: &str) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(provider)
            .filter(|e| e.checked_at.elapsed() < self.ttl)
            .map(|e| e.reachable)
    }

    /// Last recorded reachability regardless of age.
    pub fn last_known(&self, provider: &str) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(provider).map(|e| e.reachable)
    }

    pub fn record(&self, provider: &str, reachable: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            provider.to_string(),
            Entry {
                reachable,
                checked_at: Instant::now(),
            },
        );
    }

    /// Record a failed call. The provider stays unavailable until the TTL
    /// lapses and a fresh probe succeeds.
    pub fn mark_unhealthy(&self, provider: &str) {
        self.record(provider, false);
    }

    /// Forget a provider so the next capability check probes it.
    pub fn invalidate(&self, provider: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(provider);
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.reachable))
            .collect()
    }
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
