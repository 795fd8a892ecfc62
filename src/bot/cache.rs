//! Memoized answers to budget questions.
//!
//! Keys combine the normalized question with a digest of the data the
//! answer was computed from, so a changed ledger misses without explicit
//! invalidation.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::model::{CategoryBudget, Transaction};
use crate::store::TtlStore;

/// Transactions included in the snapshot digest.
const SNAPSHOT_TRANSACTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub answer: String,
    pub was_cached: bool,
    /// Seconds since the answer was computed; 0 for fresh answers.
    pub age_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

pub struct ResponseCache {
    store: Box<dyn TtlStore>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0]);
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

fn normalize(question: &str) -> String {
    question.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

impl ResponseCache {
    pub fn new(store: Box<dyn TtlStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl: Duration::seconds(ttl_secs as i64),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(question: &str, summary: &[CategoryBudget], recent: &[Transaction]) -> String {
        let question_hash = digest(&[normalize(question).as_bytes()]);
        let head = &recent[..recent.len().min(SNAPSHOT_TRANSACTIONS)];
        let summary_json = serde_json::to_string(summary).unwrap_or_default();
        let recent_json = serde_json::to_string(head).unwrap_or_default();
        let data_hash = digest(&[summary_json.as_bytes(), recent_json.as_bytes()]);
        format!("{question_hash}_{data_hash}")
    }

    /// Stored answer if fresh, otherwise `compute`'s result, stored at `now`.
    /// Compute errors are returned and nothing is stored.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        question: &str,
        summary: &[CategoryBudget],
        recent: &[Transaction],
        now: DateTime<Utc>,
        compute: F,
    ) -> Result<CachedAnswer, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let key = Self::key(question, summary, recent);

        match self.store.get(&key) {
            Ok(Some(entry)) => {
                let age = now - entry.created_at;
                if age < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Answer cache hit ({}s old)", age.num_seconds());
                    return Ok(CachedAnswer { answer: entry.value, was_cached: true, age_secs: age.num_seconds() });
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Answer cache lookup failed: {}", e),
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let answer = compute().await?;

        if let Err(e) = self.store.put(&key, &answer, now) {
            warn!("Answer cache write failed: {}", e);
        }
        match self.store.purge_older_than(now - self.ttl) {
            Ok(0) => {}
            Ok(n) => debug!("Swept {} expired answers", n),
            Err(e) => warn!("Answer cache sweep failed: {}", e),
        }

        Ok(CachedAnswer { answer, was_cached: false, age_secs: 0 })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.store.len().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, TimeZone};
    use std::convert::Infallible;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    fn summary() -> Vec<CategoryBudget> {
        vec![CategoryBudget::new("קניות", 800.0)]
    }

    fn tx(amount: f64) -> Transaction {
        Transaction {
            category: "קניות".into(),
            description: "לחם".into(),
            amount,
            date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
        }
    }

    async fn ask(cache: &ResponseCache, q: &str, s: &[CategoryBudget], now: DateTime<Utc>, answer: &str) -> CachedAnswer {
        let answer = answer.to_string();
        cache
            .get_or_compute(q, s, &[], now, || async move { Ok::<_, Infallible>(answer) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_within_ttl_then_miss_after() {
        let cache = ResponseCache::new(Box::new(MemoryStore::new()), 300);

        let first = ask(&cache, "כמה נשאר?", &summary(), at(0), "נשארו 800").await;
        assert!(!first.was_cached);

        let second = ask(&cache, "כמה נשאר?", &summary(), at(100), "other").await;
        assert_eq!(second, CachedAnswer { answer: "נשארו 800".into(), was_cached: true, age_secs: 100 });

        let third = ask(&cache, "כמה נשאר?", &summary(), at(301), "fresh").await;
        assert!(!third.was_cached);
        assert_eq!(third.answer, "fresh");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
    }

    #[tokio::test]
    async fn test_question_is_normalized() {
        let cache = ResponseCache::new(Box::new(MemoryStore::new()), 300);
        ask(&cache, "How   much LEFT", &summary(), at(0), "a").await;
        assert!(ask(&cache, "  how much left ", &summary(), at(1), "b").await.was_cached);
    }

    #[tokio::test]
    async fn test_changed_data_misses() {
        let cache = ResponseCache::new(Box::new(MemoryStore::new()), 300);
        ask(&cache, "q", &summary(), at(0), "a").await;
        let changed = vec![CategoryBudget { spent: 12.0, remaining: 788.0, ..CategoryBudget::new("קניות", 800.0) }];
        assert!(!ask(&cache, "q", &changed, at(1), "b").await.was_cached);
    }

    #[test]
    fn test_key_uses_only_leading_transactions() {
        let s = summary();
        let five: Vec<_> = (0..5).map(|i| tx(i as f64)).collect();
        let mut six = five.clone();
        six.push(tx(99.0));
        assert_eq!(ResponseCache::key("q", &s, &five), ResponseCache::key("q", &s, &six));
        assert_ne!(ResponseCache::key("q", &s, &five), ResponseCache::key("q", &s, &five[1..]));
    }

    #[tokio::test]
    async fn test_sweep_on_write() {
        let cache = ResponseCache::new(Box::new(MemoryStore::new()), 300);
        ask(&cache, "a", &summary(), at(0), "1").await;
        ask(&cache, "b", &summary(), at(400), "2").await;
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_compute_error_not_cached() {
        let cache = ResponseCache::new(Box::new(MemoryStore::new()), 300);
        let result: Result<CachedAnswer, &str> =
            cache.get_or_compute("q", &summary(), &[], at(0), || async { Err("down") }).await;
        assert!(result.is_err());
        assert_eq!(cache.stats().size, 0);
    }
}
