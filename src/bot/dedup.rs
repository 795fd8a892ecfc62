//! Guard against the transport redelivering a message.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::TtlStore;

pub struct Deduplicator {
    store: Box<dyn TtlStore>,
    ttl: Duration,
    bucket_secs: i64,
}

impl Deduplicator {
    pub fn new(store: Box<dyn TtlStore>, ttl_secs: u64, bucket_secs: u64) -> Self {
        Self {
            store,
            ttl: Duration::seconds(ttl_secs as i64),
            bucket_secs: bucket_secs.max(1) as i64,
        }
    }

    /// Content key: sender, body and the time bucket `arrival` falls in.
    fn content_key(&self, sender: &str, body: &str, arrival: DateTime<Utc>) -> String {
        let bucket = arrival.timestamp().div_euclid(self.bucket_secs);
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update([0]);
        hasher.update(body.as_bytes());
        hasher.update([0]);
        hasher.update(bucket.to_be_bytes());
        format!("msg:{:x}", hasher.finalize())
    }

    /// True when this delivery was already seen within the TTL and must be
    /// dropped. Records the delivery otherwise. Store failures let the
    /// message through.
    pub fn seen(&self, sender: &str, body: &str, message_id: Option<&str>, arrival: DateTime<Utc>) -> bool {
        match self.check_and_record(sender, body, message_id, arrival) {
            Ok(duplicate) => duplicate,
            Err(e) => {
                warn!("Dedup store unavailable, letting message through: {}", e);
                false
            }
        }
    }

    fn check_and_record(
        &self,
        sender: &str,
        body: &str,
        message_id: Option<&str>,
        arrival: DateTime<Utc>,
    ) -> Result<bool, crate::store::StoreError> {
        self.store.purge_older_than(arrival - self.ttl)?;

        let id_key = message_id.filter(|id| !id.is_empty()).map(|id| format!("id:{id}"));
        let content_key = self.content_key(sender, body, arrival);

        // Each claim is a single store step, so concurrent copies of one
        // delivery cannot both pass.
        if let Some(key) = &id_key {
            if !self.store.insert_if_absent(key, sender, arrival)? {
                debug!("Duplicate delivery of message id {}", key);
                return Ok(true);
            }
        }
        if !self.store.insert_if_absent(&content_key, sender, arrival)? {
            debug!("Duplicate content from {} within bucket", sender);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use chrono::TimeZone;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    fn dedup() -> Deduplicator {
        Deduplicator::new(Box::new(MemoryStore::new()), 60, 10)
    }

    #[test]
    fn test_same_message_in_bucket_is_duplicate() {
        let d = dedup();
        assert!(!d.seen("972501", "קפה 12", None, at(0)));
        assert!(d.seen("972501", "קפה 12", None, at(3)));
    }

    #[test]
    fn test_different_sender_or_body_passes() {
        let d = dedup();
        assert!(!d.seen("972501", "קפה 12", None, at(0)));
        assert!(!d.seen("972502", "קפה 12", None, at(0)));
        assert!(!d.seen("972501", "קפה 13", None, at(0)));
    }

    #[test]
    fn test_next_bucket_passes_without_id() {
        let d = dedup();
        assert!(!d.seen("972501", "קפה 12", None, at(0)));
        assert!(!d.seen("972501", "קפה 12", None, at(10)));
    }

    #[test]
    fn test_message_id_catches_cross_bucket_redelivery() {
        let d = dedup();
        assert!(!d.seen("972501", "קפה 12", Some("wamid.1"), at(9)));
        assert!(d.seen("972501", "קפה 12", Some("wamid.1"), at(11)));
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let d = dedup();
        assert!(!d.seen("972501", "קפה 12", Some("wamid.1"), at(0)));
        assert!(!d.seen("972501", "קפה 12", Some("wamid.1"), at(61)));
    }

    #[test]
    fn test_sqlite_backend() {
        let d = Deduplicator::new(Box::new(SqliteStore::in_memory("dedup").unwrap()), 60, 10);
        assert!(!d.seen("972501", "x", Some("id"), at(0)));
        assert!(d.seen("972501", "x", Some("id"), at(1)));
    }

    fn concurrent_passes(store: Box<dyn TtlStore>) -> usize {
        let d = Arc::new(Deduplicator::new(store, 60, 10));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    !d.seen("972501", "קפה 12", Some("wamid.X"), at(0))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).filter(|passed| *passed).count()
    }

    #[test]
    fn test_simultaneous_copies_pass_once_sqlite() {
        for _ in 0..200 {
            let store = Box::new(SqliteStore::in_memory("dedup").unwrap());
            assert_eq!(concurrent_passes(store), 1);
        }
    }

    #[test]
    fn test_simultaneous_copies_pass_once_memory() {
        for _ in 0..200 {
            assert_eq!(concurrent_passes(Box::new(MemoryStore::new())), 1);
        }
    }
}
