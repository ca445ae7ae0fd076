//! Idempotency registry: at-most-one handler invocation per live key.
//!
//! The key namespace is client-provided (`Idempotency-Key` header). A record
//! is inserted locked before the handler runs; concurrent callers wait on the
//! lock and receive the stored response once the winner completes. A handler
//! failure deletes the row so a later retry can run again.

#![forbid(unsafe_code)]

use aegis_proto::IdempotencyRecord;
use aegis_store::OpsStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyConfig {
    /// How long a completed record answers for its key.
    pub ttl: ChronoDuration,
    /// Poll interval while another caller holds the lock.
    pub poll: Duration,
    /// Give up waiting after this long and report Busy.
    pub max_wait: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: ChronoDuration::hours(24),
            poll: Duration::from_millis(500),
            max_wait: Duration::from_secs(30),
        }
    }
}

/// What the wrapped handler produces on success.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

/// What callers of [`IdempotencyRegistry::execute`] receive.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub status_code: u16,
    pub body: serde_json::Value,
    pub cached: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError<E> {
    /// Another caller has held the key's lock past the wait bound.
    #[error("idempotency key '{0}' is busy")]
    Busy(String),
    #[error("store: {0}")]
    Store(#[from] aegis_store::StoreError),
    #[error("{0}")]
    Handler(E),
}

enum Acquisition {
    /// We won the insert; run the handler.
    Acquired,
    /// A completed record already answers for the key.
    Cached(IdempotencyRecord),
}

pub struct IdempotencyRegistry {
    store: Arc<OpsStore>,
    config: IdempotencyConfig,
}

impl IdempotencyRegistry {
    pub fn new(store: Arc<OpsStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    /// Run `f` at most once per live `key`.
    ///
    /// Exactly one concurrent caller executes `f`; the rest receive the
    /// winner's stored response with `cached: true` once it lands.
    pub async fn execute<F, Fut, E>(
        &self,
        key: &str,
        f: F,
    ) -> Result<ExecuteOutcome, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerResponse, E>>,
    {
        match self.acquire(key).await? {
            Acquisition::Cached(record) => Ok(ExecuteOutcome {
                status_code: record.status_code.unwrap_or(200),
                body: record.response_body.unwrap_or(serde_json::Value::Null),
                cached: true,
            }),
            Acquisition::Acquired => match f().await {
                Ok(response) => {
                    self.store
                        .complete_idempotency(key, response.status_code, response.body.clone())?;
                    debug!(key, status = response.status_code, "idempotent response stored");
                    Ok(ExecuteOutcome {
                        status_code: response.status_code,
                        body: response.body,
                        cached: false,
                    })
                }
                Err(e) => {
                    // Free the key so a later retry can run the handler again.
                    self.store.delete_idempotency(key);
                    Err(IdempotencyError::Handler(e))
                }
            },
        }
    }

    async fn acquire<E>(&self, key: &str) -> Result<Acquisition, IdempotencyError<E>> {
        let deadline = Instant::now() + self.config.max_wait;
        loop {
            if let Some(record) = self.store.get_idempotency(key) {
                if !record.locked {
                    return Ok(Acquisition::Cached(record));
                }
                if Instant::now() >= deadline {
                    return Err(IdempotencyError::Busy(key.to_string()));
                }
                tokio::time::sleep(self.config.poll).await;
                continue;
            }

            let now = Utc::now();
            let inserted = self.store.insert_idempotency_if_absent(IdempotencyRecord {
                id: key.to_string(),
                response_body: None,
                status_code: None,
                locked: true,
                locked_at: Some(now),
                created_at: now,
                expires_at: now + self.config.ttl,
            });
            if inserted {
                return Ok(Acquisition::Acquired);
            }
            // Lost the insert race; fall back onto the waiting branch.
        }
    }

    /// Garbage-collect expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = self.store.purge_expired_idempotency(Utc::now());
        if removed > 0 {
            info!(removed, "purged expired idempotency records");
        }
        removed
    }
}

// ─── Duplicate-transaction detection ─────────────────────────────────────────

/// Flags repeated business actions (same sale key twice within a short
/// window) using prefixed idempotency records with a short TTL.
pub struct DuplicateDetector {
    store: Arc<OpsStore>,
    window: ChronoDuration,
}

impl DuplicateDetector {
    pub fn new(store: Arc<OpsStore>, window: ChronoDuration) -> Self {
        Self { store, window }
    }

    /// Record the action and report whether a matching action was already
    /// seen inside the window.
    pub fn observe(&self, business_key: &str) -> bool {
        let now = Utc::now();
        let prefix = format!("dup:{business_key}:");
        let duplicate = self
            .store
            .idempotency_keys_with_prefix(&prefix)
            .iter()
            .any(|r| now.signed_duration_since(r.created_at) <= self.window);

        self.store.insert_idempotency_if_absent(IdempotencyRecord {
            id: format!("{prefix}{}", now.timestamp_millis()),
            response_body: None,
            status_code: None,
            locked: false,
            locked_at: None,
            created_at: now,
            expires_at: now + self.window * 2,
        });
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(config: IdempotencyConfig) -> (tempfile::TempDir, Arc<OpsStore>, IdempotencyRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let registry = IdempotencyRegistry::new(store.clone(), config);
        (dir, store, registry)
    }

    fn ok_response() -> HandlerResponse {
        HandlerResponse {
            status_code: 201,
            body: serde_json::json!({"id": "A"}),
        }
    }

    #[tokio::test]
    async fn test_first_call_executes_second_is_cached() {
        let (_dir, _store, registry) = registry(IdempotencyConfig::default());

        let first = registry
            .execute("K1", || async { Ok::<_, String>(ok_response()) })
            .await
            .expect("first");
        assert!(!first.cached);
        assert_eq!(first.status_code, 201);

        let second = registry
            .execute::<_, _, String>("K1", || async {
                panic!("handler must not run twice for a live key")
            })
            .await
            .expect("second");
        assert!(second.cached);
        assert_eq!(second.body["id"], "A");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_callers_one_invocation() {
        let (_dir, store, registry) = registry(IdempotencyConfig {
            poll: Duration::from_millis(20),
            ..Default::default()
        });
        let registry = Arc::new(registry);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .execute("K-conc", move || async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, String>(ok_response())
                    })
                    .await
                    .expect("execute")
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.expect("join"));
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(|o| o.body["id"] == "A"));
        assert_eq!(outcomes.iter().filter(|o| o.cached).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.cached).count(), 1);

        let record = store.get_idempotency("K-conc").expect("record");
        assert!(!record.locked);
        assert!(record.response_body.is_some());
    }

    #[tokio::test]
    async fn test_handler_failure_frees_key() {
        let (_dir, store, registry) = registry(IdempotencyConfig::default());

        let result = registry
            .execute("K-fail", || async { Err::<HandlerResponse, _>("boom") })
            .await;
        assert!(matches!(result, Err(IdempotencyError::Handler("boom"))));
        assert!(store.get_idempotency("K-fail").is_none());

        // A retry runs the handler again.
        let retry = registry
            .execute("K-fail", || async { Ok::<_, String>(ok_response()) })
            .await
            .expect("retry");
        assert!(!retry.cached);
    }

    #[tokio::test]
    async fn test_busy_after_wait_bound() {
        let (_dir, store, registry) = registry(IdempotencyConfig {
            poll: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
            ..Default::default()
        });

        // Simulate a caller that locked the key and never finished.
        let now = Utc::now();
        store.insert_idempotency_if_absent(IdempotencyRecord {
            id: "K-stuck".to_string(),
            response_body: None,
            status_code: None,
            locked: true,
            locked_at: Some(now),
            created_at: now,
            expires_at: now + ChronoDuration::hours(24),
        });

        let result = registry
            .execute("K-stuck", || async { Ok::<_, String>(ok_response()) })
            .await;
        assert!(matches!(result, Err(IdempotencyError::Busy(_))));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_dir, store, registry) = registry(IdempotencyConfig::default());
        let now = Utc::now();
        store.insert_idempotency_if_absent(IdempotencyRecord {
            id: "gone".to_string(),
            response_body: None,
            status_code: None,
            locked: false,
            locked_at: None,
            created_at: now - ChronoDuration::hours(48),
            expires_at: now - ChronoDuration::hours(24),
        });
        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_detector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let detector = DuplicateDetector::new(store, ChronoDuration::minutes(5));

        assert!(!detector.observe("sale:shop-1:cust-9:4200"));
        assert!(detector.observe("sale:shop-1:cust-9:4200"));
        assert!(!detector.observe("sale:shop-1:cust-9:9900"));
    }
}
